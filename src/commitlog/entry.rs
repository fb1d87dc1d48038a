use crate::commitlog::Index;
use crate::replica::{ServerConfiguration, Term};
use bytes::Bytes;

/// A single slot in the replicated log.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LogEntry {
    pub(crate) index: Index,
    pub(crate) term: Term,
    // Present for client proposals that asked for exactly-once semantics.
    pub(crate) client_request_id: Option<String>,
    pub(crate) payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    /// Opaque bytes handed to the application state machine.
    Command(Bytes),
    /// The full member list that takes effect as soon as this entry is appended.
    ServerConfig(ServerConfiguration),
    /// Appended by a new leader so that it has an entry from its own term to commit.
    Noop,
}

impl LogEntry {
    pub(crate) fn id(&self) -> (Term, Index) {
        (self.term, self.index)
    }

    /// Approximate in-memory footprint, used for batching and snapshot thresholds.
    pub(crate) fn size_bytes(&self) -> usize {
        let payload_len = match &self.payload {
            EntryPayload::Command(data) => data.len(),
            EntryPayload::ServerConfig(config) => config
                .members()
                .iter()
                .map(|m| m.replica_id.as_str().len() + 32)
                .sum(),
            EntryPayload::Noop => 0,
        };
        let request_id_len = self.client_request_id.as_ref().map(|id| id.len()).unwrap_or(0);

        // Fixed overhead for index + term.
        16 + request_id_len + payload_len
    }

    pub(crate) fn server_config(&self) -> Option<&ServerConfiguration> {
        match &self.payload {
            EntryPayload::ServerConfig(config) => Some(config),
            _ => None,
        }
    }
}
