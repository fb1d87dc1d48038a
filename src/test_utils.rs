use crate::api::{RaftEntryId, StateMachine};
use crate::commitlog::Index;
use crate::replica::{ReplicaId, ServerConfiguration, ServerInfo, Term};
use crate::storage::Snapshot;
use bytes::Bytes;
use slog::Drain;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Discards everything unless `RAFT_TEST_LOG` is set.
pub(crate) fn test_logger() -> slog::Logger {
    if std::env::var_os("RAFT_TEST_LOG").is_none() {
        return slog::Logger::root(slog::Discard, slog::o!());
    }
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub(crate) fn server(id: &str, voting: bool) -> ServerInfo {
    let port = 7000 + id.bytes().map(|b| b as u16).sum::<u16>() % 1000;
    ServerInfo {
        replica_id: ReplicaId::new(id),
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        voting,
    }
}

pub(crate) fn voters(ids: &[&str]) -> ServerConfiguration {
    ServerConfiguration::new(ids.iter().map(|id| server(id, true)).collect())
}

pub(crate) fn snapshot_with(term: Term, index: Index, state: Bytes) -> Snapshot {
    Snapshot::new((term, index), state, voters(&["a"]), vec![], vec![])
}

/// Counts applied commands and answers each one with the new count. Clones share the count.
#[derive(Clone, Default)]
pub(crate) struct CountingStateMachine {
    count: Arc<Mutex<u64>>,
}

impl CountingStateMachine {
    pub(crate) fn count(&self) -> u64 {
        *self.count.lock().unwrap()
    }
}

impl StateMachine for CountingStateMachine {
    fn apply(&mut self, _entry_id: RaftEntryId, _payload: &Bytes) -> Bytes {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        Bytes::from(count.to_string())
    }

    fn snapshot(&self) -> Bytes {
        Bytes::from(self.count().to_string())
    }

    fn restore(&mut self, state: Bytes) {
        let restored = std::str::from_utf8(&state).unwrap().parse().unwrap();
        *self.count.lock().unwrap() = restored;
    }
}
