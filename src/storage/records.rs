use crate::commitlog::{EntryPayload, Index, LogEntry};
use crate::journal::{
    journal_record, log_entry_record, ClientSessionRecord, CommitIndexRecord, DeleteEntriesRecord, JournalRecord,
    LogEntryRecord, NoopRecord, ServerConfigRecord, ServerMemberRecord, SnapshotRecord, TermVoteRecord,
    TruncateEntriesRecord,
};
use crate::replica::{ReplicaId, ServerConfiguration, ServerInfo, Term};
use bytes::Bytes;
use prost::Message;
use std::net::SocketAddr;
use std::{fmt, io};

pub(crate) const JOURNAL_FORMAT_VERSION: u32 = 1;
pub(crate) const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One durable mutation. The journal is an ordered sequence of these, and replaying them from the
/// start rebuilds the term, vote, log and commit marker.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum JournalEntry {
    LogEntry(LogEntry),
    TermVote {
        term: Term,
        voted_for: Option<ReplicaId>,
    },
    /// Entries at or below `through` are covered by a snapshot.
    DeleteEntries {
        through: (Term, Index),
    },
    /// Entries at or above `from` were removed by conflict repair.
    TruncateEntries {
        from: Index,
    },
    CommitIndex(Index),
}

impl JournalEntry {
    pub(crate) fn encode(&self) -> io::Result<Vec<u8>> {
        let record = match self {
            JournalEntry::LogEntry(entry) => journal_record::Record::LogEntry(log_entry_to_record(entry)),
            JournalEntry::TermVote { term, voted_for } => journal_record::Record::TermVote(TermVoteRecord {
                term: term.as_u64(),
                voted_for: voted_for
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_default(),
            }),
            JournalEntry::DeleteEntries {
                through: (term, index),
            } => journal_record::Record::DeleteEntries(DeleteEntriesRecord {
                through_index: index.as_u64(),
                through_term: term.as_u64(),
            }),
            JournalEntry::TruncateEntries { from } => {
                journal_record::Record::TruncateEntries(TruncateEntriesRecord {
                    from_index: from.as_u64(),
                })
            }
            JournalEntry::CommitIndex(index) => {
                journal_record::Record::CommitIndex(CommitIndexRecord { index: index.as_u64() })
            }
        };

        encode_message(&JournalRecord {
            version: JOURNAL_FORMAT_VERSION,
            record: Some(record),
        })
    }

    /// Returns `Ok(None)` for a well-formed record of a kind this binary doesn't know about.
    pub(crate) fn decode(bytes: &[u8]) -> io::Result<Option<JournalEntry>> {
        let record = JournalRecord::decode(bytes).map_err(invalid_data)?;
        if record.version > JOURNAL_FORMAT_VERSION {
            return Err(invalid_data(format!(
                "Journal record version {} is newer than supported version {}",
                record.version, JOURNAL_FORMAT_VERSION
            )));
        }

        let entry = match record.record {
            None => return Ok(None),
            Some(journal_record::Record::LogEntry(entry)) => JournalEntry::LogEntry(log_entry_from_record(entry)?),
            Some(journal_record::Record::TermVote(vote)) => JournalEntry::TermVote {
                term: Term::new(vote.term),
                voted_for: if vote.voted_for.is_empty() {
                    None
                } else {
                    Some(ReplicaId::new(vote.voted_for))
                },
            },
            Some(journal_record::Record::DeleteEntries(delete)) => JournalEntry::DeleteEntries {
                through: (
                    Term::new(delete.through_term),
                    non_zero_index(delete.through_index, "DeleteEntries")?,
                ),
            },
            Some(journal_record::Record::TruncateEntries(truncate)) => JournalEntry::TruncateEntries {
                from: non_zero_index(truncate.from_index, "TruncateEntries")?,
            },
            Some(journal_record::Record::CommitIndex(commit)) => {
                JournalEntry::CommitIndex(non_zero_index(commit.index, "CommitIndex")?)
            }
        };

        Ok(Some(entry))
    }
}

/// Client request ids whose entries have been applied, kept so retries are answered from the
/// original result instead of being applied a second time.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClientSession {
    pub(crate) client_request_id: String,
    pub(crate) entry: (Term, Index),
}

/// Point-in-time image of the state machine plus the metadata needed to resume the log after it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) last_included: (Term, Index),
    pub(crate) state: Bytes,
    pub(crate) server_config: ServerConfiguration,
    // Entries past `last_included` that existed when the snapshot was taken. Used on local
    // recovery only; a leader shipping this snapshot doesn't expect followers to use them.
    pub(crate) unapplied_entries: Vec<LogEntry>,
    pub(crate) client_sessions: Vec<ClientSession>,
    pub(crate) format_version: u32,
}

impl Snapshot {
    pub(crate) fn new(
        last_included: (Term, Index),
        state: Bytes,
        server_config: ServerConfiguration,
        unapplied_entries: Vec<LogEntry>,
        client_sessions: Vec<ClientSession>,
    ) -> Self {
        Snapshot {
            last_included,
            state,
            server_config,
            unapplied_entries,
            client_sessions,
            format_version: SNAPSHOT_FORMAT_VERSION,
        }
    }

    /// A snapshot written by an older format is rewritten at the next opportunity.
    pub(crate) fn needs_migration(&self) -> bool {
        self.format_version < SNAPSHOT_FORMAT_VERSION
    }

    pub(crate) fn encode(&self) -> io::Result<EncodedSnapshot> {
        let (term, index) = self.last_included;
        let record = SnapshotRecord {
            version: SNAPSHOT_FORMAT_VERSION,
            last_included_index: index.as_u64(),
            last_included_term: term.as_u64(),
            state: self.state.to_vec(),
            server_config: Some(server_config_to_record(&self.server_config)),
            unapplied_entries: self.unapplied_entries.iter().map(log_entry_to_record).collect(),
            client_sessions: self
                .client_sessions
                .iter()
                .map(|session| ClientSessionRecord {
                    client_request_id: session.client_request_id.clone(),
                    index: session.entry.1.as_u64(),
                    term: session.entry.0.as_u64(),
                })
                .collect(),
        };

        Ok(EncodedSnapshot {
            last_included: self.last_included,
            data: Bytes::from(encode_message(&record)?),
        })
    }

    pub(crate) fn decode(bytes: &[u8]) -> io::Result<Snapshot> {
        let record = SnapshotRecord::decode(bytes).map_err(invalid_data)?;
        if record.version > SNAPSHOT_FORMAT_VERSION {
            return Err(invalid_data(format!(
                "Snapshot version {} is newer than supported version {}",
                record.version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let last_included = (
            Term::new(record.last_included_term),
            non_zero_index(record.last_included_index, "Snapshot")?,
        );
        let server_config = match record.server_config {
            Some(config) => server_config_from_record(config)?,
            None => return Err(invalid_data("Snapshot is missing its server configuration")),
        };

        let mut unapplied_entries = Vec::with_capacity(record.unapplied_entries.len());
        for entry in record.unapplied_entries {
            unapplied_entries.push(log_entry_from_record(entry)?);
        }

        let mut client_sessions = Vec::with_capacity(record.client_sessions.len());
        for session in record.client_sessions {
            client_sessions.push(ClientSession {
                entry: (Term::new(session.term), non_zero_index(session.index, "ClientSession")?),
                client_request_id: session.client_request_id,
            });
        }

        Ok(Snapshot {
            last_included,
            state: Bytes::from(record.state),
            server_config,
            unapplied_entries,
            client_sessions,
            format_version: record.version,
        })
    }
}

/// Serialized snapshot, shared between the snapshot store and in-flight transfers to followers.
#[derive(Clone)]
pub(crate) struct EncodedSnapshot {
    pub(crate) last_included: (Term, Index),
    pub(crate) data: Bytes,
}

impl fmt::Debug for EncodedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodedSnapshot(LastIncluded={:?}, Bytes={})",
            self.last_included,
            self.data.len()
        )
    }
}

// ------- Conversions --------

fn log_entry_to_record(entry: &LogEntry) -> LogEntryRecord {
    let payload = match &entry.payload {
        EntryPayload::Command(data) => log_entry_record::Payload::Command(data.to_vec()),
        EntryPayload::ServerConfig(config) => log_entry_record::Payload::Config(server_config_to_record(config)),
        EntryPayload::Noop => log_entry_record::Payload::Noop(NoopRecord {}),
    };

    LogEntryRecord {
        index: entry.index.as_u64(),
        term: entry.term.as_u64(),
        client_request_id: entry.client_request_id.clone().unwrap_or_default(),
        payload: Some(payload),
    }
}

fn log_entry_from_record(record: LogEntryRecord) -> io::Result<LogEntry> {
    let payload = match record.payload {
        Some(log_entry_record::Payload::Command(data)) => EntryPayload::Command(Bytes::from(data)),
        Some(log_entry_record::Payload::Config(config)) => EntryPayload::ServerConfig(server_config_from_record(config)?),
        Some(log_entry_record::Payload::Noop(_)) => EntryPayload::Noop,
        None => return Err(invalid_data("Log entry record has no payload")),
    };

    Ok(LogEntry {
        index: non_zero_index(record.index, "LogEntry")?,
        term: Term::new(record.term),
        client_request_id: if record.client_request_id.is_empty() {
            None
        } else {
            Some(record.client_request_id)
        },
        payload,
    })
}

fn server_config_to_record(config: &ServerConfiguration) -> ServerConfigRecord {
    ServerConfigRecord {
        members: config
            .members()
            .iter()
            .map(|member| ServerMemberRecord {
                replica_id: member.replica_id.as_str().to_string(),
                addr: member.addr.to_string(),
                voting: member.voting,
            })
            .collect(),
    }
}

fn server_config_from_record(record: ServerConfigRecord) -> io::Result<ServerConfiguration> {
    let mut members = Vec::with_capacity(record.members.len());
    for member in record.members {
        let addr: SocketAddr = member
            .addr
            .parse()
            .map_err(|e| invalid_data(format!("Bad member address '{}': {}", member.addr, e)))?;
        members.push(ServerInfo {
            replica_id: ReplicaId::new(member.replica_id),
            addr,
            voting: member.voting,
        });
    }

    Ok(ServerConfiguration::new(members))
}

fn non_zero_index(index: u64, record_kind: &str) -> io::Result<Index> {
    Index::from_u64(index).ok_or_else(|| invalid_data(format!("{} record has index 0", record_kind)))
}

fn encode_message<M: Message>(message: &M) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(buf)
}

pub(crate) fn invalid_data<E>(error: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, error)
}
