//! Durable state of a replica: the journal of term/vote/log mutations plus the latest snapshot.

mod file_store;
mod framing;
mod journal;
mod memory_store;
mod records;
mod replay;
mod snapshot_store;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub(crate) use records::{ClientSession, EncodedSnapshot, Snapshot};

use crate::commitlog::{Index, LogEntry};
use crate::replica::{ReplicaId, Term};
use std::io;
use std::sync::Arc;

/// PersistentStore is used by a replica for everything Raft requires to be durable before a
/// message is acknowledged. Every method returns only after the change is durable. Callers treat
/// any error as fatal for the replica.
pub(crate) trait PersistentStore: Send {
    /// Reads back everything previously stored. Called once, before any other method.
    fn recover(&mut self) -> io::Result<RecoveredState>;

    fn store_term_and_vote(&mut self, term: Term, voted_for: Option<&ReplicaId>) -> io::Result<()>;

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// Removes `index` and everything after it.
    fn truncate_entries_from(&mut self, index: Index) -> io::Result<()>;

    fn store_commit_index(&mut self, index: Index) -> io::Result<()>;

    /// Marks entries at or below `index` as covered by a durable snapshot.
    fn discard_entries_through(&mut self, term: Term, index: Index) -> io::Result<()>;

    fn snapshot_store(&self) -> Arc<dyn SnapshotStore>;
}

/// SnapshotStore is shared with blocking tasks so a large snapshot can be written off the actor.
pub(crate) trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &EncodedSnapshot) -> io::Result<()>;

    fn load_latest(&self) -> io::Result<Option<Snapshot>>;
}

#[derive(Debug)]
pub(crate) struct RecoveredState {
    pub(crate) term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) snapshot: Option<Snapshot>,
    // Contiguous journal entries that survived replay. May overlap the snapshot.
    pub(crate) entries: Vec<LogEntry>,
    pub(crate) commit_index: Option<Index>,
}

/// RaftStorage is the durable backend handed to a new shard.
pub struct RaftStorage {
    inner: Box<dyn PersistentStore>,
}

impl RaftStorage {
    pub(crate) fn into_inner(self) -> Box<dyn PersistentStore> {
        self.inner
    }
}

impl From<FileStore> for RaftStorage {
    fn from(store: FileStore) -> Self {
        RaftStorage { inner: Box::new(store) }
    }
}

impl From<MemoryStore> for RaftStorage {
    fn from(store: MemoryStore) -> Self {
        RaftStorage { inner: Box::new(store) }
    }
}
