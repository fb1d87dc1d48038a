use crate::commitlog::{Index, LogEntry};
use crate::replica::{ReplicaId, Term};
use crate::storage::records::{EncodedSnapshot, JournalEntry, Snapshot};
use crate::storage::replay::JournalReplay;
use crate::storage::{PersistentStore, RecoveredState, SnapshotStore};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// MemoryStore holds durable state in memory. Clones share the same state, so a test can drop a
/// replica and start a new one from the same store to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryStoreState>>,
}

#[derive(Default)]
struct MemoryStoreState {
    journal: Vec<JournalEntry>,
    snapshot: Option<EncodedSnapshot>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, records: Vec<JournalEntry>) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "MemoryStore write failure"));
        }
        state.journal.extend(records);
        Ok(())
    }

    fn replay(journal: &[JournalEntry]) -> io::Result<JournalReplay> {
        let mut replay = JournalReplay::new();
        for record in journal {
            replay.apply(record.clone())?;
        }
        Ok(replay)
    }
}

impl PersistentStore for MemoryStore {
    fn recover(&mut self) -> io::Result<RecoveredState> {
        let state = self.lock();
        let snapshot = match &state.snapshot {
            Some(encoded) => Some(Snapshot::decode(&encoded.data)?),
            None => None,
        };
        Ok(Self::replay(&state.journal)?.finish(snapshot))
    }

    fn store_term_and_vote(&mut self, term: Term, voted_for: Option<&ReplicaId>) -> io::Result<()> {
        self.write(vec![JournalEntry::TermVote {
            term,
            voted_for: voted_for.cloned(),
        }])
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.write(entries.iter().cloned().map(JournalEntry::LogEntry).collect())
    }

    fn truncate_entries_from(&mut self, index: Index) -> io::Result<()> {
        self.write(vec![JournalEntry::TruncateEntries { from: index }])
    }

    fn store_commit_index(&mut self, index: Index) -> io::Result<()> {
        self.write(vec![JournalEntry::CommitIndex(index)])
    }

    fn discard_entries_through(&mut self, term: Term, index: Index) -> io::Result<()> {
        self.write(vec![JournalEntry::DeleteEntries { through: (term, index) }])?;

        // Nothing to gain from keeping dead records around in memory.
        let mut state = self.lock();
        let live_records = Self::replay(&state.journal)?.live_records();
        state.journal = live_records;
        Ok(())
    }

    fn snapshot_store(&self) -> Arc<dyn SnapshotStore> {
        Arc::new(self.clone())
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &EncodedSnapshot) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "MemoryStore snapshot write failure"));
        }
        // Same as the file store: a late write of an older snapshot never hides a newer one.
        let is_newer = match &state.snapshot {
            Some(current) => current.last_included.1 <= snapshot.last_included.1,
            None => true,
        };
        if is_newer {
            state.snapshot = Some(snapshot.clone());
        }
        Ok(())
    }

    fn load_latest(&self) -> io::Result<Option<Snapshot>> {
        match &self.lock().snapshot {
            Some(encoded) => Snapshot::decode(&encoded.data).map(Some),
            None => Ok(None),
        }
    }
}
