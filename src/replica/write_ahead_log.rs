use crate::commitlog::{Index, LogEntry, ReplicatedLog};
use crate::replica::local_state::Term;
use crate::storage::{PersistentStore, SnapshotStore};
use std::io;
use std::sync::Arc;

/// WriteAheadLog is the raft-specific log facade. Every mutation goes to the durable store first
/// and is only mirrored into the in-memory log once the store call returned.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(crate) struct WriteAheadLog {
    log: ReplicatedLog,
    store: Box<dyn PersistentStore>,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
}

impl WriteAheadLog {
    pub(crate) fn new(log: ReplicatedLog, store: Box<dyn PersistentStore>, commit_index: Option<Index>) -> Self {
        if let Some(ci) = commit_index {
            assert!(
                Some(ci) <= log.last_index(),
                "Recovered commit index {:?} is past the end of the log {:?}",
                ci,
                log.last_index()
            );
        }

        WriteAheadLog {
            log,
            store,
            commit_index,
        }
    }

    pub(crate) fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.log.latest_entry()
    }

    pub(crate) fn next_index(&self) -> Index {
        self.log.next_index()
    }

    pub(crate) fn entry_at(&self, index: Index) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    pub(crate) fn term_at(&self, index: Index) -> Option<Term> {
        self.log.term_at(index)
    }

    pub(crate) fn append(&mut self, entries: Vec<LogEntry>) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.append_entries(&entries)?;
        self.log.append(entries);
        Ok(())
    }

    /// Remove anything starting at `index` and later. Returns how many entries were removed.
    pub(crate) fn truncate(&mut self, index: Index) -> io::Result<usize> {
        // Panic here, because losing a committed entry is a safety violation in our own logic.
        if let Some(ci) = self.commit_index {
            assert!(
                index > ci,
                "Can't truncate committed entries. TruncateFrom={:?}, CommitIndex={:?}",
                index,
                ci
            );
        }

        self.store.truncate_entries_from(index)?;
        Ok(self.log.truncate_from(index))
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    /// Moves the commit index forward and persists the commit marker. An index at or below the
    /// current one is ignored. Returns true if the commit index changed.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> io::Result<bool> {
        if Some(new_commit_index) <= self.commit_index {
            return Ok(false);
        }

        // Assert we only mark as committed if we have the entry locally.
        assert!(
            Some(new_commit_index) <= self.log.last_index(),
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            self.log.last_index(),
            new_commit_index,
        );

        self.store.store_commit_index(new_commit_index)?;
        self.commit_index.replace(new_commit_index);
        Ok(true)
    }

    /// Folds entries through `index` into a snapshot that is already durable.
    pub(crate) fn compact_through(&mut self, term: Term, index: Index) -> io::Result<()> {
        self.store.discard_entries_through(term, index)?;
        self.log.compact_through(term, index);
        Ok(())
    }

    /// Drops the whole log in favor of a durable snapshot ending at `(term, index)`. Everything up
    /// to `index` counts as committed afterwards.
    pub(crate) fn reset_to_snapshot(&mut self, term: Term, index: Index) -> io::Result<()> {
        self.store.discard_entries_through(term, index)?;
        self.store.truncate_entries_from(index.plus(1))?;
        self.log.reset_to_snapshot(term, index);
        if Some(index) > self.commit_index {
            self.commit_index.replace(index);
        }
        Ok(())
    }

    pub(crate) fn store_mut(&mut self) -> &mut dyn PersistentStore {
        self.store.as_mut()
    }

    pub(crate) fn snapshot_store(&self) -> Arc<dyn SnapshotStore> {
        self.store.snapshot_store()
    }
}
