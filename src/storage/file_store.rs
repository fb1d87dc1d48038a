use crate::commitlog::{Index, LogEntry};
use crate::replica::{ReplicaId, Term};
use crate::storage::journal::Journal;
use crate::storage::records::JournalEntry;
use crate::storage::snapshot_store::FileSnapshotStore;
use crate::storage::{PersistentStore, RecoveredState, SnapshotStore};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

const JOURNAL_FILE_NAME: &str = "journal.log";
const SNAPSHOT_DIR_NAME: &str = "snapshots";
const DEFAULT_JOURNAL_REWRITE_THRESHOLD: usize = 4096;

/// FileStore keeps a replica's durable state in one directory:
///
/// - `journal.log`: framed, checksummed journal records, fsync'd on every write.
/// - `snapshots/`: the latest snapshot. See `FileSnapshotStore`.
///
/// Snapshot compaction only appends a marker to the journal. Once enough records have accumulated,
/// the next compaction also rewrites the journal down to its live records.
pub struct FileStore {
    logger: slog::Logger,
    journal: Journal,
    snapshots: Arc<FileSnapshotStore>,
    rewrite_threshold: usize,
    records_since_rewrite: usize,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(logger: slog::Logger, directory: P) -> io::Result<Self> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let journal = Journal::open(logger.clone(), directory.join(JOURNAL_FILE_NAME))?;
        let snapshots = FileSnapshotStore::open(logger.clone(), directory.join(SNAPSHOT_DIR_NAME))?;

        Ok(FileStore {
            logger,
            journal,
            snapshots: Arc::new(snapshots),
            rewrite_threshold: DEFAULT_JOURNAL_REWRITE_THRESHOLD,
            records_since_rewrite: 0,
        })
    }

    /// Number of journal records written since the last rewrite before a compaction marker also
    /// triggers a rewrite.
    pub fn with_journal_rewrite_threshold(mut self, threshold: usize) -> Self {
        self.rewrite_threshold = threshold;
        self
    }

    fn append(&mut self, records: &[JournalEntry]) -> io::Result<()> {
        self.journal.append(records)?;
        self.records_since_rewrite += records.len();
        Ok(())
    }

    fn rewrite_journal(&mut self) -> io::Result<()> {
        let live_records = self.journal.replay()?.live_records();
        self.journal.rewrite(&live_records)?;
        self.records_since_rewrite = live_records.len();
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn recover(&mut self) -> io::Result<RecoveredState> {
        let snapshot = self.snapshots.load_latest()?;
        let replay = self.journal.replay()?;
        self.records_since_rewrite = replay.live_records().len();
        Ok(replay.finish(snapshot))
    }

    fn store_term_and_vote(&mut self, term: Term, voted_for: Option<&ReplicaId>) -> io::Result<()> {
        self.append(&[JournalEntry::TermVote {
            term,
            voted_for: voted_for.cloned(),
        }])
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let records: Vec<_> = entries.iter().cloned().map(JournalEntry::LogEntry).collect();
        self.append(&records)
    }

    fn truncate_entries_from(&mut self, index: Index) -> io::Result<()> {
        self.append(&[JournalEntry::TruncateEntries { from: index }])
    }

    fn store_commit_index(&mut self, index: Index) -> io::Result<()> {
        self.append(&[JournalEntry::CommitIndex(index)])
    }

    fn discard_entries_through(&mut self, term: Term, index: Index) -> io::Result<()> {
        self.append(&[JournalEntry::DeleteEntries { through: (term, index) }])?;

        if self.records_since_rewrite >= self.rewrite_threshold {
            slog::info!(
                self.logger,
                "Journal has {} records since last rewrite. Rewriting.",
                self.records_since_rewrite
            );
            self.rewrite_journal()?;
        }
        Ok(())
    }

    fn snapshot_store(&self) -> Arc<dyn SnapshotStore> {
        self.snapshots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::EntryPayload;
    use crate::storage::records::SNAPSHOT_FORMAT_VERSION;
    use crate::storage::Snapshot;
    use crate::replica::ServerConfiguration;
    use crate::test_utils;
    use bytes::Bytes;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            client_request_id: Some(format!("req-{}", index)),
            payload: EntryPayload::Command(Bytes::from(format!("cmd-{}", index))),
        }
    }

    fn open(dir: &Path) -> FileStore {
        FileStore::open(test_utils::test_logger(), dir).unwrap()
    }

    #[test]
    fn empty_directory_recovers_to_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = open(dir.path()).recover().unwrap();

        assert_eq!(state.term, Term::new(0));
        assert_eq!(state.voted_for, None);
        assert!(state.entries.is_empty());
        assert!(state.snapshot.is_none());
        assert_eq!(state.commit_index, None);
    }

    #[test]
    fn state_survives_reopen() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        store.recover().unwrap();

        // -- execute --
        store.store_term_and_vote(Term::new(3), Some(&ReplicaId::new("b"))).unwrap();
        store.append_entries(&[entry(1, 1), entry(2, 2), entry(3, 3)]).unwrap();
        store.truncate_entries_from(Index::new(3)).unwrap();
        store.append_entries(&[entry(3, 3)]).unwrap();
        store.store_commit_index(Index::new(2)).unwrap();
        drop(store);

        // -- verify --
        let state = open(dir.path()).recover().unwrap();
        assert_eq!(state.term, Term::new(3));
        assert_eq!(state.voted_for, Some(ReplicaId::new("b")));
        assert_eq!(state.entries, vec![entry(1, 1), entry(2, 2), entry(3, 3)]);
        assert_eq!(state.commit_index, Some(Index::new(2)));
    }

    #[test]
    fn torn_tail_is_repaired() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        store.recover().unwrap();
        store.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
        drop(store);

        // Crash in the middle of appending a record.
        let journal_path = dir.path().join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&journal_path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        // -- execute --
        let mut store = open(dir.path());
        let state = store.recover().unwrap();
        store.append_entries(&[entry(1, 3)]).unwrap();
        drop(store);

        // -- verify --
        assert_eq!(state.entries, vec![entry(1, 1), entry(1, 2)]);
        let state = open(dir.path()).recover().unwrap();
        assert_eq!(state.entries, vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
    }

    #[test]
    fn compaction_rewrites_journal_past_threshold() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path()).with_journal_rewrite_threshold(10);
        store.recover().unwrap();
        let entries: Vec<_> = (1..=20).map(|i| entry(1, i)).collect();
        store.append_entries(&entries).unwrap();
        store.store_commit_index(Index::new(20)).unwrap();
        let journal_path = dir.path().join(JOURNAL_FILE_NAME);
        let size_before = fs::metadata(&journal_path).unwrap().len();

        // -- execute --
        store
            .snapshot_store()
            .save(
                &Snapshot {
                    last_included: (Term::new(1), Index::new(15)),
                    state: Bytes::from_static(b"sm"),
                    server_config: ServerConfiguration::default(),
                    unapplied_entries: entries[15..].to_vec(),
                    client_sessions: vec![],
                    format_version: SNAPSHOT_FORMAT_VERSION,
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        store.discard_entries_through(Term::new(1), Index::new(15)).unwrap();
        drop(store);

        // -- verify --
        assert!(fs::metadata(&journal_path).unwrap().len() < size_before);
        let state = open(dir.path()).recover().unwrap();
        assert_eq!(state.entries, entries[15..].to_vec());
        assert_eq!(state.commit_index, Some(Index::new(20)));
        assert_eq!(
            state.snapshot.map(|s| s.last_included),
            Some((Term::new(1), Index::new(15)))
        );
    }
}
