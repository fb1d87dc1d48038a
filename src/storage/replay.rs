use crate::commitlog::{Index, LogEntry};
use crate::replica::{ReplicaId, Term};
use crate::storage::records::{invalid_data, JournalEntry};
use crate::storage::{RecoveredState, Snapshot};
use std::io;

/// JournalReplay folds journal records, oldest first, into the state they describe. Both store
/// implementations recover through this so they agree on what a sequence of records means.
pub(super) struct JournalReplay {
    term: Term,
    voted_for: Option<ReplicaId>,
    entries: Vec<LogEntry>,
    compacted_through: Option<(Term, Index)>,
    commit_index: Option<Index>,
}

impl JournalReplay {
    pub(super) fn new() -> Self {
        JournalReplay {
            term: Term::new(0),
            voted_for: None,
            entries: Vec::new(),
            compacted_through: None,
            commit_index: None,
        }
    }

    pub(super) fn apply(&mut self, record: JournalEntry) -> io::Result<()> {
        match record {
            JournalEntry::LogEntry(entry) => self.apply_log_entry(entry)?,
            JournalEntry::TermVote { term, voted_for } => {
                self.term = term;
                self.voted_for = voted_for;
            }
            JournalEntry::DeleteEntries { through } => {
                let (_, through_index) = through;
                self.entries.retain(|e| e.index > through_index);
                if self.compacted_through.map_or(true, |(_, current)| through_index > current) {
                    self.compacted_through = Some(through);
                }
            }
            JournalEntry::TruncateEntries { from } => {
                self.entries.retain(|e| e.index < from);
            }
            JournalEntry::CommitIndex(index) => {
                if self.commit_index.map_or(true, |current| index > current) {
                    self.commit_index = Some(index);
                }
            }
        }

        Ok(())
    }

    fn apply_log_entry(&mut self, entry: LogEntry) -> io::Result<()> {
        if let Some((_, through)) = self.compacted_through {
            if entry.index <= through {
                return Ok(());
            }
        }

        // A rewrite of an existing index supersedes it and everything after it.
        self.entries.retain(|e| e.index < entry.index);

        let expected = match (self.entries.last(), self.compacted_through) {
            (Some(last), _) => last.index.plus(1),
            (None, Some((_, through))) => through.plus(1),
            (None, None) => Index::start_index(),
        };
        if entry.index != expected {
            return Err(invalid_data(format!(
                "Journal has a gap: expected entry {:?}, found {:?}",
                expected, entry.index
            )));
        }

        self.entries.push(entry);
        Ok(())
    }

    /// The smallest record sequence that replays to the same state.
    pub(super) fn live_records(&self) -> Vec<JournalEntry> {
        let mut records = Vec::with_capacity(self.entries.len() + 3);
        records.push(JournalEntry::TermVote {
            term: self.term,
            voted_for: self.voted_for.clone(),
        });
        if let Some(through) = self.compacted_through {
            records.push(JournalEntry::DeleteEntries { through });
        }
        records.extend(self.entries.iter().cloned().map(JournalEntry::LogEntry));
        if let Some(index) = self.commit_index {
            records.push(JournalEntry::CommitIndex(index));
        }
        records
    }

    pub(super) fn finish(self, snapshot: Option<Snapshot>) -> RecoveredState {
        RecoveredState {
            term: self.term,
            voted_for: self.voted_for,
            snapshot,
            entries: self.entries,
            commit_index: self.commit_index,
        }
    }
}
