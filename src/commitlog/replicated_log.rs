use crate::commitlog::{Index, LogEntry};
use crate::replica::Term;
use std::collections::VecDeque;

/// ReplicatedLog is the in-memory view of the log: a contiguous run of entries that starts right
/// after the most recent snapshot. It does no I/O; durability is the job of the caller, which must
/// persist a change before mirroring it here.
#[derive(Debug)]
pub(crate) struct ReplicatedLog {
    // Last entry folded into the most recent snapshot. Entries at or below it are gone from memory.
    snapshot_last: Option<(Term, Index)>,
    entries: VecDeque<LogEntry>,
    data_size: usize,
}

impl ReplicatedLog {
    pub(crate) fn new() -> Self {
        ReplicatedLog {
            snapshot_last: None,
            entries: VecDeque::new(),
            data_size: 0,
        }
    }

    /// Index of the first entry held in memory (or that would be, once appended).
    pub(crate) fn first_index(&self) -> Index {
        match self.snapshot_last {
            Some((_, index)) => index.plus(1),
            None => Index::start_index(),
        }
    }

    pub(crate) fn next_index(&self) -> Index {
        match self.last_index() {
            Some(index) => index.plus(1),
            None => Index::start_index(),
        }
    }

    pub(crate) fn snapshot_last(&self) -> Option<(Term, Index)> {
        self.snapshot_last
    }

    pub(crate) fn last_index(&self) -> Option<Index> {
        self.entries
            .back()
            .map(|e| e.index)
            .or_else(|| self.snapshot_last.map(|(_, index)| index))
    }

    /// Term and index of the last entry, which may be the snapshot's last included entry.
    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.entries.back().map(|e| e.id()).or(self.snapshot_last)
    }

    /// True if `index` has been folded into a snapshot and is no longer individually addressable.
    pub(crate) fn is_compacted(&self, index: Index) -> bool {
        index < self.first_index()
    }

    pub(crate) fn entry_at(&self, index: Index) -> Option<&LogEntry> {
        self.offset_of(index).and_then(|offset| self.entries.get(offset))
    }

    /// Term of the entry at `index`. Answers for the snapshot's last included index too, which is
    /// what the AppendEntries consistency check needs at the snapshot boundary.
    pub(crate) fn term_at(&self, index: Index) -> Option<Term> {
        if let Some((term, snapshot_index)) = self.snapshot_last {
            if snapshot_index == index {
                return Some(term);
            }
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn offset_of(&self, index: Index) -> Option<usize> {
        let first = self.first_index();
        if index < first {
            None
        } else {
            Some((index.as_u64() - first.as_u64()) as usize)
        }
    }

    /// Appends entries to the tail. Entries must be contiguous with the current tail.
    pub(crate) fn append(&mut self, new_entries: Vec<LogEntry>) {
        for entry in new_entries {
            assert_eq!(
                entry.index,
                self.next_index(),
                "Appended log entry to unexpected index."
            );
            if let Some(last_term) = self.latest_entry().map(|(term, _)| term) {
                assert!(entry.term >= last_term, "Log terms must be non-decreasing.");
            }
            self.data_size += entry.size_bytes();
            self.entries.push_back(entry);
        }
    }

    /// Deletes `index` and everything after it. Returns the number of entries that were removed.
    pub(crate) fn truncate_from(&mut self, index: Index) -> usize {
        assert!(
            !self.is_compacted(index),
            "Can't truncate into a snapshot. Index={:?}, FirstIndex={:?}",
            index,
            self.first_index()
        );

        let offset = match self.offset_of(index) {
            Some(offset) => offset,
            None => return 0,
        };
        let mut removed = 0;
        while self.entries.len() > offset {
            if let Some(entry) = self.entries.pop_back() {
                self.data_size -= entry.size_bytes();
                removed += 1;
            }
        }
        removed
    }

    /// Copies out entries starting at `index`, bounded by count and total size. At least one entry
    /// is returned if one exists, even when it alone exceeds `max_bytes`.
    pub(crate) fn slice_from(&self, index: Index, max_entries: usize, max_bytes: usize) -> Vec<LogEntry> {
        let offset = match self.offset_of(index) {
            Some(offset) => offset,
            None => return Vec::new(),
        };

        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        for entry in self.entries.iter().skip(offset).take(max_entries) {
            let entry_bytes = entry.size_bytes();
            if !batch.is_empty() && batch_bytes + entry_bytes > max_bytes {
                break;
            }
            batch_bytes += entry_bytes;
            batch.push(entry.clone());
        }
        batch
    }

    pub(crate) fn iter_from(&self, index: Index) -> impl Iterator<Item = &LogEntry> {
        let offset = self.offset_of(index).unwrap_or(0);
        self.entries.iter().skip(offset)
    }

    /// Drops every entry at or below `index`, which is now covered by a snapshot. If the snapshot
    /// reaches past the tail, the log becomes empty and continues after the snapshot.
    pub(crate) fn compact_through(&mut self, term: Term, index: Index) {
        if let Some((_, current)) = self.snapshot_last {
            if index <= current {
                return;
            }
        }

        while let Some(front) = self.entries.front() {
            if front.index > index {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                self.data_size -= entry.size_bytes();
            }
        }
        self.snapshot_last = Some((term, index));
    }

    /// Discards the whole log and restarts it after the given snapshot boundary.
    pub(crate) fn reset_to_snapshot(&mut self, term: Term, index: Index) {
        self.entries.clear();
        self.data_size = 0;
        self.snapshot_last = Some((term, index));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sum of `LogEntry::size_bytes` over entries still in memory.
    pub(crate) fn data_size(&self) -> usize {
        self.data_size
    }
}
