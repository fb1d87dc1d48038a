use std::fmt;

/// Index is the position of an entry in the replicated log. The first entry lives at index 1, so
/// callers use `Option<Index>` wherever "no entry" has to be expressed.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Index(u64);

impl Index {
    pub(crate) fn new(index: u64) -> Self {
        assert_ne!(index, 0, "Log index 0 is reserved to mean 'no entry'");
        Index(index)
    }

    pub(crate) fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Returns None for the wire/disk sentinel value 0.
    pub(crate) fn from_u64(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Index(index))
        }
    }

    pub(crate) fn start_index() -> Self {
        Self::new(1)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }

    pub(crate) fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).and_then(Index::from_u64)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flattens an optional index into the "0 means none" encoding used on the wire and on disk.
pub(crate) fn as_u64_or_zero(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}
