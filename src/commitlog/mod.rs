mod entry;
mod index;
mod replicated_log;

pub(crate) use entry::{EntryPayload, LogEntry};
pub(crate) use index::{as_u64_or_zero, Index};
pub(crate) use replicated_log::ReplicatedLog;
