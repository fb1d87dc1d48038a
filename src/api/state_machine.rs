use crate::api::RaftEntryId;
use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
pub trait StateMachine: Send + 'static {
    /// Called only once the entry is committed (i.e. replicated to a majority), so an applied
    /// entry never has to be reversed. Entries arrive strictly in index order and each one exactly
    /// once per replica lifetime, except that a restart replays from the latest snapshot.
    ///
    /// The proposer is answered with the returned bytes once this returns, so apply synchronously
    /// if you want to serve strongly consistent reads.
    fn apply(&mut self, entry_id: RaftEntryId, payload: &Bytes) -> Bytes;

    /// Serializes the full state as of the last applied entry.
    fn snapshot(&self) -> Bytes;

    /// Replaces the full state with one produced by `snapshot`, possibly on another replica.
    fn restore(&mut self, state: Bytes);
}
