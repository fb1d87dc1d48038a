use crate::commitlog::{Index, LogEntry};
use crate::replica::local_state::Term;
use crate::replica::membership::{ServerConfiguration, ServerInfo};
use crate::replica::peers::ReplicaId;
use crate::storage::EncodedSnapshot;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) addr: Option<SocketAddr>,
}

// ------- Client proposals --------

#[derive(Debug)]
pub(crate) struct ProposeInput {
    pub(crate) client_request_id: Option<String>,
    pub(crate) payload: Bytes,
}

#[derive(Debug)]
pub(crate) struct ProposeOutput {
    pub(crate) entry_id: (Term, Index),
    pub(crate) output: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProposeError {
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Request was already applied at {original:?}")]
    DuplicateRequest { original: (Term, Index) },

    #[error("Entry was replaced by a different leader's entry before it committed")]
    EntryDiscarded,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

// ------- Admin --------

#[derive(Debug)]
pub(crate) enum MembershipChange {
    /// Adds a member (first as non voting, then promoted once caught up if `voting` is set), or
    /// changes an existing member's address or voting status.
    AddServer(ServerInfo),
    RemoveServer(ReplicaId),
}

#[derive(Debug)]
pub(crate) struct MembershipChangeOutput {
    pub(crate) entry_id: (Term, Index),
    pub(crate) configuration: ServerConfiguration,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MembershipChangeError {
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Another membership change has not committed yet")]
    ChangeInProgress,

    #[error("Membership already matches the requested change")]
    NoChange,

    #[error("Invalid membership change: {0}")]
    InvalidChange(String),

    #[error("Configuration entry was discarded before it committed")]
    EntryDiscarded,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct LeadershipTransferOutput {
    pub(crate) new_leader: LeaderRedirectInfo,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LeadershipTransferError {
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Cannot hand leadership to {0}")]
    InvalidTarget(String),

    #[error("A leadership transfer is already in progress")]
    TransferInProgress,

    #[error("No new leader was elected in time")]
    Timeout,

    #[error("{0:?} was elected instead of the requested replica")]
    OtherLeaderElected(LeaderRedirectInfo),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct SnapshotOutput {
    pub(crate) last_included: (Term, Index),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SnapshotError {
    #[error("A snapshot is already being persisted")]
    AlreadyInProgress,

    #[error("Nothing has been applied since the last snapshot")]
    NothingToSnapshot,

    #[error("Failed to persist snapshot: {0:?}")]
    PersistFailed(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum StatusError {
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) role: ReplicaRole,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_applied: Option<Index>,
    pub(crate) latest_entry: Option<(Term, Index)>,
    pub(crate) snapshot_last: Option<(Term, Index)>,
    pub(crate) snapshots_installed: u64,
    pub(crate) configuration: ServerConfiguration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReplicaRole {
    Leader,
    Candidate,
    Follower(Option<LeaderRedirectInfo>),
}

// ------- RequestVote --------

#[derive(Debug, Clone)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) term: Term,
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

// ------- AppendEntries --------

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) term: Term,
    // Last index known to match the leader's log after this call.
    pub(crate) match_index: Option<Index>,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry(MissingLogEntryInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct MissingLogEntryInfo {
    pub(crate) term: Term,
    // Hint for the leader so it can skip back in one step instead of one entry at a time.
    pub(crate) last_log_entry: Option<(Term, Index)>,
}

// ------- InstallSnapshot --------

#[derive(Debug, Clone)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) last_included: (Term, Index),
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
    pub(crate) done: bool,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) term: Term,
    pub(crate) next_offset: u64,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Chunk does not continue the transfer in progress, expected offset {expected_offset}")]
    UnexpectedChunk { term: Term, expected_offset: u64 },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

// ------- TimeoutNow --------

#[derive(Debug, Clone)]
pub(crate) struct TimeoutNowInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
}

#[derive(Debug)]
pub(crate) struct TimeoutNowOutput {
    // Term the receiver campaigns in.
    pub(crate) term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TimeoutNowError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are not a voting member")]
    NotVoting,
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

// ------- Replies from peers --------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure(String),
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    // The peer's match index on success.
    pub(crate) result: Result<Option<Index>, AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_entry: Option<(Term, Index)> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included: (Term, Index),
    pub(crate) done: bool,
    pub(crate) result: Result<u64, InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    UnexpectedChunk { expected_offset: u64 },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

// ------- Internal events --------

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// ElectionTimeout fires when a follower or candidate armed at `term` heard nothing in time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ElectionTimeout {
    pub(crate) term: Term,
}

/// Fires once the leadership transfer numbered `transfer_id` has run out of time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeadershipTransferTimeout {
    pub(crate) transfer_id: u64,
}

#[derive(Debug)]
pub(crate) struct SnapshotPersisted {
    pub(crate) last_included: (Term, Index),
    pub(crate) result: io::Result<EncodedSnapshot>,
}

// ------- Conversions of remote results into replies --------

impl RequestVoteResult {
    pub(crate) fn from_remote(request_term: Term, remote: Result<RequestVoteOutput, RequestVoteError>) -> Self {
        match remote {
            Ok(output) if output.term > request_term => RequestVoteResult::StaleTerm { new_term: output.term },
            Ok(output) if output.vote_granted => RequestVoteResult::VoteGranted,
            Ok(_) => RequestVoteResult::VoteNotGranted,
            Err(RequestVoteError::RequestTermOutOfDate(info)) => RequestVoteResult::StaleTerm {
                new_term: info.current_term,
            },
            Err(e) => RequestVoteResult::RetryableFailure(format!("{:?}", e)),
        }
    }
}

impl AppendEntriesReplyFromPeerError {
    pub(crate) fn from_remote(
        remote: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> Result<Option<Index>, AppendEntriesReplyFromPeerError> {
        match remote {
            Ok(output) => Ok(output.match_index),
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => Err(AppendEntriesReplyFromPeerError::StaleTerm {
                new_term: info.current_term,
            }),
            Err(AppendEntriesError::ServerMissingPreviousLogEntry(info)) => {
                Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                    last_log_entry: info.last_log_entry,
                })
            }
            Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!("{:?}", e))),
        }
    }
}

impl InstallSnapshotReplyFromPeerError {
    pub(crate) fn from_remote(
        remote: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> Result<u64, InstallSnapshotReplyFromPeerError> {
        match remote {
            Ok(output) => Ok(output.next_offset),
            Err(InstallSnapshotError::ClientTermOutOfDate(info)) => {
                Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                    new_term: info.current_term,
                })
            }
            Err(InstallSnapshotError::UnexpectedChunk { expected_offset, .. }) => {
                Err(InstallSnapshotReplyFromPeerError::UnexpectedChunk { expected_offset })
            }
            Err(e) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!("{:?}", e))),
        }
    }
}
