use crate::actor::ActorClient;
use crate::api::types::{RaftEntryId, RaftLeaderInfo, RaftMemberInfo, RaftStatus};
use crate::api::wiring::ShardRegistration;
use crate::replica;
use crate::replica::ReplicaId;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug)]
pub struct RaftProposeInput {
    /// Proposals sharing an id are applied at most once (within the dedup window).
    pub client_request_id: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct RaftProposeOutput {
    pub entry_id: RaftEntryId,
    /// What the state machine returned when applying the entry.
    pub output: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftProposeError {
    #[error("I'm not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<RaftLeaderInfo> },

    // Raft state is untouched, the entry may still commit later. Retry with the same request id.
    #[error("Timed out waiting for the entry to be applied")]
    Timeout,

    #[error("Request was already applied at {entry_id:?}")]
    DuplicateRequest { entry_id: RaftEntryId },

    #[error("Entry was replaced before it committed, safe to retry")]
    EntryDiscarded,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica has exited")]
    ReplicaExited,
}

#[derive(Debug)]
pub struct RaftMembershipOutput {
    pub entry_id: RaftEntryId,
    pub members: Vec<RaftMemberInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftMembershipError {
    #[error("I'm not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<RaftLeaderInfo> },
    #[error("Another membership change has not committed yet")]
    ChangeInProgress,
    #[error("Membership already matches the requested change")]
    NoChange,
    #[error("Invalid membership change: {0}")]
    InvalidChange(String),
    #[error("Configuration entry was replaced before it committed, safe to retry")]
    EntryDiscarded,
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Replica has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftSnapshotError {
    #[error("A snapshot is already being persisted")]
    AlreadyInProgress,
    #[error("Nothing has been applied since the last snapshot")]
    NothingToSnapshot,
    #[error("Failed to persist snapshot: {0:?}")]
    PersistFailed(io::Error),
    #[error("Replica has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftLeadershipTransferError {
    #[error("I'm not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<RaftLeaderInfo> },
    #[error("Cannot hand leadership to {0}")]
    InvalidTarget(String),
    #[error("A leadership transfer is already in progress")]
    TransferInProgress,
    // The old leader takes proposals again.
    #[error("No new leader was elected within the election timeout")]
    Timeout,
    #[error("{leader:?} was elected instead of the requested target")]
    OtherLeaderElected { leader: RaftLeaderInfo },
    #[error("Replica has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
#[error("Replica has exited")]
pub struct RaftReplicaExited;

/// ClientGateway is how the application talks to its local replica of a shard. Clones share the
/// replica, which keeps running while any clone is alive.
#[derive(Clone)]
pub struct ClientGateway {
    actor_client: ActorClient,
    proposal_timeout: Duration,
    _registration: Arc<ShardRegistration>,
}

impl ClientGateway {
    pub(crate) fn new(
        actor_client: ActorClient,
        proposal_timeout: Duration,
        registration: ShardRegistration,
    ) -> Self {
        ClientGateway {
            actor_client,
            proposal_timeout,
            _registration: Arc::new(registration),
        }
    }

    /// Appends `input` to the log if this replica leads, and resolves once the entry was applied
    /// locally. Gives up after the configured proposal timeout.
    pub async fn propose(&self, input: RaftProposeInput) -> Result<RaftProposeOutput, RaftProposeError> {
        self.propose_with_timeout(input, self.proposal_timeout).await
    }

    pub async fn propose_with_timeout(
        &self,
        input: RaftProposeInput,
        timeout: Duration,
    ) -> Result<RaftProposeOutput, RaftProposeError> {
        propose_until(self.actor_client.propose(input.into()), timeout).await
    }

    /// Adds a member, or updates an existing member's address or voting flag. A new voter first
    /// replicates as non voting and is promoted once it has caught up, and this resolves after
    /// the promotion committed.
    pub async fn add_server(&self, member: RaftMemberInfo) -> Result<RaftMembershipOutput, RaftMembershipError> {
        self.actor_client
            .change_membership(replica::MembershipChange::AddServer(member.into()))
            .await
            .map(RaftMembershipOutput::from)
            .map_err(RaftMembershipError::from)
    }

    pub async fn remove_server(&self, replica_id: &str) -> Result<RaftMembershipOutput, RaftMembershipError> {
        self.actor_client
            .change_membership(replica::MembershipChange::RemoveServer(ReplicaId::new(replica_id)))
            .await
            .map(RaftMembershipOutput::from)
            .map_err(RaftMembershipError::from)
    }

    /// Hands leadership to the voting member `target`. This replica stops taking proposals, brings
    /// `target` up to date and tells it to campaign, then resolves once `target` leads.
    pub async fn transfer_leadership(&self, target: &str) -> Result<RaftLeaderInfo, RaftLeadershipTransferError> {
        self.actor_client
            .transfer_leadership(ReplicaId::new(target))
            .await
            .map(|output| RaftLeaderInfo::from(output.new_leader))
            .map_err(RaftLeadershipTransferError::from)
    }

    /// Snapshots the state machine at the last applied entry, returning once it is durable.
    pub async fn trigger_snapshot(&self) -> Result<RaftEntryId, RaftSnapshotError> {
        self.actor_client
            .trigger_snapshot()
            .await
            .map(|output| RaftEntryId::from(output.last_included))
            .map_err(RaftSnapshotError::from)
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftReplicaExited> {
        self.actor_client
            .status()
            .await
            .map(RaftStatus::from)
            .map_err(|_| RaftReplicaExited)
    }
}

/// Shared by the local gateway and the Propose RPC.
pub(crate) async fn propose_until<F>(proposal: F, timeout: Duration) -> Result<RaftProposeOutput, RaftProposeError>
where
    F: Future<Output = Result<replica::ProposeOutput, replica::ProposeError>>,
{
    match tokio::time::timeout(timeout, proposal).await {
        Ok(result) => result.map(RaftProposeOutput::from).map_err(RaftProposeError::from),
        Err(_) => Err(RaftProposeError::Timeout),
    }
}

// ------- Conversions --------

impl From<RaftProposeInput> for replica::ProposeInput {
    fn from(input: RaftProposeInput) -> Self {
        replica::ProposeInput {
            client_request_id: input.client_request_id,
            payload: input.payload,
        }
    }
}

impl From<replica::ProposeOutput> for RaftProposeOutput {
    fn from(output: replica::ProposeOutput) -> Self {
        RaftProposeOutput {
            entry_id: RaftEntryId::from(output.entry_id),
            output: output.output,
        }
    }
}

impl From<replica::ProposeError> for RaftProposeError {
    fn from(e: replica::ProposeError) -> Self {
        match e {
            replica::ProposeError::NotLeader(leader) => RaftProposeError::NotLeader {
                leader_hint: leader.map(RaftLeaderInfo::from),
            },
            replica::ProposeError::DuplicateRequest { original } => RaftProposeError::DuplicateRequest {
                entry_id: RaftEntryId::from(original),
            },
            replica::ProposeError::EntryDiscarded => RaftProposeError::EntryDiscarded,
            replica::ProposeError::LocalIoError(e) => RaftProposeError::LocalIoError(e),
            replica::ProposeError::ActorExited => RaftProposeError::ReplicaExited,
        }
    }
}

impl From<replica::MembershipChangeOutput> for RaftMembershipOutput {
    fn from(output: replica::MembershipChangeOutput) -> Self {
        RaftMembershipOutput {
            entry_id: RaftEntryId::from(output.entry_id),
            members: output.configuration.members().iter().map(RaftMemberInfo::from).collect(),
        }
    }
}

impl From<replica::MembershipChangeError> for RaftMembershipError {
    fn from(e: replica::MembershipChangeError) -> Self {
        match e {
            replica::MembershipChangeError::NotLeader(leader) => RaftMembershipError::NotLeader {
                leader_hint: leader.map(RaftLeaderInfo::from),
            },
            replica::MembershipChangeError::ChangeInProgress => RaftMembershipError::ChangeInProgress,
            replica::MembershipChangeError::NoChange => RaftMembershipError::NoChange,
            replica::MembershipChangeError::InvalidChange(reason) => RaftMembershipError::InvalidChange(reason),
            replica::MembershipChangeError::EntryDiscarded => RaftMembershipError::EntryDiscarded,
            replica::MembershipChangeError::LocalIoError(e) => RaftMembershipError::LocalIoError(e),
            replica::MembershipChangeError::ActorExited => RaftMembershipError::ReplicaExited,
        }
    }
}

impl From<replica::LeadershipTransferError> for RaftLeadershipTransferError {
    fn from(e: replica::LeadershipTransferError) -> Self {
        match e {
            replica::LeadershipTransferError::NotLeader(leader) => RaftLeadershipTransferError::NotLeader {
                leader_hint: leader.map(RaftLeaderInfo::from),
            },
            replica::LeadershipTransferError::InvalidTarget(reason) => {
                RaftLeadershipTransferError::InvalidTarget(reason)
            }
            replica::LeadershipTransferError::TransferInProgress => RaftLeadershipTransferError::TransferInProgress,
            replica::LeadershipTransferError::Timeout => RaftLeadershipTransferError::Timeout,
            replica::LeadershipTransferError::OtherLeaderElected(leader) => {
                RaftLeadershipTransferError::OtherLeaderElected {
                    leader: RaftLeaderInfo::from(leader),
                }
            }
            replica::LeadershipTransferError::ActorExited => RaftLeadershipTransferError::ReplicaExited,
        }
    }
}

impl From<replica::SnapshotError> for RaftSnapshotError {
    fn from(e: replica::SnapshotError) -> Self {
        match e {
            replica::SnapshotError::AlreadyInProgress => RaftSnapshotError::AlreadyInProgress,
            replica::SnapshotError::NothingToSnapshot => RaftSnapshotError::NothingToSnapshot,
            replica::SnapshotError::PersistFailed(e) => RaftSnapshotError::PersistFailed(e),
            replica::SnapshotError::ActorExited => RaftSnapshotError::ReplicaExited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{LeaderRedirectInfo, Term};
    use crate::commitlog::Index;

    #[tokio::test]
    async fn slow_proposal_times_out() {
        let never = futures_never();

        let result = propose_until(never, Duration::from_millis(10)).await;

        assert!(matches!(result, Err(RaftProposeError::Timeout)));
    }

    async fn futures_never() -> Result<replica::ProposeOutput, replica::ProposeError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(replica::ProposeError::EntryDiscarded)
    }

    #[tokio::test]
    async fn replica_errors_keep_their_meaning() {
        // -- setup --
        let not_leader = async {
            Err(replica::ProposeError::NotLeader(Some(LeaderRedirectInfo {
                replica_id: ReplicaId::new("b"),
                addr: None,
            })))
        };
        let duplicate = async {
            Err(replica::ProposeError::DuplicateRequest {
                original: (Term::new(2), Index::new(7)),
            })
        };

        // -- execute --
        let not_leader = propose_until(not_leader, Duration::from_secs(1)).await;
        let duplicate = propose_until(duplicate, Duration::from_secs(1)).await;

        // -- verify --
        match not_leader {
            Err(RaftProposeError::NotLeader { leader_hint: Some(leader) }) => assert_eq!(leader.replica_id, "b"),
            other => panic!("Unexpected result {:?}", other),
        }
        match duplicate {
            Err(RaftProposeError::DuplicateRequest { entry_id }) => {
                assert_eq!((entry_id.term(), entry_id.index()), (2, 7))
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
