use crate::commitlog::Index;
use crate::replica;
use crate::replica::Term;
use std::fmt;
use std::net::SocketAddr;

/// Position of an entry in the replicated log, handed to the application with every command so it
/// can match state transitions with their proposals.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RaftEntryId {
    term: u64,
    index: u64,
}

impl RaftEntryId {
    pub(crate) fn new(term: Term, index: Index) -> Self {
        RaftEntryId {
            term: term.as_u64(),
            index: index.as_u64(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl From<(Term, Index)> for RaftEntryId {
    fn from((term, index): (Term, Index)) -> Self {
        RaftEntryId::new(term, index)
    }
}

impl fmt::Debug for RaftEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    /// Where the member's Raft RPC server listens. Leaders connect here.
    pub addr: SocketAddr,
    pub voting: bool,
}

impl From<RaftMemberInfo> for replica::ServerInfo {
    fn from(member_info: RaftMemberInfo) -> Self {
        replica::ServerInfo {
            replica_id: replica::ReplicaId::new(member_info.replica_id),
            addr: member_info.addr,
            voting: member_info.voting,
        }
    }
}

impl From<&replica::ServerInfo> for RaftMemberInfo {
    fn from(server_info: &replica::ServerInfo) -> Self {
        RaftMemberInfo {
            replica_id: server_info.replica_id.as_str().to_string(),
            addr: server_info.addr,
            voting: server_info.voting,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    /// None if the leader isn't in our copy of the configuration yet.
    pub addr: Option<SocketAddr>,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        RaftLeaderInfo {
            replica_id: internal_leader.replica_id.into_inner(),
            addr: internal_leader.addr,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower { leader: Option<RaftLeaderInfo> },
}

impl From<replica::ReplicaRole> for RaftRole {
    fn from(role: replica::ReplicaRole) -> Self {
        match role {
            replica::ReplicaRole::Leader => RaftRole::Leader,
            replica::ReplicaRole::Candidate => RaftRole::Candidate,
            replica::ReplicaRole::Follower(leader) => RaftRole::Follower {
                leader: leader.map(RaftLeaderInfo::from),
            },
        }
    }
}

/// Point in time view of one replica.
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub replica_id: String,
    pub term: u64,
    pub role: RaftRole,
    pub commit_index: Option<u64>,
    pub last_applied: Option<u64>,
    pub last_log: Option<RaftEntryId>,
    /// Last entry covered by the newest snapshot this replica holds.
    pub snapshot_last: Option<RaftEntryId>,
    /// How many snapshots were received from a leader since start.
    pub snapshots_installed: u64,
    pub members: Vec<RaftMemberInfo>,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn snapshot_index(&self) -> Option<u64> {
        self.snapshot_last.map(|entry| entry.index())
    }
}

impl From<replica::ReplicaStatus> for RaftStatus {
    fn from(status: replica::ReplicaStatus) -> Self {
        RaftStatus {
            replica_id: status.replica_id.into_inner(),
            term: status.term.as_u64(),
            role: RaftRole::from(status.role),
            commit_index: status.commit_index.map(|i| i.as_u64()),
            last_applied: status.last_applied.map(|i| i.as_u64()),
            last_log: status.latest_entry.map(RaftEntryId::from),
            snapshot_last: status.snapshot_last.map(RaftEntryId::from),
            snapshots_installed: status.snapshots_installed,
            members: status.configuration.members().iter().map(RaftMemberInfo::from).collect(),
        }
    }
}
