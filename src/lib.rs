mod actor;
mod api;
mod commitlog;
mod network;
mod replica;
mod server;
mod storage;
#[cfg(test)]
mod test_utils;
mod grpc {
    include!("../generated/raft.rs");
}
mod journal {
    include!("../generated/journal.rs");
}

pub use api::create_local_shard;
pub use api::ClientGateway;
pub use api::RaftConnectError;
pub use api::RaftElectionState;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftLeadershipTransferError;
pub use api::RaftMemberInfo;
pub use api::RaftMembershipError;
pub use api::RaftMembershipOutput;
pub use api::RaftNode;
pub use api::RaftNodeConfig;
pub use api::RaftOptions;
pub use api::RaftProposeError;
pub use api::RaftProposeInput;
pub use api::RaftProposeOutput;
pub use api::RaftRemoteClient;
pub use api::RaftRemoteProposeError;
pub use api::RaftReplicaExited;
pub use api::RaftRole;
pub use api::RaftShard;
pub use api::RaftShardConfig;
pub use api::RaftShardCreationError;
pub use api::RaftSnapshotError;
pub use api::RaftStatus;
pub use api::StateMachine;
pub use network::LocalNetwork;
pub use storage::FileStore;
pub use storage::MemoryStore;
pub use storage::RaftStorage;
