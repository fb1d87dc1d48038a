//! This mod is meant to hold most of the code for the library's client-facing API.
mod event_bus;
mod gateway;
mod node;
mod options;
mod remote_client;
mod state_machine;
mod types;
mod wiring;

pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use gateway::ClientGateway;
pub use gateway::RaftLeadershipTransferError;
pub use gateway::RaftMembershipError;
pub use gateway::RaftMembershipOutput;
pub use gateway::RaftProposeError;
pub use gateway::RaftProposeInput;
pub use gateway::RaftProposeOutput;
pub use gateway::RaftReplicaExited;
pub use gateway::RaftSnapshotError;
pub use node::RaftNode;
pub use node::RaftNodeConfig;
pub use options::RaftOptions;
pub use remote_client::RaftConnectError;
pub use remote_client::RaftRemoteClient;
pub use remote_client::RaftRemoteProposeError;
pub use state_machine::StateMachine;
pub use types::RaftEntryId;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftRole;
pub use types::RaftStatus;
pub use wiring::create_local_shard;
pub use wiring::RaftShard;
pub use wiring::RaftShardConfig;
pub use wiring::RaftShardCreationError;

pub(crate) use gateway::propose_until;
