mod apply;
mod election;
mod local_state;
mod membership;
mod peers;
mod proposals;
mod replica;
mod replica_api;
mod replica_wiring;
mod snapshot;
mod write_ahead_log;

pub(crate) use election::{ElectionStateChangeListener, ElectionStateSnapshot};
pub(crate) use local_state::Term;
pub(crate) use membership::{ServerConfiguration, ServerInfo};
pub(crate) use peers::{ReplicaId, ShardId};
pub(crate) use replica::{Replica, ReplicationLimits};
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::{create_replica, ReplicaConfig};
pub(crate) use snapshot::SnapshotPolicy;
