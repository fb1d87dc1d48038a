//! How a replica reaches its peers. The replica only sees [`PeerTransport`]; gRPC is used between
//! processes and [`LocalNetwork`] wires replicas of one process together (mostly for tests).

mod grpc_transport;
mod local;
mod wire;

pub(crate) use grpc_transport::GrpcTransport;
pub use local::LocalNetwork;
pub(crate) use wire::{propose_from_wire, propose_result_from_wire, propose_result_to_wire, propose_to_wire};
pub(crate) use wire::{
    append_entries_from_wire, install_snapshot_from_wire, request_vote_from_wire, timeout_now_from_wire,
};
pub(crate) use wire::{
    append_entries_result_to_wire, install_snapshot_result_to_wire, request_vote_result_to_wire,
    timeout_now_result_to_wire,
};

use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput, ServerInfo, ShardId,
    TimeoutNowError, TimeoutNowInput, TimeoutNowOutput,
};
use std::sync::Arc;

/// The outer result is about reaching the peer at all, the inner one is the peer's own answer.
#[async_trait::async_trait]
pub(crate) trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError>;

    async fn append_entries(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError>;

    async fn install_snapshot(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError>;

    async fn timeout_now(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: TimeoutNowInput,
    ) -> Result<Result<TimeoutNowOutput, TimeoutNowError>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("RPC failed: {0}")]
    Rpc(String),
    #[error("Peer sent a malformed reply: {0}")]
    MalformedReply(String),
}

/// RaftTransport picks how shards created through it talk to their peers.
#[derive(Clone)]
pub struct RaftTransport {
    inner: TransportKind,
}

#[derive(Clone)]
enum TransportKind {
    Grpc(Arc<GrpcTransport>),
    Local(LocalNetwork),
}

impl RaftTransport {
    /// Connects to peers over gRPC, at the address each member is registered with.
    pub fn grpc() -> Self {
        RaftTransport {
            inner: TransportKind::Grpc(Arc::new(GrpcTransport::new())),
        }
    }

    /// Delivers RPCs in-process to replicas created with the same network.
    pub fn local(network: LocalNetwork) -> Self {
        RaftTransport {
            inner: TransportKind::Local(network),
        }
    }

    pub(crate) fn peer_transport(&self, my_replica_id: &ReplicaId) -> Arc<dyn PeerTransport> {
        match &self.inner {
            TransportKind::Grpc(grpc) => grpc.clone(),
            TransportKind::Local(network) => Arc::new(network.endpoint(my_replica_id.clone())),
        }
    }
}
