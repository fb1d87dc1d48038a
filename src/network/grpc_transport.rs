use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::network::wire;
use crate::network::{PeerTransport, TransportError};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, RequestVoteError, RequestVoteInput, RequestVoteOutput, ServerInfo, ShardId, TimeoutNowError,
    TimeoutNowInput, TimeoutNowOutput,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tonic::transport::{Channel, Endpoint};

/// GrpcTransport reaches peers at the address their membership entry carries. One lazily
/// connected channel is kept per address and shared by every shard talking to it.
pub(crate) struct GrpcTransport {
    channels: Mutex<HashMap<SocketAddr, Channel>>,
}

impl GrpcTransport {
    pub(crate) fn new() -> Self {
        GrpcTransport {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, addr: SocketAddr) -> Result<GrpcRaftClient<Channel>, TransportError> {
        let mut channels = self.lock();
        if let Some(channel) = channels.get(&addr) {
            return Ok(GrpcRaftClient::new(channel.clone()));
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;
        let channel = endpoint
            .connect_lazy()
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;
        channels.insert(addr, channel.clone());

        Ok(GrpcRaftClient::new(channel))
    }

    // A broken channel is rebuilt on the next call instead of retrying on the same one.
    fn forget(&self, addr: SocketAddr) {
        self.lock().remove(&addr);
    }

    fn rpc_error(&self, addr: SocketAddr, status: tonic::Status) -> TransportError {
        if status.code() == tonic::Code::Unavailable {
            self.forget(addr);
            TransportError::Unreachable(format!("{}: {}", addr, status.message()))
        } else {
            TransportError::Rpc(format!("{:?}: {}", status.code(), status.message()))
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for GrpcTransport {
    async fn request_vote(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
        let mut client = self.client(target.addr)?;
        let rpc_reply = client
            .request_vote(wire::request_vote_to_wire(shard_id, input))
            .await
            .map_err(|status| self.rpc_error(target.addr, status))?;

        wire::request_vote_result_from_wire(rpc_reply.into_inner())
    }

    async fn append_entries(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
        let mut client = self.client(target.addr)?;
        let rpc_reply = client
            .append_entries(wire::append_entries_to_wire(shard_id, input))
            .await
            .map_err(|status| self.rpc_error(target.addr, status))?;

        wire::append_entries_result_from_wire(rpc_reply.into_inner())
    }

    async fn install_snapshot(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
        let mut client = self.client(target.addr)?;
        let rpc_reply = client
            .install_snapshot(wire::install_snapshot_to_wire(shard_id, input))
            .await
            .map_err(|status| self.rpc_error(target.addr, status))?;

        wire::install_snapshot_result_from_wire(rpc_reply.into_inner())
    }

    async fn timeout_now(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: TimeoutNowInput,
    ) -> Result<Result<TimeoutNowOutput, TimeoutNowError>, TransportError> {
        let mut client = self.client(target.addr)?;
        let rpc_reply = client
            .timeout_now(wire::timeout_now_to_wire(shard_id, input))
            .await
            .map_err(|status| self.rpc_error(target.addr, status))?;

        wire::timeout_now_result_from_wire(rpc_reply.into_inner())
    }
}
