use crate::actor::WeakActorClient;
use crate::api;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoProposeReq, ProtoProposeResult, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoTimeoutNowReq,
    ProtoTimeoutNowResult,
};
use crate::network;
use crate::replica::ShardId;
use crate::server::{RpcServerShutdownSignal, ShardRegistry};
use std::net::SocketAddr;
use tokio::time::Duration;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface for every shard a node hosts.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    shards: ShardRegistry,
    default_proposal_timeout: Duration,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, shards: ShardRegistry, default_proposal_timeout: Duration) -> Self {
        RpcServer {
            logger,
            shards,
            default_proposal_timeout,
        }
    }

    pub(crate) async fn run(
        self,
        socket_addr: SocketAddr,
        shutdown_signal: RpcServerShutdownSignal,
    ) -> Result<(), tonic::transport::Error> {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
        result
    }

    fn local_replica(&self, shard_id: &ShardId) -> Result<WeakActorClient, Status> {
        self.shards
            .lookup(shard_id)
            .ok_or_else(|| Status::not_found(format!("Shard {:?} is not hosted here", shard_id)))
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let (shard_id, app_input) = network::request_vote_from_wire(rpc_request)?;
        let app_result = self.local_replica(&shard_id)?.request_vote(app_input).await;
        Ok(network::request_vote_result_to_wire(app_result))
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let (shard_id, app_input) = network::append_entries_from_wire(rpc_request)?;
        let app_result = self.local_replica(&shard_id)?.append_entries(app_input).await;
        Ok(network::append_entries_result_to_wire(app_result))
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let (shard_id, app_input) = network::install_snapshot_from_wire(rpc_request)?;
        let app_result = self.local_replica(&shard_id)?.install_snapshot(app_input).await;
        Ok(network::install_snapshot_result_to_wire(app_result))
    }

    async fn handle_timeout_now(&self, rpc_request: ProtoTimeoutNowReq) -> Result<ProtoTimeoutNowResult, Status> {
        let (shard_id, app_input) = network::timeout_now_from_wire(rpc_request)?;
        let app_result = self.local_replica(&shard_id)?.timeout_now(app_input).await;
        Ok(network::timeout_now_result_to_wire(app_result))
    }

    async fn handle_propose(&self, rpc_request: ProtoProposeReq) -> Result<ProtoProposeResult, Status> {
        let (shard_id, app_input, timeout) = network::propose_from_wire(rpc_request);
        let local_replica = self.local_replica(&shard_id)?;
        let app_result = api::propose_until(
            local_replica.propose(app_input.into()),
            timeout.unwrap_or(self.default_proposal_timeout),
        )
        .await;
        Ok(network::propose_result_to_wire(app_result))
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        // Entries can be large, so only the shape is logged.
        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries shard={} term={} prev={}@{} entries={} commit={}",
            rpc_request.shard_id,
            rpc_request.term,
            rpc_request.previous_log_entry_index,
            rpc_request.previous_log_entry_term,
            rpc_request.new_entries.len(),
            rpc_request.commit_index
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot shard={} term={} last={}@{} offset={} len={} done={}",
            rpc_request.shard_id,
            rpc_request.term,
            rpc_request.last_included_index,
            rpc_request.last_included_term,
            rpc_request.offset,
            rpc_request.data.len(),
            rpc_request.done
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn timeout_now(
        &self,
        rpc_request_wrapped: Request<ProtoTimeoutNowReq>,
    ) -> Result<Response<ProtoTimeoutNowResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_timeout_now(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn propose(
        &self,
        rpc_request_wrapped: Request<ProtoProposeReq>,
    ) -> Result<Response<ProtoProposeResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_propose(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
