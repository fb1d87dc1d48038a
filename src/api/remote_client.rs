use crate::api::types::{RaftEntryId, RaftLeaderInfo};
use crate::api::RaftProposeOutput;
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::network;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// RaftRemoteClient proposes to a shard hosted by another process's [`crate::RaftNode`].
#[derive(Clone)]
pub struct RaftRemoteClient {
    logger: slog::Logger,
    inner: GrpcRaftClient<Channel>,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftRemoteProposeError {
    #[error("Server is not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<RaftLeaderInfo> },
    #[error("Timed out waiting for the entry to be applied")]
    Timeout,
    #[error("Request was already applied at {entry_id:?}")]
    DuplicateRequest { entry_id: RaftEntryId },
    #[error("Entry was replaced before it committed, safe to retry")]
    EntryDiscarded,
    #[error("Server fault: {0}")]
    ServerFault(String),
    #[error("RPC failed: {0}")]
    Rpc(tonic::Status),
    #[error("Server sent a malformed reply: {0}")]
    MalformedReply(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RaftConnectError {
    #[error("Invalid server address: {0}")]
    InvalidUri(String),
    #[error("Failed to connect")]
    ConnectFailure(#[from] tonic::transport::Error),
}

impl RaftRemoteClient {
    pub async fn connect(logger: slog::Logger, addr: SocketAddr) -> Result<Self, RaftConnectError> {
        let url = format!("http://{}", addr);
        slog::info!(logger, "Connecting to {} ...", url);
        let endpoint = Endpoint::from_shared(url).map_err(|e| RaftConnectError::InvalidUri(e.to_string()))?;
        let channel = endpoint.connect().await?;

        Ok(RaftRemoteClient {
            logger,
            inner: GrpcRaftClient::new(channel),
        })
    }

    /// `timeout` of None lets the server apply its default proposal timeout.
    pub async fn propose(
        &self,
        shard_id: &str,
        client_request_id: Option<String>,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<RaftProposeOutput, RaftRemoteProposeError> {
        let rpc_request = network::propose_to_wire(shard_id, client_request_id, payload, timeout);

        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_result = self.inner.clone().propose(rpc_request).await;
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_result);

        let rpc_reply = rpc_result.map_err(RaftRemoteProposeError::Rpc)?.into_inner();
        network::propose_result_from_wire(rpc_reply)
    }
}
