use crate::api::wiring::{self, RaftShard, RaftShardConfig, RaftShardCreationError};
use crate::network::RaftTransport;
use crate::server::{self, RpcServer, RpcServerShutdownHandle, ShardRegistry};
use std::net::SocketAddr;
use tokio::time::Duration;

pub struct RaftNodeConfig {
    pub listen_addr: SocketAddr,
    pub logger: slog::Logger,
    /// Used for Propose RPCs that don't carry their own timeout. Defaults to 5 seconds.
    pub default_proposal_timeout: Option<Duration>,
}

/// RaftNode is one process's gRPC endpoint. It hosts any number of shard replicas, and reaches
/// their peers at the addresses in each shard's membership.
pub struct RaftNode {
    logger: slog::Logger,
    listen_addr: SocketAddr,
    registry: ShardRegistry,
    transport: RaftTransport,
    shutdown_handle: RpcServerShutdownHandle,
}

impl RaftNode {
    /// Starts serving on `listen_addr`. Must be called within a tokio runtime.
    pub fn start(config: RaftNodeConfig) -> Self {
        let logger = config.logger.new(slog::o!("Node" => config.listen_addr.to_string()));
        let registry = ShardRegistry::default();
        let (shutdown_handle, shutdown_signal) = server::shutdown_signal();

        let rpc_server = RpcServer::new(
            logger.clone(),
            registry.clone(),
            config.default_proposal_timeout.unwrap_or(Duration::from_secs(5)),
        );
        let listen_addr = config.listen_addr;
        let server_logger = logger.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc_server.run(listen_addr, shutdown_signal).await {
                slog::error!(server_logger, "Raft RPC server failed: {:?}", e);
            }
        });

        RaftNode {
            logger,
            listen_addr,
            registry,
            transport: RaftTransport::grpc(),
            shutdown_handle,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Creates a replica of `config.shard_id` served by this node. At most one replica of a given
    /// shard can be hosted at a time.
    pub fn create_shard(&self, config: RaftShardConfig) -> Result<RaftShard, RaftShardCreationError> {
        slog::info!(self.logger, "Creating replica {} of shard {}", config.my_replica_id, config.shard_id);
        wiring::create_grpc_shard(config, &self.transport, &self.registry)
    }

    /// Stops serving RPCs. Shards keep running until their gateways are dropped, but can no
    /// longer be reached by peers.
    pub fn shutdown(mut self) {
        slog::info!(self.logger, "Shutting down");
        self.shutdown_handle.shutdown();
    }
}
