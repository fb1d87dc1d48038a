use crate::actor::{ActorClient, ReplicaActor, WeakActorClient};
use crate::api::event_bus::RaftEventListener;
use crate::api::gateway::ClientGateway;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::state_machine::StateMachine;
use crate::api::types::RaftMemberInfo;
use crate::network::{LocalNetwork, RaftTransport};
use crate::replica::{
    self, ReplicaConfig, ReplicaId, ReplicationLimits, ServerConfiguration, ServerInfo, ShardId, SnapshotPolicy,
};
use crate::server::ShardRegistry;
use crate::storage::RaftStorage;
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;

pub struct RaftShardConfig {
    pub shard_id: String,
    pub my_replica_id: String,
    /// Used only when the store holds no configuration yet. Replicas joining an existing shard
    /// pass an empty list and wait for the leader to contact them.
    pub bootstrap_members: Vec<RaftMemberInfo>,
    pub store: RaftStorage,
    pub state_machine: Box<dyn StateMachine>,
    pub logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftShardCreationError {
    #[error("Illegal options for configuring shard: {0}")]
    IllegalOptions(String),
    #[error("Invalid bootstrap members: {0}")]
    InvalidMembers(String),
    #[error("Failed to recover durable state")]
    StorageRecovery(io::Error),
    #[error("Shard {0} is already hosted by this node")]
    ShardAlreadyHosted(String),
}

/// RaftShard is one local replica of a shard, as handed to the application.
pub struct RaftShard {
    pub gateway: ClientGateway,
    pub event_listener: RaftEventListener,
}

/// Creates a replica whose peers are reached through `network`. Every replica of the shard has
/// to be created on the same network.
pub fn create_local_shard(
    config: RaftShardConfig,
    network: &LocalNetwork,
) -> Result<RaftShard, RaftShardCreationError> {
    let transport = RaftTransport::local(network.clone());
    create_shard(config, &transport, |shard_id, replica_id, actor_client| {
        let registration = network.register(shard_id.clone(), replica_id.clone(), actor_client);
        Ok(ShardRegistration::Local {
            network: network.clone(),
            shard_id,
            replica_id,
            registration,
        })
    })
}

pub(crate) fn create_grpc_shard(
    config: RaftShardConfig,
    transport: &RaftTransport,
    registry: &ShardRegistry,
) -> Result<RaftShard, RaftShardCreationError> {
    create_shard(config, transport, |shard_id, _, actor_client| {
        registry
            .register(shard_id.clone(), actor_client)
            .map_err(|e| RaftShardCreationError::ShardAlreadyHosted(format!("{:?}", e.0)))?;
        Ok(ShardRegistration::Grpc {
            registry: registry.clone(),
            shard_id,
        })
    })
}

fn create_shard<R>(
    config: RaftShardConfig,
    transport: &RaftTransport,
    register: R,
) -> Result<RaftShard, RaftShardCreationError>
where
    R: FnOnce(ShardId, ReplicaId, WeakActorClient) -> Result<ShardRegistration, RaftShardCreationError>,
{
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftShardCreationError::IllegalOptions(e.to_string()))?;

    let shard_id = ShardId::new(config.shard_id);
    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let bootstrap_config = bootstrap_configuration(config.bootstrap_members)?;

    let logger = config.logger.new(slog::o!(
        "ShardId" => shard_id.as_str().to_string(),
        "ReplicaId" => my_replica_id.as_str().to_string(),
    ));

    let (actor_client, actor_queue_rx) = ActorClient::new(options.actor_queue_size);

    let (replica, election_state_change_listener) = replica::create_replica(
        ReplicaConfig {
            logger: logger.clone(),
            shard_id: shard_id.clone(),
            my_replica_id: my_replica_id.clone(),
            bootstrap_config,
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            limits: ReplicationLimits {
                rpc_timeout: options.leader_append_entries_timeout,
                max_entries: options.max_append_entries,
                max_bytes: options.max_append_bytes,
            },
            snapshot_policy: SnapshotPolicy {
                batch_count: options.snapshot_batch_count,
                data_threshold: options.snapshot_data_threshold,
                chunk_size: options.snapshot_chunk_size,
            },
            dedup_window: options.dedup_window,
        },
        config.store.into_inner(),
        config.state_machine,
        transport.peer_transport(&my_replica_id),
        actor_client.weak(),
    )
    .map_err(RaftShardCreationError::StorageRecovery)?;

    let registration = register(shard_id, my_replica_id, actor_client.weak())?;

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(RaftShard {
        gateway: ClientGateway::new(actor_client, options.proposal_timeout, registration),
        event_listener: RaftEventListener::new(election_state_change_listener),
    })
}

fn bootstrap_configuration(members: Vec<RaftMemberInfo>) -> Result<ServerConfiguration, RaftShardCreationError> {
    let mut seen = HashSet::new();
    for member in &members {
        if member.replica_id.is_empty() {
            return Err(RaftShardCreationError::InvalidMembers("Empty replica id".to_string()));
        }
        if !seen.insert(member.replica_id.clone()) {
            return Err(RaftShardCreationError::InvalidMembers(format!(
                "Replica {} is listed twice",
                member.replica_id
            )));
        }
    }

    let members: Vec<ServerInfo> = members.into_iter().map(ServerInfo::from).collect();
    let config = ServerConfiguration::new(members);
    if !config.members().is_empty() && config.num_voting() == 0 {
        return Err(RaftShardCreationError::InvalidMembers(
            "At least one member must vote".to_string(),
        ));
    }

    Ok(config)
}

/// Removes the shard's route once the last gateway clone is dropped.
pub(crate) enum ShardRegistration {
    Local {
        network: LocalNetwork,
        shard_id: ShardId,
        replica_id: ReplicaId,
        registration: u64,
    },
    Grpc {
        registry: ShardRegistry,
        shard_id: ShardId,
    },
}

impl Drop for ShardRegistration {
    fn drop(&mut self) {
        match self {
            ShardRegistration::Local {
                network,
                shard_id,
                replica_id,
                registration,
            } => network.deregister(shard_id, replica_id, *registration),
            ShardRegistration::Grpc { registry, shard_id } => registry.deregister(shard_id),
        }
    }
}
