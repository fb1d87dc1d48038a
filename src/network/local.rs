use crate::actor::WeakActorClient;
use crate::network::{PeerTransport, TransportError};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput, ServerInfo, ShardId,
    TimeoutNowError, TimeoutNowInput, TimeoutNowOutput,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// LocalNetwork delivers RPCs between replicas living in the same process, routed by shard and
/// replica id. Links can be cut and restored to simulate partitions.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    shared: Arc<Mutex<Routes>>,
}

#[derive(Default)]
struct Routes {
    // Tagged with a registration number so a restarted replica isn't removed by its predecessor.
    replicas: HashMap<(ShardId, ReplicaId), (u64, WeakActorClient)>,
    next_registration: u64,
    isolated: HashSet<ReplicaId>,
    // Both directions are cut. Stored with the smaller id first.
    blocked_links: HashSet<(ReplicaId, ReplicaId)>,
}

impl Routes {
    fn is_reachable(&self, from: &ReplicaId, to: &ReplicaId) -> bool {
        !self.isolated.contains(from) && !self.isolated.contains(to) && !self.blocked_links.contains(&link(from, to))
    }
}

fn link(a: &ReplicaId, b: &ReplicaId) -> (ReplicaId, ReplicaId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, shard_id: ShardId, replica_id: ReplicaId, actor_client: WeakActorClient) -> u64 {
        let mut routes = self.lock();
        routes.next_registration += 1;
        let registration = routes.next_registration;
        routes.replicas.insert((shard_id, replica_id), (registration, actor_client));
        registration
    }

    pub(crate) fn deregister(&self, shard_id: &ShardId, replica_id: &ReplicaId, registration: u64) {
        let key = (shard_id.clone(), replica_id.clone());
        let mut routes = self.lock();
        if matches!(routes.replicas.get(&key), Some((current, _)) if *current == registration) {
            routes.replicas.remove(&key);
        }
    }

    /// Cuts every link to and from `replica_id`.
    pub fn isolate(&self, replica_id: &str) {
        self.lock().isolated.insert(ReplicaId::new(replica_id));
    }

    /// Undoes `isolate` and every `block_link` involving `replica_id`.
    pub fn reconnect(&self, replica_id: &str) {
        let replica_id = ReplicaId::new(replica_id);
        let mut routes = self.lock();
        routes.isolated.remove(&replica_id);
        routes
            .blocked_links
            .retain(|(a, b)| a != &replica_id && b != &replica_id);
    }

    /// Cuts the link between two replicas in both directions.
    pub fn block_link(&self, a: &str, b: &str) {
        let blocked = link(&ReplicaId::new(a), &ReplicaId::new(b));
        self.lock().blocked_links.insert(blocked);
    }

    pub fn heal(&self) {
        let mut routes = self.lock();
        routes.isolated.clear();
        routes.blocked_links.clear();
    }

    pub(crate) fn endpoint(&self, my_replica_id: ReplicaId) -> LocalEndpoint {
        LocalEndpoint {
            network: self.clone(),
            my_replica_id,
        }
    }

    fn route(&self, from: &ReplicaId, shard_id: &ShardId, to: &ReplicaId) -> Result<WeakActorClient, TransportError> {
        let routes = self.lock();
        if !routes.is_reachable(from, to) {
            return Err(TransportError::Unreachable(format!("{:?} (partitioned)", to)));
        }
        routes
            .replicas
            .get(&(shard_id.clone(), to.clone()))
            .map(|(_, actor_client)| actor_client.clone())
            .ok_or_else(|| TransportError::Unreachable(format!("{:?} is not running shard {:?}", to, shard_id)))
    }

    // A reply is lost if the link was cut while the request was being handled.
    fn check_reply_path(&self, from: &ReplicaId, to: &ReplicaId) -> Result<(), TransportError> {
        if self.lock().is_reachable(from, to) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!("{:?} (partitioned)", to)))
        }
    }
}

/// LocalEndpoint is one replica's view of the network.
pub(crate) struct LocalEndpoint {
    network: LocalNetwork,
    my_replica_id: ReplicaId,
}

#[async_trait::async_trait]
impl PeerTransport for LocalEndpoint {
    async fn request_vote(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
        let peer = self.network.route(&self.my_replica_id, shard_id, &target.replica_id)?;
        let result = peer.request_vote(input).await;
        self.network.check_reply_path(&self.my_replica_id, &target.replica_id)?;
        Ok(result)
    }

    async fn append_entries(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
        let peer = self.network.route(&self.my_replica_id, shard_id, &target.replica_id)?;
        let result = peer.append_entries(input).await;
        self.network.check_reply_path(&self.my_replica_id, &target.replica_id)?;
        Ok(result)
    }

    async fn install_snapshot(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
        let peer = self.network.route(&self.my_replica_id, shard_id, &target.replica_id)?;
        let result = peer.install_snapshot(input).await;
        self.network.check_reply_path(&self.my_replica_id, &target.replica_id)?;
        Ok(result)
    }

    async fn timeout_now(
        &self,
        shard_id: &ShardId,
        target: &ServerInfo,
        input: TimeoutNowInput,
    ) -> Result<Result<TimeoutNowOutput, TimeoutNowError>, TransportError> {
        let peer = self.network.route(&self.my_replica_id, shard_id, &target.replica_id)?;
        let result = peer.timeout_now(input).await;
        self.network.check_reply_path(&self.my_replica_id, &target.replica_id)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::replica::{RequestVoteOutput, Term};
    use crate::test_utils;

    fn vote_request() -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(1),
            candidate_id: ReplicaId::new("a"),
            candidate_last_log_entry: None,
        }
    }

    // Answers every RequestVote with a grant.
    async fn serve_votes(mut events: tokio::sync::mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            if let Event::RequestVote(input, callback) = event {
                callback.send(Ok(RequestVoteOutput {
                    term: input.candidate_term,
                    vote_granted: true,
                }));
            }
        }
    }

    #[tokio::test]
    async fn delivers_until_partitioned() {
        // -- setup --
        let network = LocalNetwork::new();
        let shard_id = ShardId::new("shard-1");
        let (b_client, b_events) = ActorClient::new(10);
        network.register(shard_id.clone(), ReplicaId::new("b"), b_client.weak());
        tokio::spawn(serve_votes(b_events));
        let a = network.endpoint(ReplicaId::new("a"));
        let b_info = test_utils::server("b", true);

        // -- execute & verify --
        let reply = a.request_vote(&shard_id, &b_info, vote_request()).await;
        assert!(matches!(reply, Ok(Ok(RequestVoteOutput { vote_granted: true, .. }))));

        network.block_link("b", "a");
        let reply = a.request_vote(&shard_id, &b_info, vote_request()).await;
        assert!(matches!(reply, Err(TransportError::Unreachable(_))));

        network.reconnect("a");
        let reply = a.request_vote(&shard_id, &b_info, vote_request()).await;
        assert!(reply.is_ok());

        network.isolate("b");
        let reply = a.request_vote(&shard_id, &b_info, vote_request()).await;
        assert!(matches!(reply, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn unknown_shard_is_unreachable() {
        let network = LocalNetwork::new();
        let a = network.endpoint(ReplicaId::new("a"));

        let reply = a
            .request_vote(&ShardId::new("nope"), &test_utils::server("b", true), vote_request())
            .await;

        assert!(matches!(reply, Err(TransportError::Unreachable(_))));
    }

    #[test]
    fn stale_deregistration_keeps_the_restarted_replica() {
        // -- setup --
        let network = LocalNetwork::new();
        let shard_id = ShardId::new("shard-1");
        let (old_client, _old_events) = ActorClient::new(1);
        let (new_client, _new_events) = ActorClient::new(1);
        let old = network.register(shard_id.clone(), ReplicaId::new("b"), old_client.weak());
        let _new = network.register(shard_id.clone(), ReplicaId::new("b"), new_client.weak());

        // -- execute --
        network.deregister(&shard_id, &ReplicaId::new("b"), old);

        // -- verify --
        assert!(network.route(&ReplicaId::new("a"), &shard_id, &ReplicaId::new("b")).is_ok());
    }
}
