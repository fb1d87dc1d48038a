#![allow(dead_code)]

use bytes::Bytes;
use shard_raft::{
    ClientGateway, LocalNetwork, MemoryStore, RaftEntryId, RaftMemberInfo, RaftOptions, RaftProposeError,
    RaftProposeInput, RaftProposeOutput, RaftShard, RaftShardConfig, RaftStatus, RaftStorage, StateMachine,
};
use slog::Drain;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub const SHARD: &str = "shard-1";

/// Tests log nothing unless RAFT_TEST_LOG is set.
pub fn test_logger() -> slog::Logger {
    if std::env::var_os("RAFT_TEST_LOG").is_none() {
        return slog::Logger::root(slog::Discard, slog::o!());
    }
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn fast_options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(30)),
        follower_min_timeout: Some(Duration::from_millis(200)),
        follower_max_timeout: Some(Duration::from_millis(400)),
        leader_append_entries_timeout: Some(Duration::from_millis(100)),
        proposal_timeout: Some(Duration::from_secs(3)),
        ..Default::default()
    }
}

pub fn member(id: &str, voting: bool) -> RaftMemberInfo {
    let port = 5000 + id.bytes().map(|b| b as u16).sum::<u16>() % 1000;
    RaftMemberInfo {
        replica_id: id.to_string(),
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        voting,
    }
}

pub fn put(key: &str, value: &str) -> Bytes {
    Bytes::from(format!("put {} {}", key, value))
}

// ------- Key value state machine --------

#[derive(Default)]
struct KvState {
    data: BTreeMap<String, String>,
    // How often each key was written since start or the last restore.
    writes: HashMap<String, u64>,
}

/// KvStateMachine understands `put <key> <value>` and answers with the previous value. Clones
/// share state so tests can inspect a replica's view.
#[derive(Clone, Default)]
pub struct KvStateMachine {
    state: Arc<Mutex<KvState>>,
}

impl KvStateMachine {
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }

    pub fn writes(&self, key: &str) -> u64 {
        self.state.lock().unwrap().writes.get(key).copied().unwrap_or(0)
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, _entry_id: RaftEntryId, payload: &Bytes) -> Bytes {
        let command = String::from_utf8_lossy(payload).to_string();
        let mut parts = command.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("put"), Some(key), Some(value)) => {
                let mut state = self.state.lock().unwrap();
                *state.writes.entry(key.to_string()).or_insert(0) += 1;
                let previous = state.data.insert(key.to_string(), value.to_string());
                Bytes::from(previous.unwrap_or_default())
            }
            _ => Bytes::from_static(b"invalid command"),
        }
    }

    fn snapshot(&self) -> Bytes {
        let state = self.state.lock().unwrap();
        let lines: Vec<String> = state.data.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Bytes::from(lines.join("\n"))
    }

    fn restore(&mut self, snapshot: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.data.clear();
        state.writes.clear();
        for line in String::from_utf8_lossy(&snapshot).lines() {
            if let Some((key, value)) = line.split_once('=') {
                state.data.insert(key.to_string(), value.to_string());
            }
        }
    }
}

// ------- Cluster on LocalNetwork --------

pub struct TestReplica {
    pub shard: RaftShard,
    pub kv: KvStateMachine,
}

impl TestReplica {
    pub fn gateway(&self) -> &ClientGateway {
        &self.shard.gateway
    }

    pub async fn status(&self) -> RaftStatus {
        self.shard.gateway.status().await.expect("replica is running")
    }
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub logger: slog::Logger,
    pub options: RaftOptions,
    pub bootstrap: Vec<RaftMemberInfo>,
    pub replicas: HashMap<String, TestReplica>,
    pub stores: HashMap<String, MemoryStore>,
}

impl TestCluster {
    /// Starts one replica per id, all voting, each on its own MemoryStore.
    pub fn start(ids: &[&str], options: RaftOptions) -> Self {
        let mut cluster = TestCluster {
            network: LocalNetwork::new(),
            logger: test_logger(),
            options,
            bootstrap: ids.iter().map(|id| member(id, true)).collect(),
            replicas: HashMap::new(),
            stores: HashMap::new(),
        };
        for id in ids {
            let store = MemoryStore::new();
            cluster.stores.insert(id.to_string(), store.clone());
            cluster.start_replica(id, cluster.bootstrap.clone(), store.into());
        }
        cluster
    }

    pub fn start_replica(&mut self, id: &str, bootstrap_members: Vec<RaftMemberInfo>, store: RaftStorage) {
        let kv = KvStateMachine::default();
        let shard = shard_raft::create_local_shard(
            RaftShardConfig {
                shard_id: SHARD.to_string(),
                my_replica_id: id.to_string(),
                bootstrap_members,
                store,
                state_machine: Box::new(kv.clone()),
                logger: self.logger.clone(),
                options: self.options.clone(),
            },
            &self.network,
        )
        .expect("replica starts");
        self.replicas.insert(id.to_string(), TestReplica { shard, kv });
    }

    /// Restarts `id` on the MemoryStore it used before.
    pub fn restart_replica(&mut self, id: &str) {
        let store = self.stores.get(id).expect("known replica").clone();
        self.start_replica(id, self.bootstrap.clone(), store.into());
    }

    /// Drops the replica's only gateway, which stops it.
    pub fn kill(&mut self, id: &str) {
        self.replicas.remove(id);
    }

    pub fn replica(&self, id: &str) -> &TestReplica {
        self.replicas.get(id).expect("replica is running")
    }

    /// Waits until a running replica claims leadership. A stale leader cut off from the rest loses
    /// to the one with the newer term.
    pub async fn wait_for_leader(&self, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.current_leader().await {
                return leader;
            }
            assert!(Instant::now() < deadline, "No leader elected within {:?}", timeout);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn current_leader(&self) -> Option<String> {
        let mut leader: Option<(String, u64)> = None;
        for (id, replica) in &self.replicas {
            let status = match replica.gateway().status().await {
                Ok(status) => status,
                Err(_) => continue,
            };
            if status.is_leader() && leader.as_ref().map_or(true, |(_, term)| status.term > *term) {
                leader = Some((id.clone(), status.term));
            }
        }
        leader.map(|(id, _)| id)
    }

    pub fn followers_of(&self, leader: &str) -> Vec<String> {
        let mut followers: Vec<String> = self.replicas.keys().filter(|id| *id != leader).cloned().collect();
        followers.sort();
        followers
    }

    pub async fn propose(
        &self,
        id: &str,
        request_id: Option<&str>,
        payload: Bytes,
    ) -> Result<RaftProposeOutput, RaftProposeError> {
        self.replica(id)
            .gateway()
            .propose(RaftProposeInput {
                client_request_id: request_id.map(str::to_string),
                payload,
            })
            .await
    }

    /// Keeps proposing to whoever currently leads until the entry commits or turns out to be a
    /// duplicate. Used while leadership may still move.
    pub async fn propose_to_leader(
        &self,
        request_id: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<RaftProposeOutput, RaftProposeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let leader = self.wait_for_leader(timeout).await;
            match self.propose(&leader, Some(request_id), payload.clone()).await {
                Err(RaftProposeError::NotLeader { .. })
                | Err(RaftProposeError::EntryDiscarded)
                | Err(RaftProposeError::Timeout)
                    if Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                result => return result,
            }
        }
    }

    /// Waits until `id` applied at least through `index`.
    pub async fn wait_for_applied(&self, id: &str, index: u64, timeout: Duration) -> RaftStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.replica(id).status().await;
            if status.last_applied.map_or(false, |applied| applied >= index) {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "{} applied only {:?} of {} within {:?}",
                id,
                status.last_applied,
                index,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
