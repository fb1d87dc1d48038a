mod common;

use common::{fast_options, member, put, KvStateMachine, TestCluster, SHARD};
use shard_raft::{FileStore, LocalNetwork, RaftMemberInfo, RaftProposeInput, RaftShard, RaftShardConfig};
use std::path::Path;
use tokio::time::Duration;

#[tokio::test]
async fn cluster_restarted_from_memory_stores_keeps_its_state() {
    // -- setup --
    let mut cluster = TestCluster::start(&["a", "b", "c"], fast_options());
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let mut last = 0;
    for i in 1..=5 {
        let output = cluster
            .propose(&leader, Some(&format!("req-{}", i)), put(&format!("k{}", i), &i.to_string()))
            .await
            .expect("commits");
        last = output.entry_id.index();
    }
    let term_before = cluster.replica(&leader).status().await.term;

    // -- execute --
    for id in &["a", "b", "c"] {
        cluster.kill(id);
    }
    for id in &["a", "b", "c"] {
        cluster.restart_replica(id);
    }

    // -- verify --
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert!(cluster.replica(&leader).status().await.term > term_before);
    for id in &["a", "b", "c"] {
        cluster.wait_for_applied(id, last, Duration::from_secs(5)).await;
        let kv = &cluster.replica(id).kv;
        for i in 1..=5 {
            assert_eq!(kv.get(&format!("k{}", i)), Some(i.to_string()), "{} value of k{}", id, i);
        }
    }

    // Dedup state is rebuilt by replaying the log.
    let retry = cluster
        .propose(&leader, Some("req-3"), put("k3", "again"))
        .await;
    assert!(
        matches!(retry, Err(shard_raft::RaftProposeError::DuplicateRequest { .. })),
        "Unexpected result {:?}",
        retry
    );
    assert_eq!(cluster.replica(&leader).kv.get("k3"), Some("3".to_string()));
}

fn start_on_disk(
    network: &LocalNetwork,
    id: &str,
    members: &[RaftMemberInfo],
    dir: &Path,
) -> (RaftShard, KvStateMachine) {
    let logger = common::test_logger();
    let store = FileStore::open(logger.clone(), dir.join(id)).expect("store opens");
    let kv = KvStateMachine::default();
    let shard = shard_raft::create_local_shard(
        RaftShardConfig {
            shard_id: SHARD.to_string(),
            my_replica_id: id.to_string(),
            bootstrap_members: members.to_vec(),
            store: store.into(),
            state_machine: Box::new(kv.clone()),
            logger,
            options: fast_options(),
        },
        network,
    )
    .expect("replica starts");
    (shard, kv)
}

#[tokio::test]
async fn single_replica_restarted_from_disk_replays_its_log() {
    // -- setup --
    let dir = tempfile::tempdir().unwrap();
    let network = LocalNetwork::new();
    let members = vec![member("solo", true)];
    let (shard, _) = start_on_disk(&network, "solo", &members, dir.path());
    let mut written = Vec::new();
    for i in 1..=20 {
        let output = propose_when_leader(&shard, &format!("k{}", i), &i.to_string()).await;
        written.push(output);
    }
    shard.gateway.trigger_snapshot().await.expect("snapshot succeeds");
    for i in 21..=25 {
        written.push(propose_when_leader(&shard, &format!("k{}", i), &i.to_string()).await);
    }
    let before = shard.gateway.status().await.unwrap();

    // -- execute --
    drop(shard);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (restarted, kv) = start_on_disk(&network, "solo", &members, dir.path());

    // -- verify --
    let last_written = written.last().copied();
    let mut after = restarted.gateway.status().await.unwrap();
    for _ in 0..100 {
        if after.last_applied >= last_written {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        after = restarted.gateway.status().await.unwrap();
    }
    assert!(after.term >= before.term);
    assert_eq!(after.snapshot_index(), before.snapshot_index());
    assert!(after.last_applied >= last_written);
    assert_eq!(kv.len(), 25);
    assert_eq!(kv.get("k25"), Some("25".to_string()));
}

async fn propose_when_leader(shard: &RaftShard, key: &str, value: &str) -> u64 {
    for _ in 0..100 {
        let result = shard
            .gateway
            .propose(RaftProposeInput {
                client_request_id: None,
                payload: put(key, value),
            })
            .await;
        match result {
            Ok(output) => return output.entry_id.index(),
            Err(shard_raft::RaftProposeError::NotLeader { .. }) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Unexpected error {:?}", e),
        }
    }
    panic!("Never became leader");
}

#[tokio::test]
async fn three_replicas_restarted_from_disk_agree_again() {
    // -- setup --
    let dir = tempfile::tempdir().unwrap();
    let network = LocalNetwork::new();
    let members: Vec<RaftMemberInfo> = ["a", "b", "c"].iter().map(|id| member(id, true)).collect();
    let mut shards: Vec<(RaftShard, KvStateMachine)> = ["a", "b", "c"]
        .iter()
        .map(|id| start_on_disk(&network, id, &members, dir.path()))
        .collect();

    let mut last = 0;
    for i in 1..=5 {
        last = propose_anywhere(&shards, &format!("k{}", i), "v").await;
    }

    // -- execute --
    shards.clear();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let shards: Vec<(RaftShard, KvStateMachine)> = ["a", "b", "c"]
        .iter()
        .map(|id| start_on_disk(&network, id, &members, dir.path()))
        .collect();
    let sixth = propose_anywhere(&shards, "k6", "v").await;

    // -- verify --
    assert!(sixth > last);
    for (shard, kv) in &shards {
        for _ in 0..100 {
            let status = shard.gateway.status().await.unwrap();
            if status.last_applied >= Some(sixth) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(kv.len(), 6);
    }
}

async fn propose_anywhere(shards: &[(RaftShard, KvStateMachine)], key: &str, value: &str) -> u64 {
    for _ in 0..100 {
        for (shard, _) in shards {
            let result = shard
                .gateway
                .propose(RaftProposeInput {
                    client_request_id: Some(key.to_string()),
                    payload: put(key, value),
                })
                .await;
            match result {
                Ok(output) => return output.entry_id.index(),
                Err(shard_raft::RaftProposeError::DuplicateRequest { entry_id }) => return entry_id.index(),
                Err(_) => continue,
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("No replica accepted {}", key);
}
