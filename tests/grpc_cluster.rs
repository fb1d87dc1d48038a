mod common;

use bytes::Bytes;
use common::{fast_options, put, KvStateMachine};
use shard_raft::{
    MemoryStore, RaftMemberInfo, RaftNode, RaftNodeConfig, RaftRemoteClient, RaftRemoteProposeError, RaftShard,
    RaftShardConfig,
};
use std::net::{SocketAddr, TcpListener};
use tokio::time::{Duration, Instant};

fn free_local_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn wait_for_leader(shards: &[(String, RaftShard, KvStateMachine)], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    loop {
        for (i, (_, shard, _)) in shards.iter().enumerate() {
            if shard.gateway.status().await.map_or(false, |status| status.is_leader()) {
                return i;
            }
        }
        assert!(Instant::now() < deadline, "No leader elected within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn shard_replicates_over_grpc() {
    // -- setup --
    let logger = common::test_logger();
    let members: Vec<RaftMemberInfo> = ["a", "b", "c"]
        .iter()
        .map(|id| RaftMemberInfo {
            replica_id: id.to_string(),
            addr: free_local_addr(),
            voting: true,
        })
        .collect();

    let mut nodes = Vec::new();
    let mut shards = Vec::new();
    for member in &members {
        let node = RaftNode::start(RaftNodeConfig {
            listen_addr: member.addr,
            logger: logger.clone(),
            default_proposal_timeout: None,
        });
        let kv = KvStateMachine::default();
        let shard = node
            .create_shard(RaftShardConfig {
                shard_id: common::SHARD.to_string(),
                my_replica_id: member.replica_id.clone(),
                bootstrap_members: members.clone(),
                store: MemoryStore::new().into(),
                state_machine: Box::new(kv.clone()),
                logger: logger.clone(),
                options: fast_options(),
            })
            .expect("shard starts");
        nodes.push(node);
        shards.push((member.replica_id.clone(), shard, kv));
    }
    let leader = wait_for_leader(&shards, Duration::from_secs(10)).await;
    let follower = (leader + 1) % shards.len();

    // -- execute --
    let client = RaftRemoteClient::connect(logger.clone(), nodes[leader].listen_addr())
        .await
        .expect("leader's node accepts connections");
    let output = client
        .propose(common::SHARD, Some("req-1".to_string()), put("k", "v"), None)
        .await
        .expect("commits");
    let duplicate = client
        .propose(common::SHARD, Some("req-1".to_string()), put("k", "v"), None)
        .await;
    let unknown_shard = client
        .propose("no-such-shard", None, Bytes::from_static(b"put k v"), None)
        .await;

    let follower_client = RaftRemoteClient::connect(logger.clone(), nodes[follower].listen_addr())
        .await
        .expect("follower's node accepts connections");
    let redirected = follower_client
        .propose(common::SHARD, None, put("k", "w"), Some(Duration::from_secs(1)))
        .await;

    // -- verify --
    match duplicate {
        Err(RaftRemoteProposeError::DuplicateRequest { entry_id }) => assert_eq!(entry_id, output.entry_id),
        other => panic!("Unexpected result {:?}", other),
    }
    match unknown_shard {
        Err(RaftRemoteProposeError::Rpc(status)) => assert_eq!(status.code(), tonic::Code::NotFound),
        other => panic!("Unexpected result {:?}", other),
    }
    match redirected {
        Err(RaftRemoteProposeError::NotLeader { leader_hint: Some(hint) }) => {
            assert_eq!(hint.replica_id, shards[leader].0);
            assert_eq!(hint.addr, Some(members[leader].addr));
        }
        // The follower may not have heard from the leader yet.
        Err(RaftRemoteProposeError::NotLeader { leader_hint: None }) => {}
        other => panic!("Unexpected result {:?}", other),
    }

    for (id, shard, kv) in &shards {
        let deadline = Instant::now() + Duration::from_secs(5);
        while kv.get("k").is_none() {
            assert!(Instant::now() < deadline, "{} never applied k", id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(kv.get("k"), Some("v".to_string()));
        assert!(shard.gateway.status().await.unwrap().commit_index >= Some(output.entry_id.index()));
    }

    for node in nodes {
        node.shutdown();
    }
}
