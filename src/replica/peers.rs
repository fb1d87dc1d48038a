use std::fmt;

/// ReplicaId identifies one member of a shard's Raft group.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(replica_id: impl Into<String>) -> Self {
        ReplicaId(replica_id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ShardId names an independent Raft group. One process may host replicas of many shards.
#[derive(Clone, Hash, Eq, PartialEq)]
pub(crate) struct ShardId(String);

impl ShardId {
    pub(crate) fn new(shard_id: impl Into<String>) -> Self {
        ShardId(shard_id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
