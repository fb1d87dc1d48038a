use crate::actor::WeakActorClient;
use crate::replica::ShardId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// ShardRegistry maps the shards hosted by one server to their replicas. Entries are weak, so a
/// shard whose gateway is dropped stops answering even before it is deregistered.
#[derive(Clone, Default)]
pub(crate) struct ShardRegistry {
    shards: Arc<Mutex<HashMap<ShardId, WeakActorClient>>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Shard {0:?} is already hosted here")]
pub(crate) struct ShardAlreadyRegistered(pub(crate) ShardId);

impl ShardRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ShardId, WeakActorClient>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        shard_id: ShardId,
        actor_client: WeakActorClient,
    ) -> Result<(), ShardAlreadyRegistered> {
        let mut shards = self.lock();
        if shards.contains_key(&shard_id) {
            return Err(ShardAlreadyRegistered(shard_id));
        }
        shards.insert(shard_id, actor_client);
        Ok(())
    }

    pub(crate) fn deregister(&self, shard_id: &ShardId) {
        self.lock().remove(shard_id);
    }

    pub(crate) fn lookup(&self, shard_id: &ShardId) -> Option<WeakActorClient> {
        self.lock().get(shard_id).cloned()
    }
}
