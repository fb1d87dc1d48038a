use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::replica_api::{SnapshotError, SnapshotOutput, SnapshotPersisted};
use crate::storage::{EncodedSnapshot, Snapshot, SnapshotStore};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;

pub(crate) type SnapshotCallback = Callback<SnapshotOutput, SnapshotError>;

#[derive(Clone, Debug)]
pub(crate) struct SnapshotPolicy {
    pub(crate) batch_count: u64,
    pub(crate) data_threshold: usize,
    pub(crate) chunk_size: usize,
}

/// SnapshotManager decides when to capture a snapshot, runs its persistence off the actor, and
/// holds the latest durable image so it can be streamed to lagging followers.
pub(crate) struct SnapshotManager {
    logger: slog::Logger,
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    task: SnapshotTask,
    latest: Option<Arc<EncodedSnapshot>>,
    // Set when the latest snapshot on disk was written in an older format.
    needs_migration: bool,
    installed_count: u64,
    receiver: Option<SnapshotReceiver>,
}

enum SnapshotTask {
    Idle,
    Persisting {
        last_included: (Term, Index),
        callback: Option<SnapshotCallback>,
    },
}

/// A snapshot that is durable and can now be used to compact the log.
pub(crate) struct PersistedSnapshot {
    pub(crate) encoded: Arc<EncodedSnapshot>,
    pub(crate) callback: Option<SnapshotCallback>,
}

impl SnapshotManager {
    pub(crate) fn new(
        logger: slog::Logger,
        store: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
        recovered: Option<&Snapshot>,
    ) -> io::Result<Self> {
        let (latest, needs_migration) = match recovered {
            Some(snapshot) => (Some(Arc::new(snapshot.encode()?)), snapshot.needs_migration()),
            None => (None, false),
        };

        Ok(SnapshotManager {
            logger,
            store,
            policy,
            task: SnapshotTask::Idle,
            latest,
            needs_migration,
            installed_count: 0,
            receiver: None,
        })
    }

    pub(crate) fn latest(&self) -> Option<Arc<EncodedSnapshot>> {
        self.latest.clone()
    }

    pub(crate) fn installed_count(&self) -> u64 {
        self.installed_count
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.policy.chunk_size
    }

    pub(crate) fn is_persisting(&self) -> bool {
        matches!(self.task, SnapshotTask::Persisting { .. })
    }

    /// True if a snapshot should be captured now, evaluated after entries were applied.
    pub(crate) fn should_capture(
        &self,
        last_applied: Option<Index>,
        snapshot_last: Option<(Term, Index)>,
        log_data_size: usize,
    ) -> bool {
        if self.is_persisting() {
            return false;
        }
        let last_applied = match last_applied {
            Some(index) => index.as_u64(),
            None => return false,
        };
        let snapshot_index = snapshot_last.map(|(_, index)| index.as_u64()).unwrap_or(0);
        if last_applied <= snapshot_index {
            return false;
        }

        self.needs_migration
            || last_applied - snapshot_index >= self.policy.batch_count
            || log_data_size >= self.policy.data_threshold
    }

    /// Starts writing `snapshot` on a blocking thread. The result comes back to the actor as a
    /// `SnapshotPersisted` event.
    pub(crate) fn begin_persist(
        &mut self,
        snapshot: Snapshot,
        callback: Option<SnapshotCallback>,
        actor_client: WeakActorClient,
    ) {
        if let SnapshotTask::Persisting { .. } = self.task {
            if let Some(cb) = callback {
                cb.send(Err(SnapshotError::AlreadyInProgress));
            }
            return;
        }

        let last_included = snapshot.last_included;
        slog::info!(self.logger, "Capturing snapshot through {:?}", last_included);
        self.task = SnapshotTask::Persisting {
            last_included,
            callback,
        };

        let store = self.store.clone();
        tokio::task::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let encoded = snapshot.encode()?;
                store.save(&encoded)?;
                Ok(encoded)
            })
            .await
            .unwrap_or_else(|join_error| Err(io::Error::new(io::ErrorKind::Other, join_error)));

            let _ = actor_client
                .notify_snapshot_persisted(SnapshotPersisted { last_included, result })
                .await;
        });
    }

    /// Returns the snapshot to compact the log with, or None if the write failed or a newer
    /// snapshot was installed while this one was being written.
    pub(crate) fn finish_persisting(&mut self, persisted: SnapshotPersisted) -> Option<PersistedSnapshot> {
        let callback = match std::mem::replace(&mut self.task, SnapshotTask::Idle) {
            SnapshotTask::Persisting {
                last_included,
                callback,
            } if last_included == persisted.last_included => callback,
            other => {
                slog::warn!(
                    self.logger,
                    "Ignoring completion of unknown snapshot {:?}",
                    persisted.last_included
                );
                self.task = other;
                return None;
            }
        };

        let encoded = match persisted.result {
            Ok(encoded) => encoded,
            Err(e) => {
                slog::error!(
                    self.logger,
                    "Failed to persist snapshot {:?}, keeping the log as is: {:?}",
                    persisted.last_included,
                    e
                );
                if let Some(cb) = callback {
                    cb.send(Err(SnapshotError::PersistFailed(e)));
                }
                return None;
            }
        };
        self.needs_migration = false;

        if let Some(latest) = &self.latest {
            if latest.last_included.1 >= encoded.last_included.1 {
                slog::info!(
                    self.logger,
                    "Snapshot {:?} finished after newer snapshot {:?}",
                    encoded.last_included,
                    latest.last_included
                );
                if let Some(cb) = callback {
                    cb.send(Ok(SnapshotOutput {
                        last_included: encoded.last_included,
                    }));
                }
                return None;
            }
        }

        let encoded = Arc::new(encoded);
        self.latest = Some(encoded.clone());
        Some(PersistedSnapshot { encoded, callback })
    }

    /// Accumulates one InstallSnapshot chunk. Returns the offset expected next, or the offset that
    /// was expected instead of `offset` if the chunk doesn't continue the transfer.
    pub(crate) fn receive_chunk(
        &mut self,
        leader_term: Term,
        last_included: (Term, Index),
        offset: u64,
        data: &Bytes,
    ) -> Result<u64, u64> {
        if offset == 0 {
            self.receiver = Some(SnapshotReceiver {
                leader_term,
                last_included,
                buffer: BytesMut::with_capacity(data.len()),
            });
        }

        let receiver = match self.receiver.as_mut() {
            Some(r) if r.leader_term == leader_term && r.last_included == last_included => r,
            _ => return Err(0),
        };
        let expected = receiver.buffer.len() as u64;
        if offset != expected {
            return Err(expected);
        }

        receiver.buffer.extend_from_slice(data);
        Ok(receiver.buffer.len() as u64)
    }

    /// Hands out the bytes gathered for `last_included` once the final chunk arrived.
    pub(crate) fn take_received(&mut self, last_included: (Term, Index)) -> Option<Bytes> {
        match self.receiver.take() {
            Some(r) if r.last_included == last_included => Some(r.buffer.freeze()),
            other => {
                self.receiver = other;
                None
            }
        }
    }

    /// Writes a snapshot received from the leader. Called on the actor, because the final chunk
    /// is only acknowledged once the snapshot is durable.
    pub(crate) fn save_installed(&mut self, encoded: EncodedSnapshot) -> io::Result<()> {
        self.store.save(&encoded)?;
        self.latest = Some(Arc::new(encoded));
        self.installed_count += 1;
        Ok(())
    }
}

struct SnapshotReceiver {
    leader_term: Term,
    last_included: (Term, Index),
    buffer: BytesMut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::storage::MemoryStore;
    use crate::test_utils::{self, snapshot_with};

    fn policy(batch_count: u64) -> SnapshotPolicy {
        SnapshotPolicy {
            batch_count,
            data_threshold: 1024,
            chunk_size: 4,
        }
    }

    fn manager(batch_count: u64) -> SnapshotManager {
        let store = MemoryStore::new();
        SnapshotManager::new(test_utils::test_logger(), Arc::new(store), policy(batch_count), None).unwrap()
    }

    fn id(term: u64, index: u64) -> (Term, Index) {
        (Term::new(term), Index::new(index))
    }

    #[test]
    fn capture_thresholds() {
        let mgr = manager(10);

        assert!(!mgr.should_capture(None, None, 0));
        assert!(!mgr.should_capture(Some(Index::new(9)), None, 0));
        assert!(mgr.should_capture(Some(Index::new(10)), None, 0));
        assert!(!mgr.should_capture(Some(Index::new(15)), Some(id(1, 10)), 0));
        assert!(mgr.should_capture(Some(Index::new(11)), Some(id(1, 10)), 2048));
        assert!(!mgr.should_capture(Some(Index::new(10)), Some(id(1, 10)), 2048));
    }

    #[test]
    fn legacy_snapshot_triggers_migration() {
        let mut legacy = snapshot_with(Term::new(1), Index::new(5), Bytes::from_static(b"old"));
        legacy.format_version = 0;
        let mgr = SnapshotManager::new(
            test_utils::test_logger(),
            Arc::new(MemoryStore::new()),
            policy(1000),
            Some(&legacy),
        )
        .unwrap();

        assert!(mgr.should_capture(Some(Index::new(6)), Some(id(1, 5)), 0));
    }

    #[tokio::test]
    async fn persist_then_finish() {
        // -- setup --
        let (actor_client, mut rx) = ActorClient::new(10);
        let mut mgr = manager(10);

        // -- execute --
        let snapshot = snapshot_with(Term::new(2), Index::new(10), Bytes::from_static(b"state"));
        mgr.begin_persist(snapshot, None, actor_client.weak());
        assert!(mgr.is_persisting());
        let persisted = match rx.recv().await {
            Some(crate::actor::Event::SnapshotPersisted(persisted)) => persisted,
            other => panic!("Unexpected event: {:?}", other),
        };
        let finished = mgr.finish_persisting(persisted);

        // -- verify --
        let finished = finished.expect("snapshot should be usable for compaction");
        assert_eq!(finished.encoded.last_included, id(2, 10));
        assert!(!mgr.is_persisting());
        assert_eq!(mgr.latest().unwrap().last_included, id(2, 10));
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() {
        // -- setup --
        let store = MemoryStore::new();
        store.fail_writes(true);
        let mut mgr =
            SnapshotManager::new(test_utils::test_logger(), Arc::new(store.clone()), policy(10), None).unwrap();
        let (actor_client, mut rx) = ActorClient::new(10);
        let (tx, cb_rx) = tokio::sync::oneshot::channel();

        // -- execute --
        let snapshot = snapshot_with(Term::new(1), Index::new(3), Bytes::from_static(b"state"));
        mgr.begin_persist(snapshot, Some(Callback::new(tx)), actor_client.weak());
        let persisted = match rx.recv().await {
            Some(crate::actor::Event::SnapshotPersisted(persisted)) => persisted,
            other => panic!("Unexpected event: {:?}", other),
        };

        // -- verify --
        assert!(mgr.finish_persisting(persisted).is_none());
        assert!(matches!(cb_rx.await.unwrap(), Err(SnapshotError::PersistFailed(_))));
        assert!(mgr.latest().is_none());
        assert!(!mgr.is_persisting());
    }

    #[test]
    fn chunks_must_be_contiguous() {
        let mut mgr = manager(10);
        let term = Term::new(4);
        let snap = id(3, 50);

        assert_eq!(mgr.receive_chunk(term, snap, 0, &Bytes::from_static(b"abcd")), Ok(4));
        // Retransmission of the first chunk after a lost reply restarts the transfer.
        assert_eq!(mgr.receive_chunk(term, snap, 0, &Bytes::from_static(b"abcd")), Ok(4));
        assert_eq!(mgr.receive_chunk(term, snap, 8, &Bytes::from_static(b"ijkl")), Err(4));
        assert_eq!(mgr.receive_chunk(term, snap, 4, &Bytes::from_static(b"ef")), Ok(6));
        // A different snapshot can't continue this transfer.
        assert_eq!(mgr.receive_chunk(term, id(3, 60), 6, &Bytes::from_static(b"gh")), Err(0));

        assert_eq!(mgr.take_received(snap), Some(Bytes::from_static(b"abcdef")));
        assert_eq!(mgr.take_received(snap), None);
    }

    #[test]
    fn installed_snapshot_is_saved_and_counted() {
        let store = MemoryStore::new();
        let mut mgr =
            SnapshotManager::new(test_utils::test_logger(), Arc::new(store.clone()), policy(10), None).unwrap();

        let encoded = snapshot_with(Term::new(2), Index::new(40), Bytes::from_static(b"leader state"))
            .encode()
            .unwrap();
        mgr.save_installed(encoded).unwrap();

        assert_eq!(mgr.installed_count(), 1);
        assert_eq!(store.load_latest().unwrap().unwrap().last_included, id(2, 40));
    }
}
