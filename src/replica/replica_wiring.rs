use crate::actor::WeakActorClient;
use crate::api::StateMachine;
use crate::commitlog::{Index, LogEntry, ReplicatedLog};
use crate::network::PeerTransport;
use crate::replica::apply::Applier;
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::LocalState;
use crate::replica::membership::{MembershipState, ServerConfiguration};
use crate::replica::peers::{ReplicaId, ShardId};
use crate::replica::replica::{Replica, ReplicaParts, ReplicationLimits};
use crate::replica::snapshot::{SnapshotManager, SnapshotPolicy};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::storage::{PersistentStore, Snapshot};
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) shard_id: ShardId,
    pub(crate) my_replica_id: ReplicaId,
    // Used only when nothing durable says otherwise.
    pub(crate) bootstrap_config: ServerConfiguration,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) limits: ReplicationLimits,
    pub(crate) snapshot_policy: SnapshotPolicy,
    pub(crate) dedup_window: usize,
}

/// Recovers durable state and builds a replica from it. Committed entries are re-applied before
/// this returns, so the state machine is current before the actor handles its first event.
pub(crate) fn create_replica(
    config: ReplicaConfig,
    mut store: Box<dyn PersistentStore>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn PeerTransport>,
    actor_client: WeakActorClient,
) -> io::Result<(Replica, ElectionStateChangeListener)> {
    let logger = config.logger;
    let recovered = store.recover()?;
    slog::info!(
        logger,
        "Recovered term {:?}, vote {:?}, {} journal entries, snapshot {:?}, commit {:?}",
        recovered.term,
        recovered.voted_for,
        recovered.entries.len(),
        recovered.snapshot.as_ref().map(|s| s.last_included),
        recovered.commit_index
    );

    let snapshot = recovered.snapshot;
    let log = rebuild_log(snapshot.as_ref(), recovered.entries)?;

    let snapshot_index = snapshot.as_ref().map(|s| s.last_included.1);
    let commit_index = std::cmp::min(
        std::cmp::max(snapshot_index, recovered.commit_index),
        log.last_index(),
    );

    let mut membership = match &snapshot {
        Some(snapshot) => {
            let mut membership = MembershipState::new(snapshot.server_config.clone());
            membership.reset(snapshot.server_config.clone(), snapshot_index);
            membership
        }
        None => MembershipState::new(config.bootstrap_config),
    };
    for entry in log.iter_from(Index::start_index()) {
        if let Some(server_config) = entry.server_config() {
            membership.on_append(entry.index, server_config.clone());
        }
    }
    if let Some(commit_index) = commit_index {
        membership.on_commit(commit_index);
    }

    let mut applier = Applier::new(logger.clone(), state_machine, config.dedup_window);
    if let Some(snapshot) = &snapshot {
        applier.restore(snapshot);
    }

    let snapshots = SnapshotManager::new(
        logger.clone(),
        store.snapshot_store(),
        config.snapshot_policy,
        snapshot.as_ref(),
    )?;

    let local_state = LocalState::new(config.my_replica_id.clone(), recovered.term, recovered.voted_for);
    let (election_state, listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: config.my_replica_id.clone(),
            leader_heartbeat_duration: config.leader_heartbeat_duration,
            follower_min_timeout: config.follower_min_timeout,
            follower_max_timeout: config.follower_max_timeout,
        },
        actor_client.clone(),
        local_state.current_term(),
    );

    let mut replica = Replica::new(ReplicaParts {
        logger,
        shard_id: config.shard_id,
        my_replica_id: config.my_replica_id,
        local_state,
        election_state,
        wal: WriteAheadLog::new(log, store, commit_index),
        membership,
        applier,
        snapshots,
        actor_client,
        transport,
        limits: config.limits,
        transfer_timeout: config.follower_max_timeout,
    });
    replica.replay_committed();

    Ok((replica, listener))
}

/// The snapshot's unapplied entries seed the log after its last included index. Journal entries
/// win from the first one onwards, and the result must be contiguous.
fn rebuild_log(snapshot: Option<&Snapshot>, journal_entries: Vec<LogEntry>) -> io::Result<ReplicatedLog> {
    let mut log = ReplicatedLog::new();
    let snapshot_index = snapshot.map(|s| s.last_included.1);
    if let Some(snapshot) = snapshot {
        let (term, index) = snapshot.last_included;
        log.reset_to_snapshot(term, index);
    }

    let journal_entries: Vec<LogEntry> = journal_entries
        .into_iter()
        .filter(|entry| Some(entry.index) > snapshot_index)
        .collect();
    let first_journal_index = journal_entries.first().map(|entry| entry.index);

    let mut entries: Vec<LogEntry> = match snapshot {
        Some(snapshot) => snapshot
            .unapplied_entries
            .iter()
            .filter(|entry| Some(entry.index) > snapshot_index)
            .filter(|entry| first_journal_index.map_or(true, |first| entry.index < first))
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    entries.extend(journal_entries);

    let mut expected = log.next_index();
    for entry in &entries {
        if entry.index != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Recovered log is not contiguous: expected entry {:?}, found {:?}",
                    expected, entry.index
                ),
            ));
        }
        expected = entry.index.plus(1);
    }

    log.append(entries);
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::EntryPayload;
    use crate::replica::Term;
    use crate::test_utils::{snapshot_with, voters};
    use bytes::Bytes;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            client_request_id: None,
            payload: EntryPayload::Command(Bytes::from_static(b"x")),
        }
    }

    #[test]
    fn journal_only() {
        let log = rebuild_log(None, vec![entry(1, 1), entry(1, 2)]).unwrap();
        assert_eq!(log.latest_entry(), Some((Term::new(1), Index::new(2))));
    }

    #[test]
    fn journal_entries_override_unapplied_ones() {
        // -- setup --
        let mut snapshot = snapshot_with(Term::new(1), Index::new(5), Bytes::new());
        snapshot.unapplied_entries = vec![entry(1, 6), entry(1, 7), entry(1, 8)];
        snapshot.server_config = voters(&["a", "b", "c"]);

        // -- execute --
        let journal = vec![entry(1, 4), entry(1, 5), entry(1, 6), entry(2, 7)];
        let log = rebuild_log(Some(&snapshot), journal).unwrap();

        // -- verify --
        assert_eq!(log.first_index(), Index::new(6));
        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(7))));
    }

    #[test]
    fn unapplied_entries_fill_a_missing_journal_prefix() {
        let mut snapshot = snapshot_with(Term::new(1), Index::new(5), Bytes::new());
        snapshot.unapplied_entries = vec![entry(1, 6), entry(1, 7)];

        let log = rebuild_log(Some(&snapshot), vec![entry(2, 8)]).unwrap();

        assert_eq!(log.term_at(Index::new(6)), Some(Term::new(1)));
        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(8))));
    }

    #[test]
    fn gap_is_rejected() {
        let snapshot = snapshot_with(Term::new(1), Index::new(5), Bytes::new());

        let err = rebuild_log(Some(&snapshot), vec![entry(1, 9)]).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn journal_compacted_without_snapshot_is_rejected() {
        let err = rebuild_log(None, vec![entry(1, 3), entry(1, 4)]).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
