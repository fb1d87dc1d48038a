use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::membership::{ServerConfiguration, ServerInfo};
use crate::replica::{ReplicaId, Term};
use crate::storage::EncodedSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// LeaderStateTracker holds the leader's view of every other member of the latest configuration.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    term: Term,
}

impl LeaderStateTracker {
    pub(super) fn new(heartbeat_duration: Duration, actor_client: WeakActorClient, term: Term) -> Self {
        LeaderStateTracker {
            peer_state: HashMap::new(),
            heartbeat_duration,
            actor_client,
            term,
        }
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    /// Starts or stops tracking peers so the tracker mirrors `config`, minus ourselves. Peers that
    /// stay keep their progress and only pick up a new address or voting flag.
    pub(crate) fn sync_with(
        &mut self,
        config: &ServerConfiguration,
        my_replica_id: &ReplicaId,
        last_index: Option<Index>,
    ) {
        self.peer_state
            .retain(|peer_id, _| config.contains(peer_id) && peer_id != my_replica_id);

        for member in config.members() {
            if &member.replica_id == my_replica_id {
                continue;
            }
            match self.peer_state.get_mut(&member.replica_id) {
                Some(existing) => existing.info = member.clone(),
                None => {
                    let timer = HeartbeatTimerHandle::spawn_timer_task(
                        self.heartbeat_duration,
                        self.actor_client.clone(),
                        member.replica_id.clone(),
                        self.term,
                    );
                    self.peer_state
                        .insert(member.replica_id.clone(), PeerState::new(member.clone(), timer, last_index));
                }
            }
        }
    }

    pub(crate) fn matched(&self, peer_id: &ReplicaId) -> Option<Index> {
        self.peer_state.get(peer_id).and_then(|ps| ps.matched())
    }
}

pub(crate) struct PeerState {
    info: ServerInfo,

    // Held to send heartbeats for this peer
    heartbeat_timer_handle: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    // While set, the peer is being sent a snapshot instead of log entries.
    snapshot_transfer: Option<SnapshotTransfer>,
}

pub(crate) struct SnapshotTransfer {
    pub(crate) snapshot: Arc<EncodedSnapshot>,
    pub(crate) offset: u64,
}

impl PeerState {
    fn new(info: ServerInfo, heartbeat_timer_handle: HeartbeatTimerHandle, last_index: Option<Index>) -> Self {
        PeerState {
            info,
            heartbeat_timer_handle,
            next: last_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            snapshot_transfer: None,
        }
    }

    pub(crate) fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    /// Applies the outcome of the request sent with `received_seq_no`. Returns false if the reply
    /// was out of date and ignored.
    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success { match_index } => {
                if let Some(new_matched) = match_index {
                    self.ratchet_fwd_matched(new_matched);
                }
            }
            PeerStateUpdate::PeerLogBehind { last_log_entry } => {
                self.rewind_log(logger, last_log_entry.map(|(_, index)| index));
            }
        }
        true
    }

    /// A heartbeat success also confirms `prev`, so matched moves up to it even when no entries
    /// were carried. Never moves backwards.
    fn ratchet_fwd_matched(&mut self, new_matched: Index) {
        if Some(new_matched) > self.matched {
            self.matched.replace(new_matched);
        }
        if new_matched.plus(1) > self.next {
            self.next = new_matched.plus(1);
        }
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_index: Option<Index>) {
        // Don't panic here, because peer could return garbage data.
        let floor = self.matched.map(|m| m.plus(1)).unwrap_or_else(Index::start_index);
        let one_back = match self.next.checked_minus(1) {
            Some(index) => index,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // Jump straight past the peer's last entry when it is behind us. A hint at or past our
        // `next` is useless, so fall back to stepping back by one.
        let hinted = match peer_last_index {
            Some(last) if last.plus(1) < self.next => last.plus(1),
            None => Index::start_index(),
            Some(_) => one_back,
        };
        self.next = std::cmp::max(floor, std::cmp::min(one_back, hinted));
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer_handle.reset_heartbeat_timer();
    }

    pub(crate) fn snapshot_transfer(&self) -> Option<&SnapshotTransfer> {
        self.snapshot_transfer.as_ref()
    }

    pub(crate) fn start_snapshot_transfer(&mut self, snapshot: Arc<EncodedSnapshot>) {
        self.snapshot_transfer = Some(SnapshotTransfer { snapshot, offset: 0 });
    }

    /// Handles the reply to a snapshot chunk. `next_offset` is where the peer wants to continue.
    pub(crate) fn handle_install_snapshot_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        last_included: (Term, Index),
        result: Option<(u64, bool)>,
    ) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date snapshot reply seq-no({:?})", received_seq_no);
            return false;
        }

        let transfer = match self.snapshot_transfer.as_mut() {
            Some(transfer) if transfer.snapshot.last_included == last_included => transfer,
            _ => return false,
        };

        match result {
            None => { /* Retry the same offset on the next tick */ }
            Some((_, true)) => {
                slog::info!(logger, "Peer installed snapshot {:?}", last_included);
                self.snapshot_transfer = None;
                self.ratchet_fwd_matched(last_included.1);
            }
            Some((next_offset, false)) => {
                transfer.offset = std::cmp::min(next_offset, transfer.snapshot.data.len() as u64);
            }
        }
        true
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        match_index: Option<Index>,
    },
    PeerLogBehind {
        last_log_entry: Option<(Term, Index)>,
    },
    OtherError,
}
