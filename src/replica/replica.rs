use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{EntryPayload, Index, LogEntry};
use crate::network::PeerTransport;
use crate::replica::apply::{Applied, Applier};
use crate::replica::election::{CurrentLeader, ElectionState, PeerStateUpdate};
use crate::replica::local_state::{LocalState, Term};
use crate::replica::membership::{self, MembershipState, ServerConfiguration, ServerInfo};
use crate::replica::peers::{ReplicaId, ShardId};
use crate::replica::proposals::{ProposalTracker, ProposeCallback};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, ElectionTimeout, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerError,
    LeaderRedirectInfo, LeaderTimerTick, LeadershipTransferError, LeadershipTransferOutput, LeadershipTransferTimeout,
    MembershipChange, MembershipChangeError, MembershipChangeOutput, MissingLogEntryInfo, ProposeError, ProposeInput,
    ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult,
    SnapshotError, SnapshotOutput, SnapshotPersisted, TermOutOfDateInfo, TimeoutNowError, TimeoutNowInput,
    TimeoutNowOutput,
};
use crate::replica::snapshot::{SnapshotCallback, SnapshotManager};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::storage::{EncodedSnapshot, Snapshot};
use bytes::Bytes;
use std::cmp;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type MembershipCallback = Callback<MembershipChangeOutput, MembershipChangeError>;
pub(crate) type LeadershipTransferCallback = Callback<LeadershipTransferOutput, LeadershipTransferError>;

/// Bounds on what a leader sends in one request.
#[derive(Clone, Debug)]
pub(crate) struct ReplicationLimits {
    pub(crate) rpc_timeout: Duration,
    pub(crate) max_entries: usize,
    pub(crate) max_bytes: usize,
}

/// Everything a replica is assembled from. Built by `replica_wiring` after recovery.
pub(crate) struct ReplicaParts {
    pub(crate) logger: slog::Logger,
    pub(crate) shard_id: ShardId,
    pub(crate) my_replica_id: ReplicaId,
    pub(crate) local_state: LocalState,
    pub(crate) election_state: ElectionState,
    pub(crate) wal: WriteAheadLog,
    pub(crate) membership: MembershipState,
    pub(crate) applier: Applier,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) limits: ReplicationLimits,
    // How long a leadership transfer may take before it is abandoned.
    pub(crate) transfer_timeout: Duration,
}

struct PendingMembershipChange {
    stage: MembershipStage,
    callback: MembershipCallback,
}

enum MembershipStage {
    // Waiting for our configuration entry to commit. A new voter is first added as non voting, and
    // `promote` names it so it is promoted once caught up.
    AwaitingCommit {
        entry_id: (Term, Index),
        promote: Option<ReplicaId>,
    },
    AwaitingCatchUp {
        replica_id: ReplicaId,
    },
}

struct PendingLeadershipTransfer {
    transfer_id: u64,
    target: ReplicaId,
    timeout_now_sent: bool,
    callback: LeadershipTransferCallback,
}

/// Replica is the consensus state of one member of one shard. It is only ever driven by its actor,
/// so none of its methods block on anything but local storage.
pub(crate) struct Replica {
    logger: slog::Logger,
    shard_id: ShardId,
    my_replica_id: ReplicaId,
    local_state: LocalState,
    election_state: ElectionState,
    wal: WriteAheadLog,
    membership: MembershipState,
    applier: Applier,
    proposals: ProposalTracker,
    snapshots: SnapshotManager,
    pending_change: Option<PendingMembershipChange>,
    // While set, the leader takes no new writes.
    leadership_transfer: Option<PendingLeadershipTransfer>,
    next_transfer_id: u64,
    transfer_timeout: Duration,
    actor_client: WeakActorClient,
    transport: Arc<dyn PeerTransport>,
    limits: ReplicationLimits,
    // Set once persistent storage failed. The actor stops after the current event.
    fault: Option<String>,
}

impl Replica {
    pub(crate) fn new(parts: ReplicaParts) -> Self {
        Replica {
            logger: parts.logger,
            shard_id: parts.shard_id,
            my_replica_id: parts.my_replica_id,
            local_state: parts.local_state,
            election_state: parts.election_state,
            wal: parts.wal,
            membership: parts.membership,
            applier: parts.applier,
            proposals: ProposalTracker::new(),
            snapshots: parts.snapshots,
            pending_change: None,
            leadership_transfer: None,
            next_transfer_id: 0,
            transfer_timeout: parts.transfer_timeout,
            actor_client: parts.actor_client,
            transport: parts.transport,
            limits: parts.limits,
            fault: None,
        }
    }

    pub(crate) fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    fn fail_stop(&mut self, context: &str, error: &io::Error) {
        slog::crit!(self.logger, "Persistent storage failed while {}: {:?}", context, error);
        if self.fault.is_none() {
            self.fault = Some(format!("storage failure while {}: {}", context, error));
        }
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        let state = self.election_state.current_state();
        ReplicaStatus {
            replica_id: self.my_replica_id.clone(),
            term: state.term,
            role: state.role,
            commit_index: self.wal.commit_index(),
            last_applied: self.applier.last_applied(),
            latest_entry: self.wal.latest_entry(),
            snapshot_last: self.wal.log().snapshot_last(),
            snapshots_installed: self.snapshots.installed_count(),
            configuration: self.membership.latest().clone(),
        }
    }

    // ------- Client proposals --------

    pub(crate) fn handle_propose(&mut self, input: ProposeInput, callback: ProposeCallback) {
        if let Err(redirect) = self.check_accepting_writes() {
            callback.send(Err(ProposeError::NotLeader(redirect)));
            return;
        }

        if let Some(request_id) = &input.client_request_id {
            if let Some(original) = self.applier.sessions().lookup(request_id) {
                callback.send(Err(ProposeError::DuplicateRequest { original }));
                return;
            }
            if let Some(entry_id) = self.find_unapplied_request(request_id) {
                slog::info!(
                    self.logger,
                    "Request {:?} is already in the log at {:?}, waiting on that entry",
                    request_id,
                    entry_id
                );
                self.proposals.track(entry_id, callback);
                return;
            }
        }

        let entry = LogEntry {
            index: self.wal.next_index(),
            term: self.local_state.current_term(),
            client_request_id: input.client_request_id,
            payload: EntryPayload::Command(input.payload),
        };
        let entry_id = entry.id();
        if let Err(e) = self.append_as_leader(entry) {
            callback.send(Err(ProposeError::LocalIoError(e)));
            return;
        }

        self.proposals.track(entry_id, callback);
        self.replicate_and_commit();
    }

    fn check_leader(&self) -> Result<(), Option<LeaderRedirectInfo>> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => Ok(()),
            CurrentLeader::Other(leader) => Err(Some(leader)),
            CurrentLeader::Unknown => Err(None),
        }
    }

    /// Like `check_leader`, but a leader handing off its role has no leader to point at.
    fn check_accepting_writes(&self) -> Result<(), Option<LeaderRedirectInfo>> {
        self.check_leader()?;
        if self.leadership_transfer.is_some() {
            return Err(None);
        }
        Ok(())
    }

    fn find_unapplied_request(&self, request_id: &str) -> Option<(Term, Index)> {
        self.wal
            .log()
            .iter_from(self.applier.next_index())
            .find(|entry| entry.client_request_id.as_deref() == Some(request_id))
            .map(LogEntry::id)
    }

    fn append_as_leader(&mut self, entry: LogEntry) -> io::Result<()> {
        let config = entry.server_config().cloned();
        let index = entry.index;
        if let Err(e) = self.wal.append(vec![entry]) {
            self.fail_stop("appending to the log", &e);
            return Err(e);
        }

        if let Some(config) = config {
            self.membership.on_append(index, config);
            self.sync_peers_with_membership();
        }
        Ok(())
    }

    fn sync_peers_with_membership(&mut self) {
        let last_index = self.wal.log().last_index();
        if let Some(tracker) = self.election_state.leader_state_mut() {
            tracker.sync_with(self.membership.latest(), &self.my_replica_id, last_index);
        }
    }

    fn replicate_and_commit(&mut self) {
        self.replicate_to_all_peers();
        // A leader without voting peers commits on its own.
        self.advance_leader_commit_index();
    }

    // ------- Admin --------

    pub(crate) fn handle_change_membership(&mut self, change: MembershipChange, callback: MembershipCallback) {
        if let Err(redirect) = self.check_accepting_writes() {
            callback.send(Err(MembershipChangeError::NotLeader(redirect)));
            return;
        }
        if self.pending_change.is_some() || self.membership.has_uncommitted_change(self.wal.commit_index()) {
            callback.send(Err(MembershipChangeError::ChangeInProgress));
            return;
        }

        let latest = self.membership.latest().clone();
        let (config, promote) = match change {
            MembershipChange::AddServer(info) => match latest.member(&info.replica_id) {
                Some(existing) if *existing == info => {
                    callback.send(Err(MembershipChangeError::NoChange));
                    return;
                }
                Some(existing) if !existing.voting && info.voting && existing.addr == info.addr => {
                    // Already replicating to it, only the promotion is left.
                    self.pending_change = Some(PendingMembershipChange {
                        stage: MembershipStage::AwaitingCatchUp {
                            replica_id: info.replica_id,
                        },
                        callback,
                    });
                    self.maybe_promote_caught_up_member();
                    return;
                }
                Some(_) => (latest.with_member(info), None),
                None if info.voting => {
                    let replica_id = info.replica_id.clone();
                    let learner = ServerInfo { voting: false, ..info };
                    (latest.with_member(learner), Some(replica_id))
                }
                None => (latest.with_member(info), None),
            },
            MembershipChange::RemoveServer(replica_id) => {
                if !latest.contains(&replica_id) {
                    callback.send(Err(MembershipChangeError::NoChange));
                    return;
                }
                (latest.without_member(&replica_id), None)
            }
        };

        if config.num_voting() == 0 {
            callback.send(Err(MembershipChangeError::InvalidChange(
                "Configuration must keep at least one voting member".to_string(),
            )));
            return;
        }

        match self.append_configuration(config) {
            Ok(entry_id) => {
                self.pending_change = Some(PendingMembershipChange {
                    stage: MembershipStage::AwaitingCommit { entry_id, promote },
                    callback,
                });
                self.replicate_and_commit();
            }
            Err(e) => callback.send(Err(MembershipChangeError::LocalIoError(e))),
        }
    }

    fn append_configuration(&mut self, config: ServerConfiguration) -> io::Result<(Term, Index)> {
        let entry = LogEntry {
            index: self.wal.next_index(),
            term: self.local_state.current_term(),
            client_request_id: None,
            payload: EntryPayload::ServerConfig(config),
        };
        let entry_id = entry.id();
        slog::info!(self.logger, "Appending configuration {:?} at {:?}", entry.payload, entry_id);
        self.append_as_leader(entry)?;
        Ok(entry_id)
    }

    fn maybe_promote_caught_up_member(&mut self) {
        let replica_id = match &self.pending_change {
            Some(PendingMembershipChange {
                stage: MembershipStage::AwaitingCatchUp { replica_id },
                ..
            }) => replica_id.clone(),
            _ => return,
        };
        let commit_index = self.wal.commit_index();
        if !self.election_state.is_leader() || self.membership.has_uncommitted_change(commit_index) {
            return;
        }

        let matched = self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.matched(&replica_id));
        if matched < commit_index {
            return;
        }

        let promoted = match self.membership.latest().member(&replica_id) {
            Some(member) => ServerInfo {
                voting: true,
                ..member.clone()
            },
            None => {
                if let Some(pending) = self.pending_change.take() {
                    pending.callback.send(Err(MembershipChangeError::EntryDiscarded));
                }
                return;
            }
        };

        slog::info!(self.logger, "Member {:?} caught up at {:?}, promoting to voter", replica_id, matched);
        let config = self.membership.latest().with_member(promoted);
        match self.append_configuration(config) {
            Ok(entry_id) => {
                if let Some(pending) = self.pending_change.as_mut() {
                    pending.stage = MembershipStage::AwaitingCommit {
                        entry_id,
                        promote: None,
                    };
                }
                self.replicate_and_commit();
            }
            Err(e) => {
                if let Some(pending) = self.pending_change.take() {
                    pending.callback.send(Err(MembershipChangeError::LocalIoError(e)));
                }
            }
        }
    }

    fn on_configuration_committed(&mut self, entry_id: (Term, Index), config: ServerConfiguration) {
        match self.pending_change.take() {
            Some(PendingMembershipChange {
                stage: MembershipStage::AwaitingCommit {
                    entry_id: awaited,
                    promote,
                },
                callback,
            }) if awaited.1 == entry_id.1 => {
                if awaited.0 != entry_id.0 {
                    callback.send(Err(MembershipChangeError::EntryDiscarded));
                } else if let Some(replica_id) = promote {
                    self.pending_change = Some(PendingMembershipChange {
                        stage: MembershipStage::AwaitingCatchUp { replica_id },
                        callback,
                    });
                } else {
                    callback.send(Ok(MembershipChangeOutput {
                        entry_id,
                        configuration: config.clone(),
                    }));
                }
            }
            other => self.pending_change = other,
        }

        if self.election_state.is_leader() && !config.contains(&self.my_replica_id) {
            slog::info!(self.logger, "Removed from the configuration at {:?}, stepping down", entry_id);
            let term = self.local_state.current_term();
            self.step_down(term, None);
        }
    }

    fn discard_pending_change_from(&mut self, index: Index) {
        let discarded = matches!(
            &self.pending_change,
            Some(PendingMembershipChange {
                stage: MembershipStage::AwaitingCommit { entry_id, .. },
                ..
            }) if entry_id.1 >= index
        );
        if discarded {
            if let Some(pending) = self.pending_change.take() {
                pending.callback.send(Err(MembershipChangeError::EntryDiscarded));
            }
        }
    }

    pub(crate) fn handle_transfer_leadership(&mut self, target: ReplicaId, callback: LeadershipTransferCallback) {
        if let Err(redirect) = self.check_leader() {
            callback.send(Err(LeadershipTransferError::NotLeader(redirect)));
            return;
        }
        if self.leadership_transfer.is_some() {
            callback.send(Err(LeadershipTransferError::TransferInProgress));
            return;
        }
        if target == self.my_replica_id {
            callback.send(Err(LeadershipTransferError::InvalidTarget(format!(
                "{} is already leader",
                target.as_str()
            ))));
            return;
        }
        if !self.membership.latest().is_voting(&target) {
            callback.send(Err(LeadershipTransferError::InvalidTarget(format!(
                "{} is not a voting member",
                target.as_str()
            ))));
            return;
        }

        self.next_transfer_id += 1;
        let transfer_id = self.next_transfer_id;
        slog::info!(self.logger, "Transferring leadership to {:?}", target);
        self.leadership_transfer = Some(PendingLeadershipTransfer {
            transfer_id,
            target: target.clone(),
            timeout_now_sent: false,
            callback,
        });

        let actor_client = self.actor_client.clone();
        let transfer_timeout = self.transfer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(transfer_timeout).await;
            let _ = actor_client
                .leadership_transfer_timeout(LeadershipTransferTimeout { transfer_id })
                .await;
        });

        self.replicate_to_peer(&target);
        self.maybe_send_timeout_now();
    }

    /// Tells the transfer target to campaign once it holds our whole log.
    fn maybe_send_timeout_now(&mut self) {
        let target = match &self.leadership_transfer {
            Some(transfer) if !transfer.timeout_now_sent => transfer.target.clone(),
            _ => return,
        };
        let matched = match self.election_state.leader_state() {
            Some(tracker) => tracker.matched(&target),
            None => return,
        };
        if matched != self.wal.log().last_index() {
            return;
        }
        let peer = match self.membership.latest().member(&target) {
            Some(peer) => peer.clone(),
            None => return,
        };

        slog::info!(self.logger, "{:?} is caught up through {:?}, telling it to campaign", target, matched);
        let input = TimeoutNowInput {
            leader_term: self.local_state.current_term(),
            leader_id: self.my_replica_id.clone(),
        };
        tokio::spawn(call_peer_timeout_now(
            self.logger.new(slog::o!("Peer" => format!("{:?}", target))),
            self.transport.clone(),
            self.shard_id.clone(),
            peer,
            input,
            self.limits.rpc_timeout,
        ));
        if let Some(transfer) = self.leadership_transfer.as_mut() {
            transfer.timeout_now_sent = true;
        }
    }

    /// Completes a pending transfer once we follow someone.
    fn resolve_leadership_transfer(&mut self) {
        let leader = match self.election_state.current_leader() {
            CurrentLeader::Other(leader) => leader,
            _ => return,
        };
        let transfer = match self.leadership_transfer.take() {
            Some(transfer) => transfer,
            None => return,
        };

        if leader.replica_id == transfer.target {
            slog::info!(self.logger, "Leadership transferred to {:?}", leader.replica_id);
            transfer
                .callback
                .send(Ok(LeadershipTransferOutput { new_leader: leader }));
        } else {
            slog::warn!(
                self.logger,
                "{:?} took over instead of transfer target {:?}",
                leader.replica_id,
                transfer.target
            );
            transfer
                .callback
                .send(Err(LeadershipTransferError::OtherLeaderElected(leader)));
        }
    }

    pub(crate) fn handle_leadership_transfer_timeout(&mut self, timeout: LeadershipTransferTimeout) {
        let expired = matches!(
            &self.leadership_transfer,
            Some(transfer) if transfer.transfer_id == timeout.transfer_id
        );
        if !expired {
            return;
        }
        if let Some(transfer) = self.leadership_transfer.take() {
            slog::warn!(
                self.logger,
                "No leader emerged after handing off to {:?}, taking writes again",
                transfer.target
            );
            transfer.callback.send(Err(LeadershipTransferError::Timeout));
        }
    }

    pub(crate) fn handle_trigger_snapshot(&mut self, callback: SnapshotCallback) {
        if self.snapshots.is_persisting() {
            callback.send(Err(SnapshotError::AlreadyInProgress));
            return;
        }
        let snapshot_index = self.wal.log().snapshot_last().map(|(_, index)| index);
        let last_applied = self.applier.last_applied();
        if last_applied.is_none() || last_applied <= snapshot_index {
            callback.send(Err(SnapshotError::NothingToSnapshot));
            return;
        }

        self.capture_snapshot(Some(callback));
    }

    fn maybe_capture_snapshot(&mut self) {
        if self.snapshots.should_capture(
            self.applier.last_applied(),
            self.wal.log().snapshot_last(),
            self.wal.log().data_size(),
        ) {
            self.capture_snapshot(None);
        }
    }

    fn capture_snapshot(&mut self, callback: Option<SnapshotCallback>) {
        let last_included = match self
            .applier
            .last_applied()
            .and_then(|index| self.wal.term_at(index).map(|term| (term, index)))
        {
            Some(last_included) => last_included,
            None => {
                if let Some(callback) = callback {
                    callback.send(Err(SnapshotError::NothingToSnapshot));
                }
                return;
            }
        };

        let next_index = last_included.1.plus(1);
        let snapshot = Snapshot::new(
            last_included,
            self.applier.capture_state(),
            self.membership.config_for(next_index).clone(),
            self.wal.log().iter_from(next_index).cloned().collect(),
            self.applier.sessions().to_vec(),
        );
        self.snapshots.begin_persist(snapshot, callback, self.actor_client.clone());
    }

    pub(crate) fn handle_snapshot_persisted(&mut self, persisted: SnapshotPersisted) {
        let persisted = match self.snapshots.finish_persisting(persisted) {
            Some(persisted) => persisted,
            None => return,
        };

        let (term, index) = persisted.encoded.last_included;
        if let Err(e) = self.wal.compact_through(term, index) {
            self.fail_stop("compacting the log", &e);
            return;
        }
        slog::info!(self.logger, "Log compacted through {:?}", (term, index));

        if let Some(callback) = persisted.callback {
            callback.send(Ok(SnapshotOutput {
                last_included: (term, index),
            }));
        }
    }

    // ------- Term bookkeeping --------

    /// Persists `term` if it is newer than ours and falls back to follower. Returns true if it was.
    fn observe_term(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) -> io::Result<bool> {
        let increased = match self.local_state.store_term_if_increased(self.wal.store_mut(), term) {
            Ok(increased) => increased,
            Err(e) => {
                self.fail_stop("storing term", &e);
                return Err(e);
            }
        };

        if increased {
            slog::info!(self.logger, "Observed newer term {:?}, becoming follower", term);
            self.step_down(term, leader);
        }
        Ok(increased)
    }

    fn step_down(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) {
        let awaiting_catch_up = matches!(
            &self.pending_change,
            Some(PendingMembershipChange {
                stage: MembershipStage::AwaitingCatchUp { .. },
                ..
            })
        );
        if awaiting_catch_up {
            if let Some(pending) = self.pending_change.take() {
                pending
                    .callback
                    .send(Err(MembershipChangeError::NotLeader(leader.clone())));
            }
        }

        self.election_state.transition_to_follower(term, leader);
    }

    /// Err holds our current term if `leader_term` can't be accepted.
    fn check_leader_term(&self, leader_term: Term) -> Result<(), Term> {
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(current_term);
        }
        if leader_term == current_term && self.election_state.is_leader() {
            // > Election Safety: at most one leader can be elected in a given term.
            slog::crit!(self.logger, "Another replica claims to lead our term {:?}", leader_term);
            return Err(current_term);
        }
        Ok(())
    }

    /// Called for every message from a leader whose term is at least ours.
    fn accept_leader(&mut self, leader_term: Term, leader_id: &ReplicaId) -> io::Result<()> {
        let leader = LeaderRedirectInfo {
            replica_id: leader_id.clone(),
            addr: self.membership.latest().member(leader_id).map(|m| m.addr),
        };

        if !self.observe_term(leader_term, Some(leader.clone()))? {
            if self.election_state.is_candidate() {
                // > If AppendEntries RPC received from new leader: convert to follower
                self.step_down(leader_term, Some(leader));
            } else {
                self.election_state.set_leader_if_unknown(&leader);
            }
        }
        self.election_state.reset_timeout_if_follower();
        self.resolve_leadership_transfer();
        Ok(())
    }

    // ------- RequestVote --------

    pub(crate) fn handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        let current_term = self.local_state.current_term();
        if input.candidate_term < current_term {
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // Servers outside our configuration (e.g. just removed) never get to bump our term.
        if !self.membership.latest().is_voting(&input.candidate_id) {
            slog::info!(
                self.logger,
                "Ignoring vote request from {:?}, not a voter in {:?}",
                input.candidate_id,
                self.membership.latest()
            );
            return Ok(RequestVoteOutput {
                term: current_term,
                vote_granted: false,
            });
        }

        self.observe_term(input.candidate_term, None)
            .map_err(RequestVoteError::ServerIoError)?;

        let (term, voted_for) = self.local_state.voted_for_current_term();
        match voted_for {
            Some(candidate) if candidate == &input.candidate_id => {
                // Retried request, same answer.
                self.election_state.reset_timeout_if_follower();
                return Ok(RequestVoteOutput {
                    term,
                    vote_granted: true,
                });
            }
            Some(_) => {
                return Ok(RequestVoteOutput {
                    term,
                    vote_granted: false,
                })
            }
            None => {}
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(
                self.logger,
                "Candidate {:?} log {:?} is behind ours {:?}",
                input.candidate_id,
                input.candidate_last_log_entry,
                self.wal.latest_entry()
            );
            return Ok(RequestVoteOutput {
                term,
                vote_granted: false,
            });
        }

        match self
            .local_state
            .store_vote_for_term_if_unvoted(self.wal.store_mut(), term, input.candidate_id.clone())
        {
            Ok(vote_granted) => {
                if vote_granted {
                    slog::info!(self.logger, "Voted for {:?} in term {:?}", input.candidate_id, term);
                    self.election_state.reset_timeout_if_follower();
                }
                Ok(RequestVoteOutput { term, vote_granted })
            }
            Err(e) => {
                self.fail_stop("storing vote", &e);
                Err(RequestVoteError::ServerIoError(e))
            }
        }
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > If the logs have last entries with different terms, then the log with the later term is
        // > more up-to-date. If the logs end with the same term, then whichever log is longer is
        // > more up-to-date.
        //
        // Tuple ordering is exactly that, and `None` sorts before any entry.
        candidate_last_entry >= self.wal.latest_entry()
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", reply.peer_id)));
        if reply.term != self.local_state.current_term() {
            slog::debug!(logger, "Dropping vote reply for old term {:?}", reply.term);
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let config = self.membership.latest();
                if !config.is_voting(&reply.peer_id) {
                    return;
                }
                let won = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(votes) => votes.iter().filter(|id| config.is_voting(id)).count() >= config.majority(),
                    None => false,
                };
                if won {
                    self.become_leader();
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(logger, "Vote not granted");
            }
            RequestVoteResult::StaleTerm { new_term } => {
                let _ = self.observe_term(new_term, None);
            }
            RequestVoteResult::RetryableFailure(message) => {
                slog::warn!(logger, "RequestVote failed: {}", message);
            }
        }
    }

    pub(crate) fn handle_election_timeout(&mut self, timeout: ElectionTimeout) {
        if timeout.term != self.local_state.current_term() || self.election_state.is_leader() {
            slog::debug!(self.logger, "Ignoring election timeout for term {:?}", timeout.term);
            return;
        }
        if !self.membership.latest().is_voting(&self.my_replica_id) {
            slog::debug!(self.logger, "Not a voting member, not starting an election");
            return;
        }

        let new_term = match self.local_state.increment_term_and_vote_for_self(self.wal.store_mut()) {
            Ok(term) => term,
            Err(e) => {
                self.fail_stop("starting an election", &e);
                return;
            }
        };
        slog::info!(self.logger, "Election timeout, campaigning in term {:?}", new_term);
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);

        if self.membership.latest().majority() <= 1 {
            self.become_leader();
            return;
        }

        let input = RequestVoteInput {
            candidate_term: new_term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.wal.latest_entry(),
        };
        for peer in self.membership.latest().voting_members() {
            if peer.replica_id == self.my_replica_id {
                continue;
            }
            tokio::spawn(call_peer_request_vote(
                self.logger.new(slog::o!("Peer" => format!("{:?}", peer.replica_id))),
                self.transport.clone(),
                self.shard_id.clone(),
                peer.clone(),
                input.clone(),
                self.limits.rpc_timeout,
                self.actor_client.clone(),
            ));
        }
    }

    fn become_leader(&mut self) {
        let term = self.local_state.current_term();
        slog::info!(self.logger, "Won election for term {:?}, becoming leader", term);
        self.election_state.transition_to_leader(term);
        self.sync_peers_with_membership();
        if let Some(transfer) = self.leadership_transfer.take() {
            // The target never took over and we won a later election ourselves.
            let me = LeaderRedirectInfo {
                replica_id: self.my_replica_id.clone(),
                addr: self.membership.latest().member(&self.my_replica_id).map(|m| m.addr),
            };
            transfer
                .callback
                .send(Err(LeadershipTransferError::OtherLeaderElected(me)));
        }

        // > a leader must have the latest information on which entries are committed [...] at the
        // > start of its term, each leader commits a blank no-op entry into the log.
        let noop = LogEntry {
            index: self.wal.next_index(),
            term,
            client_request_id: None,
            payload: EntryPayload::Noop,
        };
        if self.append_as_leader(noop).is_err() {
            return;
        }
        self.replicate_and_commit();
    }

    // ------- AppendEntries --------

    pub(crate) fn handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        if let Err(current_term) = self.check_leader_term(input.leader_term) {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        self.accept_leader(input.leader_term, &input.leader_id)
            .map_err(AppendEntriesError::ServerIoError)?;
        let term = self.local_state.current_term();

        // > Reply false if log doesn't contain an entry at prevLogIndex whose term matches prevLogTerm
        if let Some((prev_term, prev_index)) = input.leader_previous_log_entry {
            // Anything in our snapshot is committed, so it matches by definition.
            if !self.wal.log().is_compacted(prev_index) {
                let hint = match self.wal.term_at(prev_index) {
                    Some(existing) if existing == prev_term => None,
                    Some(conflicting) => Some(self.conflict_hint(prev_index, conflicting)),
                    None => Some(self.wal.latest_entry()),
                };
                if let Some(last_log_entry) = hint {
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry(MissingLogEntryInfo {
                        term,
                        last_log_entry,
                    }));
                }
            }
        }

        let prev_index = input.leader_previous_log_entry.map(|(_, index)| index);
        let num_new = input.new_entries.len() as u64;
        let last_new_index = match prev_index {
            Some(prev) => Some(prev.plus(num_new)),
            None => Index::from_u64(num_new),
        };

        let mut to_append = Vec::new();
        for entry in input.new_entries {
            if to_append.is_empty() {
                if self.wal.log().is_compacted(entry.index) {
                    continue;
                }
                match self.wal.term_at(entry.index) {
                    Some(existing) if existing == entry.term => continue,
                    // > If an existing entry conflicts with a new one (same index but different
                    // > terms), delete the existing entry and all that follow it
                    Some(_) => self
                        .truncate_log_from(entry.index)
                        .map_err(AppendEntriesError::ServerIoError)?,
                    None => {}
                }
            }
            to_append.push(entry);
        }
        self.append_as_follower(to_append)
            .map_err(AppendEntriesError::ServerIoError)?;

        // > If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit), Some(last_new)) = (input.leader_commit_index, last_new_index) {
            let new_commit = cmp::min(leader_commit, last_new);
            if let Err(e) = self.wal.ratchet_fwd_commit_index(new_commit) {
                self.fail_stop("storing commit index", &e);
                return Err(AppendEntriesError::ServerIoError(e));
            }
            self.apply_committed();
        }

        Ok(AppendEntriesOutput {
            term,
            match_index: last_new_index,
        })
    }

    /// Points the leader before the whole run of `conflicting_term` so it can skip it at once.
    fn conflict_hint(&self, index: Index, conflicting_term: Term) -> Option<(Term, Index)> {
        let mut first = index;
        while let Some(before) = first.checked_minus(1) {
            if self.wal.log().is_compacted(before) || self.wal.term_at(before) != Some(conflicting_term) {
                break;
            }
            first = before;
        }
        first
            .checked_minus(1)
            .and_then(|hint| self.wal.term_at(hint).map(|term| (term, hint)))
    }

    fn truncate_log_from(&mut self, index: Index) -> io::Result<()> {
        match self.wal.truncate(index) {
            Ok(removed) => slog::info!(self.logger, "Removed {} conflicting entries from {:?}", removed, index),
            Err(e) => {
                self.fail_stop("truncating the log", &e);
                return Err(e);
            }
        }

        self.proposals.discard_from(index);
        self.discard_pending_change_from(index);
        if self.membership.on_truncate(index) {
            slog::info!(self.logger, "Configuration reverted to {:?}", self.membership.latest());
        }
        Ok(())
    }

    fn append_as_follower(&mut self, entries: Vec<LogEntry>) -> io::Result<()> {
        let configs: Vec<(Index, ServerConfiguration)> = entries
            .iter()
            .filter_map(|entry| entry.server_config().map(|config| (entry.index, config.clone())))
            .collect();

        if let Err(e) = self.wal.append(entries) {
            self.fail_stop("appending to the log", &e);
            return Err(e);
        }
        for (index, config) in configs {
            self.membership.on_append(index, config);
        }
        Ok(())
    }

    fn apply_committed(&mut self) {
        let commit_index = match self.wal.commit_index() {
            Some(index) => index,
            None => return,
        };

        while self.applier.last_applied() < Some(commit_index) {
            let index = self.applier.next_index();
            let entry = match self.wal.entry_at(index) {
                Some(entry) => entry.clone(),
                None => {
                    slog::crit!(self.logger, "Committed entry {:?} is missing from the log", index);
                    break;
                }
            };

            let entry_id = entry.id();
            match self.applier.apply(&entry) {
                Applied::Command { output } => self.proposals.complete(entry_id, Ok(output)),
                Applied::Duplicate { original } => self.proposals.complete(entry_id, Err(original)),
                Applied::Configuration(config) => {
                    self.membership.on_commit(index);
                    self.on_configuration_committed(entry_id, config);
                }
                Applied::Noop => {}
            }
        }

        self.membership.on_commit(commit_index);
        self.maybe_promote_caught_up_member();
        self.maybe_capture_snapshot();
    }

    /// Applies entries already committed before a restart.
    pub(crate) fn replay_committed(&mut self) {
        self.apply_committed();
    }

    // ------- Leader replication --------

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        if tick.term != self.local_state.current_term() || !self.election_state.is_leader() {
            return;
        }
        self.replicate_to_peer(&tick.peer_id);
    }

    fn replicate_to_all_peers(&mut self) {
        let peer_ids = match self.election_state.leader_state() {
            Some(tracker) => tracker.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.replicate_to_peer(&peer_id);
        }
    }

    fn replicate_to_peer(&mut self, peer_id: &ReplicaId) {
        let term = self.local_state.current_term();
        let commit_index = self.wal.commit_index();
        let latest_snapshot = self.snapshots.latest();
        let chunk_size = self.snapshots.chunk_size();
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id)));

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        if peer_state.has_outstanding_request() {
            slog::debug!(logger, "Request already in flight, skipping");
            return;
        }

        let (next, prev_index) = peer_state.next_and_previous_log_index();
        if peer_state.snapshot_transfer().is_none() && self.wal.log().is_compacted(next) {
            match latest_snapshot {
                Some(snapshot) => {
                    slog::info!(logger, "Peer needs {:?} which is compacted, sending snapshot", next);
                    peer_state.start_snapshot_transfer(snapshot);
                }
                None => {
                    slog::crit!(logger, "Log is compacted before {:?} but there is no snapshot", next);
                    return;
                }
            }
        }

        if let Some(transfer) = peer_state.snapshot_transfer() {
            let data = &transfer.snapshot.data;
            let start = cmp::min(transfer.offset as usize, data.len());
            let end = cmp::min(start + chunk_size, data.len());
            let input = InstallSnapshotInput {
                leader_term: term,
                leader_id: self.my_replica_id.clone(),
                last_included: transfer.snapshot.last_included,
                offset: start as u64,
                data: data.slice(start..end),
                done: end == data.len(),
            };
            let seq_no = peer_state.next_seq_no();
            tokio::spawn(call_peer_install_snapshot(
                logger.new(slog::o!("SeqNo" => seq_no)),
                self.transport.clone(),
                self.shard_id.clone(),
                peer_state.info().clone(),
                input,
                seq_no,
                self.limits.rpc_timeout,
                self.actor_client.clone(),
            ));
            peer_state.reset_heartbeat_timer();
            return;
        }

        let previous_log_entry = match prev_index {
            None => None,
            Some(prev) => match self.wal.term_at(prev) {
                Some(prev_term) => Some((prev_term, prev)),
                None => {
                    slog::crit!(logger, "Missing term of previous entry {:?}", prev);
                    return;
                }
            },
        };
        let new_entries = self
            .wal
            .log()
            .slice_from(next, self.limits.max_entries, self.limits.max_bytes);
        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term,
            seq_no,
            previous_log_entry_index: prev_index,
            num_log_entries: new_entries.len(),
        };
        let input = AppendEntriesInput {
            leader_term: term,
            leader_id: self.my_replica_id.clone(),
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: commit_index,
            new_entries,
        };

        tokio::spawn(call_peer_append_entries(
            logger.new(slog::o!("SeqNo" => seq_no)),
            self.transport.clone(),
            self.shard_id.clone(),
            peer_state.info().clone(),
            input,
            self.limits.rpc_timeout,
            self.actor_client.clone(),
            descriptor,
        ));
        peer_state.reset_heartbeat_timer();
    }

    fn peer_next_index(&self, peer_id: &ReplicaId) -> Option<Index> {
        self.election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(peer_id))
            .map(|peer_state| peer_state.next_and_previous_log_index().0)
    }

    fn peer_is_behind(&self, peer_id: &ReplicaId) -> bool {
        match self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(peer_id))
        {
            Some(peer_state) => {
                peer_state.snapshot_transfer().is_some()
                    || Some(peer_state.next_and_previous_log_index().0) <= self.wal.log().last_index()
            }
            None => false,
        }
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let peer_id = descriptor.peer_id;
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", peer_id),
            "SeqNo" => descriptor.seq_no,
        ));
        if descriptor.term != self.local_state.current_term() || !self.election_state.is_leader() {
            slog::debug!(logger, "Dropping AppendEntries reply from term {:?}", descriptor.term);
            return;
        }

        let sent_through = match descriptor.previous_log_entry_index {
            Some(prev) => Some(prev.plus(descriptor.num_log_entries as u64)),
            None => Index::from_u64(descriptor.num_log_entries as u64),
        };
        let update = match reply.result {
            Ok(match_index) => PeerStateUpdate::Success {
                // Never trust a peer to have matched more than we sent it.
                match_index: cmp::min(match_index, sent_through),
            },
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_entry }) => {
                PeerStateUpdate::PeerLogBehind { last_log_entry }
            }
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                let _ = self.observe_term(new_term, None);
                return;
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(message)) => {
                slog::debug!(logger, "AppendEntries failed: {}", message);
                PeerStateUpdate::OtherError
            }
        };
        let rejected = match update {
            PeerStateUpdate::Success { .. } => false,
            PeerStateUpdate::PeerLogBehind { .. } => true,
            PeerStateUpdate::OtherError => return self.record_failed_append(&logger, &peer_id, descriptor.seq_no),
        };

        let next_before = self.peer_next_index(&peer_id);
        let accepted = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(&peer_id))
        {
            Some(peer_state) => peer_state.handle_append_entries_result(&logger, descriptor.seq_no, update),
            None => false,
        };
        if !accepted {
            return;
        }

        self.advance_leader_commit_index();
        self.maybe_promote_caught_up_member();
        self.maybe_send_timeout_now();

        // Keep streaming while the peer is behind. A rejection that didn't move `next` waits for the
        // next heartbeat instead of spinning.
        let moved = self.peer_next_index(&peer_id) != next_before;
        if (moved || !rejected) && self.peer_is_behind(&peer_id) {
            self.replicate_to_peer(&peer_id);
        }
    }

    fn record_failed_append(&mut self, logger: &slog::Logger, peer_id: &ReplicaId, seq_no: u64) {
        if let Some(peer_state) = self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(peer_id))
        {
            peer_state.handle_append_entries_result(logger, seq_no, PeerStateUpdate::OtherError);
        }
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", reply.peer_id),
            "SeqNo" => reply.seq_no,
        ));
        if reply.term != self.local_state.current_term() || !self.election_state.is_leader() {
            slog::debug!(logger, "Dropping InstallSnapshot reply from term {:?}", reply.term);
            return;
        }

        let result = match reply.result {
            Ok(next_offset) => Some((next_offset, reply.done)),
            Err(InstallSnapshotReplyFromPeerError::UnexpectedChunk { expected_offset }) => {
                slog::info!(logger, "Peer expects snapshot offset {}", expected_offset);
                Some((expected_offset, false))
            }
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => {
                let _ = self.observe_term(new_term, None);
                return;
            }
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(ref message)) => {
                slog::warn!(logger, "InstallSnapshot failed: {}", message);
                None
            }
        };
        let progressed = result.is_some();

        let accepted = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(&reply.peer_id))
        {
            Some(peer_state) => {
                peer_state.handle_install_snapshot_result(&logger, reply.seq_no, reply.last_included, result)
            }
            None => false,
        };
        if !accepted {
            return;
        }

        self.advance_leader_commit_index();
        self.maybe_promote_caught_up_member();
        self.maybe_send_timeout_now();
        if progressed {
            self.replicate_to_peer(&reply.peer_id);
        }
    }

    fn advance_leader_commit_index(&mut self) {
        let tracker = match self.election_state.leader_state() {
            Some(tracker) => tracker,
            None => return,
        };
        let last_index = match self.wal.log().last_index() {
            Some(index) => index,
            None => return,
        };
        let from = self
            .wal
            .commit_index()
            .map(|index| index.plus(1))
            .unwrap_or_else(Index::start_index);

        // Each entry is committed by the quorum of the configuration that governs it.
        let my_replica_id = &self.my_replica_id;
        let mut new_commit = None;
        for (segment_from, segment_to, config) in self.membership.segments(from, last_index) {
            let quorum = membership::quorum_match_index(config, |replica_id| {
                if replica_id == my_replica_id {
                    Some(last_index)
                } else {
                    tracker.matched(replica_id)
                }
            });
            let candidate = match quorum {
                Some(quorum) if quorum >= segment_from => cmp::min(quorum, segment_to),
                _ => break,
            };
            new_commit = Some(candidate);
            // A later configuration only counts once this one covers its whole segment.
            if candidate < segment_to {
                break;
            }
        }

        let new_commit = match new_commit {
            Some(index) => index,
            None => return,
        };
        // > Raft never commits log entries from previous terms by counting replicas. Only log
        // > entries from the leader's current term are committed by counting replicas
        let current_term = self.local_state.current_term();
        if self.wal.term_at(new_commit) != Some(current_term) {
            slog::debug!(
                self.logger,
                "Majority holds {:?} but it is not from term {:?}",
                new_commit,
                current_term
            );
            return;
        }

        if let Err(e) = self.wal.ratchet_fwd_commit_index(new_commit) {
            self.fail_stop("storing commit index", &e);
            return;
        }
        self.apply_committed();
    }

    // ------- TimeoutNow --------

    /// The leader is handing us its role: campaign right away instead of waiting for a timeout.
    pub(crate) fn handle_timeout_now(&mut self, input: TimeoutNowInput) -> Result<TimeoutNowOutput, TimeoutNowError> {
        if let Err(current_term) = self.check_leader_term(input.leader_term) {
            return Err(TimeoutNowError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        self.accept_leader(input.leader_term, &input.leader_id)
            .map_err(TimeoutNowError::ServerIoError)?;
        if !self.membership.latest().is_voting(&self.my_replica_id) {
            return Err(TimeoutNowError::NotVoting);
        }

        slog::info!(self.logger, "{:?} is handing over leadership", input.leader_id);
        let term = self.local_state.current_term();
        self.handle_election_timeout(ElectionTimeout { term });
        Ok(TimeoutNowOutput {
            term: self.local_state.current_term(),
        })
    }

    // ------- InstallSnapshot --------

    pub(crate) fn handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        if let Err(current_term) = self.check_leader_term(input.leader_term) {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        self.accept_leader(input.leader_term, &input.leader_id)
            .map_err(InstallSnapshotError::ServerIoError)?;
        let term = self.local_state.current_term();

        let next_offset =
            match self
                .snapshots
                .receive_chunk(input.leader_term, input.last_included, input.offset, &input.data)
            {
                Ok(next_offset) => next_offset,
                Err(expected_offset) => {
                    return Err(InstallSnapshotError::UnexpectedChunk { term, expected_offset });
                }
            };
        if !input.done {
            return Ok(InstallSnapshotOutput { term, next_offset });
        }

        let data = match self.snapshots.take_received(input.last_included) {
            Some(data) => data,
            None => {
                return Err(InstallSnapshotError::UnexpectedChunk {
                    term,
                    expected_offset: 0,
                })
            }
        };
        self.install_snapshot(input.last_included, data)
            .map_err(InstallSnapshotError::ServerIoError)?;

        Ok(InstallSnapshotOutput { term, next_offset })
    }

    fn install_snapshot(&mut self, last_included: (Term, Index), data: Bytes) -> io::Result<()> {
        let (term, index) = last_included;
        let commit_index = self.wal.commit_index();
        if Some(index) <= commit_index {
            slog::info!(self.logger, "Already committed past snapshot {:?}, ignoring it", last_included);
            return Ok(());
        }

        let snapshot = Snapshot::decode(&data)?;
        if snapshot.last_included != last_included {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Snapshot content is for {:?}, transfer was for {:?}",
                    snapshot.last_included, last_included
                ),
            ));
        }
        self.snapshots.save_installed(EncodedSnapshot { last_included, data })?;

        // > If existing log entry has same index and term as snapshot's last included entry, retain
        // > log entries following it and reply
        let result = if self.wal.term_at(index) == Some(term) {
            self.wal
                .compact_through(term, index)
                .and_then(|_| self.wal.ratchet_fwd_commit_index(index).map(|_| ()))
        } else {
            // > Discard the entire log
            let first_uncommitted = commit_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
            self.proposals.discard_from(first_uncommitted);
            self.discard_pending_change_from(first_uncommitted);
            self.wal.reset_to_snapshot(term, index)
        };
        if let Err(e) = result {
            self.fail_stop("installing a snapshot", &e);
            return Err(e);
        }

        // > Reset state machine using snapshot contents
        self.applier.restore(&snapshot);
        self.membership.reset(snapshot.server_config, Some(index));
        for entry in self.wal.log().iter_from(index.plus(1)) {
            if let Some(config) = entry.server_config() {
                self.membership.on_append(entry.index, config.clone());
            }
        }
        slog::info!(
            self.logger,
            "Installed snapshot {:?}, configuration is {:?}",
            last_included,
            self.membership.latest()
        );

        self.apply_committed();
        Ok(())
    }
}

async fn call_peer_request_vote(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    shard_id: ShardId,
    peer: ServerInfo,
    input: RequestVoteInput,
    rpc_timeout: Duration,
    callback: WeakActorClient,
) {
    let term = input.candidate_term;
    slog::debug!(logger, "ClientWire - {:?}", input);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.request_vote(&shard_id, &peer, input)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(remote)) => RequestVoteResult::from_remote(term, remote),
        Ok(Err(transport_error)) => RequestVoteResult::RetryableFailure(transport_error.to_string()),
        Err(_) => RequestVoteResult::RetryableFailure("RequestVote timed out".to_string()),
    };

    let _ = callback
        .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: peer.replica_id,
            term,
            result,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn call_peer_append_entries(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    shard_id: ShardId,
    peer: ServerInfo,
    input: AppendEntriesInput,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: AppendEntriesReplyFromPeerDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", input);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.append_entries(&shard_id, &peer, input)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(remote)) => AppendEntriesReplyFromPeerError::from_remote(remote),
        Ok(Err(transport_error)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            transport_error.to_string(),
        )),
        Err(_) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "AppendEntries timed out".to_string(),
        )),
    };

    let _ = callback
        .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn call_peer_install_snapshot(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    shard_id: ShardId,
    peer: ServerInfo,
    input: InstallSnapshotInput,
    seq_no: u64,
    rpc_timeout: Duration,
    callback: WeakActorClient,
) {
    let term = input.leader_term;
    let last_included = input.last_included;
    let done = input.done;
    slog::debug!(
        logger,
        "ClientWire - InstallSnapshot {:?} offset {} len {} done {}",
        last_included,
        input.offset,
        input.data.len(),
        done
    );
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.install_snapshot(&shard_id, &peer, input)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(remote)) => InstallSnapshotReplyFromPeerError::from_remote(remote),
        Ok(Err(transport_error)) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
            transport_error.to_string(),
        )),
        Err(_) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
            "InstallSnapshot timed out".to_string(),
        )),
    };

    let _ = callback
        .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
            peer_id: peer.replica_id,
            term,
            seq_no,
            last_included,
            done,
            result,
        })
        .await;
}

async fn call_peer_timeout_now(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    shard_id: ShardId,
    peer: ServerInfo,
    input: TimeoutNowInput,
    rpc_timeout: Duration,
) {
    slog::debug!(logger, "ClientWire - {:?}", input);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.timeout_now(&shard_id, &peer, input)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    // Nothing to retry: the transfer either produces a new leader or times out.
    match rpc_reply {
        Ok(Ok(Ok(output))) => slog::info!(logger, "Peer campaigns in term {:?}", output.term),
        Ok(Ok(Err(e))) => slog::warn!(logger, "TimeoutNow rejected: {}", e),
        Ok(Err(transport_error)) => slog::warn!(logger, "TimeoutNow failed: {}", transport_error),
        Err(_) => slog::warn!(logger, "TimeoutNow timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::network::TransportError;
    use crate::replica::replica_wiring::{create_replica, ReplicaConfig};
    use crate::replica::snapshot::SnapshotPolicy;
    use crate::replica::replica_api::{ProposeOutput, ReplicaRole};
    use crate::storage::{MemoryStore, PersistentStore};
    use crate::test_utils::{self, voters, CountingStateMachine};
    use tokio::sync::{mpsc, oneshot};

    struct UnreachableTransport;

    #[async_trait::async_trait]
    impl PeerTransport for UnreachableTransport {
        async fn request_vote(
            &self,
            _shard_id: &ShardId,
            target: &ServerInfo,
            _input: RequestVoteInput,
        ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
            Err(TransportError::Unreachable(target.replica_id.as_str().to_string()))
        }

        async fn append_entries(
            &self,
            _shard_id: &ShardId,
            target: &ServerInfo,
            _input: AppendEntriesInput,
        ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
            Err(TransportError::Unreachable(target.replica_id.as_str().to_string()))
        }

        async fn install_snapshot(
            &self,
            _shard_id: &ShardId,
            target: &ServerInfo,
            _input: InstallSnapshotInput,
        ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
            Err(TransportError::Unreachable(target.replica_id.as_str().to_string()))
        }

        async fn timeout_now(
            &self,
            _shard_id: &ShardId,
            target: &ServerInfo,
            _input: TimeoutNowInput,
        ) -> Result<Result<TimeoutNowOutput, TimeoutNowError>, TransportError> {
            Err(TransportError::Unreachable(target.replica_id.as_str().to_string()))
        }
    }

    struct TestReplica {
        replica: Replica,
        state_machine: CountingStateMachine,
        store: MemoryStore,
        // Held so the weak clients inside the replica stay valid. Events are never processed, the
        // tests call the handlers directly.
        _actor_client: ActorClient,
        _events: mpsc::Receiver<Event>,
    }

    fn create(my_id: &str, config: ServerConfiguration, store: MemoryStore) -> TestReplica {
        let (actor_client, events) = ActorClient::new(1000);
        let state_machine = CountingStateMachine::default();
        let config = ReplicaConfig {
            logger: test_utils::test_logger(),
            shard_id: ShardId::new("shard-1"),
            my_replica_id: ReplicaId::new(my_id),
            bootstrap_config: config,
            // Timers never fire on their own during a test.
            leader_heartbeat_duration: Duration::from_secs(3600),
            follower_min_timeout: Duration::from_secs(3600),
            follower_max_timeout: Duration::from_secs(7200),
            limits: ReplicationLimits {
                rpc_timeout: Duration::from_millis(100),
                max_entries: 100,
                max_bytes: 1 << 20,
            },
            snapshot_policy: SnapshotPolicy {
                batch_count: 1_000_000,
                data_threshold: usize::MAX,
                chunk_size: 1024,
            },
            dedup_window: 100,
        };
        let (replica, _listener) = create_replica(
            config,
            Box::new(store.clone()),
            Box::new(state_machine.clone()),
            Arc::new(UnreachableTransport),
            actor_client.weak(),
        )
        .unwrap();

        TestReplica {
            replica,
            state_machine,
            store,
            _actor_client: actor_client,
            _events: events,
        }
    }

    fn id(replica_id: &str) -> ReplicaId {
        ReplicaId::new(replica_id)
    }

    fn command(term: u64, index: u64) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            client_request_id: None,
            payload: EntryPayload::Command(Bytes::from_static(b"cmd")),
        }
    }

    fn time_out(replica: &mut Replica) {
        let term = replica.status().term;
        replica.handle_election_timeout(ElectionTimeout { term });
    }

    fn vote_request(replica: &Replica) -> RequestVoteInput {
        let status = replica.status();
        RequestVoteInput {
            candidate_term: status.term,
            candidate_id: status.replica_id,
            candidate_last_log_entry: status.latest_entry,
        }
    }

    fn vote_reply(replica: &mut Replica, from: &str, granted: bool) {
        let term = replica.status().term;
        let result = if granted {
            RequestVoteResult::VoteGranted
        } else {
            RequestVoteResult::VoteNotGranted
        };
        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: id(from),
            term,
            result,
        });
    }

    fn append_entries(
        leader: &str,
        term: u64,
        prev: Option<(u64, u64)>,
        entries: Vec<LogEntry>,
        commit: Option<u64>,
    ) -> AppendEntriesInput {
        AppendEntriesInput {
            leader_term: Term::new(term),
            leader_id: id(leader),
            leader_previous_log_entry: prev.map(|(t, i)| (Term::new(t), Index::new(i))),
            leader_commit_index: commit.map(Index::new),
            new_entries: entries,
        }
    }

    fn propose(replica: &mut Replica, request_id: Option<&str>) -> oneshot::Receiver<Result<ProposeOutput, ProposeError>> {
        let (tx, rx) = oneshot::channel();
        replica.handle_propose(
            ProposeInput {
                client_request_id: request_id.map(str::to_string),
                payload: Bytes::from_static(b"hello"),
            },
            Callback::new(tx),
        );
        rx
    }

    #[tokio::test]
    async fn split_vote_then_next_term_elects_leader() {
        // -- setup --
        let config = voters(&["a", "b", "c", "d", "e"]);
        let mut a = create("a", config.clone(), MemoryStore::new());
        let mut b = create("b", config.clone(), MemoryStore::new());
        let mut c = create("c", config.clone(), MemoryStore::new());
        let mut d = create("d", config, MemoryStore::new());

        // -- execute --
        // a and c time out together and split the vote 2-2 ("e" is down).
        time_out(&mut a.replica);
        time_out(&mut c.replica);
        let a_request = vote_request(&a.replica);
        let c_request = vote_request(&c.replica);
        assert!(b.replica.handle_request_vote(a_request.clone()).unwrap().vote_granted);
        assert!(d.replica.handle_request_vote(c_request.clone()).unwrap().vote_granted);
        assert!(!c.replica.handle_request_vote(a_request).unwrap().vote_granted);
        assert!(!a.replica.handle_request_vote(c_request).unwrap().vote_granted);
        vote_reply(&mut a.replica, "b", true);
        vote_reply(&mut a.replica, "c", false);
        vote_reply(&mut c.replica, "d", true);
        vote_reply(&mut c.replica, "a", false);

        // -- verify --
        assert_eq!(a.replica.status().role, ReplicaRole::Candidate);
        assert_eq!(c.replica.status().role, ReplicaRole::Candidate);
        assert_eq!(a.replica.status().term, Term::new(1));

        // -- execute --
        time_out(&mut a.replica);
        let a_request = vote_request(&a.replica);
        let b_vote = b.replica.handle_request_vote(a_request.clone()).unwrap();
        let c_vote = c.replica.handle_request_vote(a_request).unwrap();
        vote_reply(&mut a.replica, "b", b_vote.vote_granted);
        vote_reply(&mut a.replica, "c", c_vote.vote_granted);

        // -- verify --
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);
        assert_eq!(a.replica.status().term, Term::new(2));
        assert_eq!(c.replica.status().role, ReplicaRole::Follower(None));
        assert_eq!(c.replica.status().term, Term::new(2));
        // The new leader's no-op.
        assert_eq!(a.replica.status().latest_entry, Some((Term::new(2), Index::new(1))));
    }

    #[tokio::test]
    async fn prior_term_entry_is_not_committed_by_counting() {
        // -- setup --
        let mut store = MemoryStore::new();
        store.store_term_and_vote(Term::new(2), None).unwrap();
        store.append_entries(&[command(1, 1), command(2, 2)]).unwrap();
        let mut a = create("a", voters(&["a", "b", "c"]), store);
        time_out(&mut a.replica);
        vote_reply(&mut a.replica, "b", true);
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);
        assert_eq!(a.replica.status().latest_entry, Some((Term::new(3), Index::new(3))));

        // -- execute --
        // "b" only stored up to the term 2 entry of the first request.
        a.replica.handle_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesReplyFromPeerDescriptor {
                peer_id: id("b"),
                term: Term::new(3),
                seq_no: 1,
                previous_log_entry_index: Some(Index::new(2)),
                num_log_entries: 1,
            },
            result: Ok(Some(Index::new(2))),
        });

        // -- verify --
        assert_eq!(a.replica.status().commit_index, None);

        // -- execute --
        a.replica.handle_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesReplyFromPeerDescriptor {
                peer_id: id("b"),
                term: Term::new(3),
                seq_no: 2,
                previous_log_entry_index: Some(Index::new(2)),
                num_log_entries: 1,
            },
            result: Ok(Some(Index::new(3))),
        });

        // -- verify --
        let status = a.replica.status();
        assert_eq!(status.commit_index, Some(Index::new(3)));
        assert_eq!(status.last_applied, Some(Index::new(3)));
        assert_eq!(a.state_machine.count(), 2);
    }

    #[tokio::test]
    async fn follower_truncates_conflicting_suffix() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        let output = b
            .replica
            .handle_append_entries(append_entries(
                "a",
                1,
                None,
                vec![command(1, 1), command(1, 2), command(1, 3)],
                Some(1),
            ))
            .unwrap();
        assert_eq!(output.match_index, Some(Index::new(3)));

        // -- execute --
        let output = b
            .replica
            .handle_append_entries(append_entries("c", 2, Some((1, 1)), vec![command(2, 2)], Some(2)))
            .unwrap();

        // -- verify --
        assert_eq!(output.term, Term::new(2));
        assert_eq!(output.match_index, Some(Index::new(2)));
        let status = b.replica.status();
        assert_eq!(status.latest_entry, Some((Term::new(2), Index::new(2))));
        assert_eq!(status.commit_index, Some(Index::new(2)));
        assert_eq!(b.state_machine.count(), 2);
        assert_eq!(
            status.role,
            ReplicaRole::Follower(Some(LeaderRedirectInfo {
                replica_id: id("c"),
                addr: Some(test_utils::server("c", true).addr),
            }))
        );
    }

    #[tokio::test]
    async fn commit_index_never_passes_entries_from_this_request() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());

        // -- execute --
        b.replica
            .handle_append_entries(append_entries("a", 1, None, vec![command(1, 1)], Some(5)))
            .unwrap();

        // -- verify --
        assert_eq!(b.replica.status().commit_index, Some(Index::new(1)));
    }

    #[tokio::test]
    async fn missing_previous_entry_is_rejected_with_hint() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        b.replica
            .handle_append_entries(append_entries("a", 1, None, vec![command(1, 1), command(1, 2)], None))
            .unwrap();

        // -- execute --
        let result = b
            .replica
            .handle_append_entries(append_entries("a", 1, Some((1, 7)), vec![command(1, 8)], None));

        // -- verify --
        match result {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry(info)) => {
                assert_eq!(info.last_log_entry, Some((Term::new(1), Index::new(2))));
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_leader_is_rejected() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        b.replica
            .handle_append_entries(append_entries("a", 3, None, vec![], None))
            .unwrap();

        // -- execute --
        let result = b.replica.handle_append_entries(append_entries("c", 2, None, vec![], None));

        // -- verify --
        match result {
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => assert_eq!(info.current_term, Term::new(3)),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn vote_denied_to_candidate_with_older_log() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        b.replica
            .handle_append_entries(append_entries("c", 2, None, vec![command(2, 1)], None))
            .unwrap();

        // -- execute --
        let output = b
            .replica
            .handle_request_vote(RequestVoteInput {
                candidate_term: Term::new(3),
                candidate_id: id("a"),
                candidate_last_log_entry: Some((Term::new(1), Index::new(5))),
            })
            .unwrap();

        // -- verify --
        assert!(!output.vote_granted);
        assert_eq!(output.term, Term::new(3));
    }

    #[tokio::test]
    async fn non_member_cannot_disrupt_term() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());

        // -- execute --
        let output = b
            .replica
            .handle_request_vote(RequestVoteInput {
                candidate_term: Term::new(9),
                candidate_id: id("removed"),
                candidate_last_log_entry: None,
            })
            .unwrap();

        // -- verify --
        assert!(!output.vote_granted);
        assert_eq!(b.replica.status().term, Term::new(0));
    }

    #[tokio::test]
    async fn single_node_commits_and_deduplicates() {
        // -- setup --
        let mut a = create("a", voters(&["a"]), MemoryStore::new());
        time_out(&mut a.replica);
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);

        // -- execute --
        let first = propose(&mut a.replica, Some("req-1")).try_recv().unwrap().unwrap();
        let retry = propose(&mut a.replica, Some("req-1")).try_recv().unwrap();
        let other = propose(&mut a.replica, None).try_recv().unwrap().unwrap();

        // -- verify --
        assert_eq!(first.entry_id, (Term::new(1), Index::new(2)));
        assert_eq!(first.output, Bytes::from("1"));
        match retry {
            Err(ProposeError::DuplicateRequest { original }) => assert_eq!(original, first.entry_id),
            other => panic!("Unexpected result {:?}", other),
        }
        assert_eq!(other.output, Bytes::from("2"));
        assert_eq!(a.state_machine.count(), 2);
    }

    #[tokio::test]
    async fn follower_redirects_proposals() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        let mut rx = propose(&mut b.replica, None);
        assert!(matches!(rx.try_recv().unwrap(), Err(ProposeError::NotLeader(None))));
        b.replica
            .handle_append_entries(append_entries("a", 1, None, vec![], None))
            .unwrap();

        // -- execute --
        let result = propose(&mut b.replica, None).try_recv().unwrap();

        // -- verify --
        match result {
            Err(ProposeError::NotLeader(Some(leader))) => {
                assert_eq!(leader.replica_id, id("a"));
                assert_eq!(leader.addr, Some(test_utils::server("a", true).addr));
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_membership_change_is_rejected_while_first_is_pending() {
        // -- setup --
        let mut a = create("a", voters(&["a", "b", "c"]), MemoryStore::new());
        time_out(&mut a.replica);
        vote_reply(&mut a.replica, "b", true);

        // -- execute --
        let (tx1, mut rx1) = oneshot::channel();
        a.replica.handle_change_membership(
            MembershipChange::AddServer(test_utils::server("d", true)),
            Callback::new(tx1),
        );
        let (tx2, mut rx2) = oneshot::channel();
        a.replica
            .handle_change_membership(MembershipChange::RemoveServer(id("c")), Callback::new(tx2));

        // -- verify --
        assert!(rx1.try_recv().is_err(), "first change is still waiting to commit");
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(MembershipChangeError::ChangeInProgress)
        ));
        // Added as non voting first, effective on append.
        let latest = a.replica.status().configuration;
        assert_eq!(latest.member(&id("d")).map(|m| m.voting), Some(false));
    }

    fn ack(replica: &mut Replica, peer: &str, seq_no: u64, prev: Option<u64>, num: usize, matched: u64) {
        let term = replica.status().term;
        replica.handle_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesReplyFromPeerDescriptor {
                peer_id: id(peer),
                term,
                seq_no,
                previous_log_entry_index: prev.map(Index::new),
                num_log_entries: num,
            },
            result: Ok(Some(Index::new(matched))),
        });
    }

    #[tokio::test]
    async fn new_member_is_promoted_once_caught_up_then_counts_toward_quorum() {
        // -- setup --
        let mut a = create("a", voters(&["a"]), MemoryStore::new());
        time_out(&mut a.replica);

        // -- execute --
        let (tx, mut rx) = oneshot::channel();
        a.replica.handle_change_membership(
            MembershipChange::AddServer(test_utils::server("b", true)),
            Callback::new(tx),
        );

        // -- verify --
        // The non voting entry at 2 commits on the leader alone, the promotion waits for "b".
        assert!(rx.try_recv().is_err());
        let status = a.replica.status();
        assert_eq!(status.commit_index, Some(Index::new(2)));
        assert_eq!(status.configuration.member(&id("b")).map(|m| m.voting), Some(false));

        // -- execute --
        // First request to "b" was an empty one after entry 2.
        ack(&mut a.replica, "b", 1, Some(2), 0, 2);

        // -- verify --
        let output = rx.try_recv().unwrap().unwrap();
        assert_eq!(output.entry_id, (Term::new(1), Index::new(3)));
        assert_eq!(output.configuration, voters(&["a", "b"]));

        // -- execute --
        let mut proposal = propose(&mut a.replica, None);

        // -- verify --
        assert!(proposal.try_recv().is_err(), "needs an ack from the new voter");

        // -- execute --
        ack(&mut a.replica, "b", 2, Some(2), 1, 3);
        ack(&mut a.replica, "b", 3, Some(3), 1, 4);

        // -- verify --
        let output = proposal.try_recv().unwrap().unwrap();
        assert_eq!(output.entry_id, (Term::new(1), Index::new(4)));
        assert_eq!(a.replica.status().commit_index, Some(Index::new(4)));
    }

    #[tokio::test]
    async fn removal_commits_only_under_the_old_configuration() {
        // -- setup --
        let mut a = create("a", voters(&["a", "b", "c", "d"]), MemoryStore::new());
        time_out(&mut a.replica);
        vote_reply(&mut a.replica, "b", true);
        vote_reply(&mut a.replica, "c", true);
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);

        // -- execute --
        let (tx, mut rx) = oneshot::channel();
        a.replica
            .handle_change_membership(MembershipChange::RemoveServer(id("d")), Callback::new(tx));
        let _proposal = propose(&mut a.replica, None);
        // "b" holds everything, the noop in the first request and then entries 2 and 3.
        ack(&mut a.replica, "b", 1, None, 1, 1);
        ack(&mut a.replica, "b", 2, Some(1), 2, 3);

        // -- verify --
        // Entry 2 is on 2 of the 4 voters it is governed by, so nothing after it may commit either.
        assert_eq!(a.replica.status().commit_index, None);
        assert!(rx.try_recv().is_err());

        // -- execute --
        ack(&mut a.replica, "c", 1, None, 1, 1);

        // -- verify --
        assert_eq!(a.replica.status().commit_index, Some(Index::new(1)));

        // -- execute --
        ack(&mut a.replica, "c", 2, Some(1), 2, 3);

        // -- verify --
        assert_eq!(a.replica.status().commit_index, Some(Index::new(3)));
        let output = rx.try_recv().unwrap().unwrap();
        assert_eq!(output.entry_id, (Term::new(1), Index::new(2)));
        assert!(!output.configuration.contains(&id("d")));
    }

    fn transfer(
        replica: &mut Replica,
        target: &str,
    ) -> oneshot::Receiver<Result<LeadershipTransferOutput, LeadershipTransferError>> {
        let (tx, rx) = oneshot::channel();
        replica.handle_transfer_leadership(id(target), Callback::new(tx));
        rx
    }

    fn elect_a(config: ServerConfiguration) -> TestReplica {
        let mut a = create("a", config, MemoryStore::new());
        time_out(&mut a.replica);
        vote_reply(&mut a.replica, "b", true);
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);
        a
    }

    #[tokio::test]
    async fn leader_hands_off_once_target_holds_its_log() {
        // -- setup --
        let mut a = elect_a(voters(&["a", "b", "c"]));
        let _proposal = propose(&mut a.replica, None);

        // -- execute --
        let mut transfer_rx = transfer(&mut a.replica, "b");

        // -- verify --
        // "b" has acked nothing yet, so it isn't told to campaign and writes are refused meanwhile.
        assert!(matches!(
            a.replica.leadership_transfer,
            Some(PendingLeadershipTransfer {
                timeout_now_sent: false,
                ..
            })
        ));
        let mut refused = propose(&mut a.replica, None);
        assert!(matches!(refused.try_recv(), Ok(Err(ProposeError::NotLeader(None)))));

        // -- execute --
        ack(&mut a.replica, "b", 1, None, 1, 1);

        // -- verify --
        assert!(matches!(
            a.replica.leadership_transfer,
            Some(PendingLeadershipTransfer {
                timeout_now_sent: false,
                ..
            })
        ));

        // -- execute --
        ack(&mut a.replica, "b", 2, Some(1), 1, 2);

        // -- verify --
        assert!(matches!(
            a.replica.leadership_transfer,
            Some(PendingLeadershipTransfer {
                timeout_now_sent: true,
                ..
            })
        ));

        // -- execute --
        // "b" campaigns in term 2 and wins, then its first heartbeat reaches "a".
        let vote = a
            .replica
            .handle_request_vote(RequestVoteInput {
                candidate_term: Term::new(2),
                candidate_id: id("b"),
                candidate_last_log_entry: Some((Term::new(1), Index::new(2))),
            })
            .unwrap();
        assert!(vote.vote_granted);
        assert!(transfer_rx.try_recv().is_err());
        a.replica
            .handle_append_entries(append_entries("b", 2, Some((1, 2)), vec![], Some(2)))
            .unwrap();

        // -- verify --
        let output = transfer_rx.try_recv().unwrap().unwrap();
        assert_eq!(output.new_leader.replica_id, id("b"));
        assert!(a.replica.leadership_transfer.is_none());
        let mut redirected = propose(&mut a.replica, None);
        match redirected.try_recv() {
            Ok(Err(ProposeError::NotLeader(Some(leader)))) => assert_eq!(leader.replica_id, id("b")),
            other => panic!("Expected a redirect to b, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_now_starts_an_election_immediately() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        b.replica
            .handle_append_entries(append_entries("a", 1, None, vec![command(1, 1)], None))
            .unwrap();

        // -- execute --
        let output = b
            .replica
            .handle_timeout_now(TimeoutNowInput {
                leader_term: Term::new(1),
                leader_id: id("a"),
            })
            .unwrap();

        // -- verify --
        assert_eq!(output.term, Term::new(2));
        let status = b.replica.status();
        assert_eq!(status.role, ReplicaRole::Candidate);
        assert_eq!(status.term, Term::new(2));

        // -- execute --
        let stale = b.replica.handle_timeout_now(TimeoutNowInput {
            leader_term: Term::new(1),
            leader_id: id("a"),
        });

        // -- verify --
        match stale {
            Err(TimeoutNowError::ClientTermOutOfDate(info)) => assert_eq!(info.current_term, Term::new(2)),
            other => panic!("Expected a stale term error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn learner_refuses_timeout_now() {
        // -- setup --
        let config = ServerConfiguration::new(vec![
            test_utils::server("a", true),
            test_utils::server("b", true),
            test_utils::server("l", false),
        ]);
        let mut learner = create("l", config, MemoryStore::new());

        // -- execute --
        let result = learner.replica.handle_timeout_now(TimeoutNowInput {
            leader_term: Term::new(1),
            leader_id: id("a"),
        });

        // -- verify --
        assert!(matches!(result, Err(TimeoutNowError::NotVoting)));
        assert_eq!(learner.replica.status().term, Term::new(1));
    }

    #[tokio::test]
    async fn transfer_rejects_bad_targets_and_concurrent_requests() {
        // -- setup --
        let mut a = elect_a(voters(&["a", "b", "c"]));
        let mut follower = create("c", voters(&["a", "b", "c"]), MemoryStore::new());

        // -- execute --
        let mut to_self = transfer(&mut a.replica, "a");
        let mut to_stranger = transfer(&mut a.replica, "z");
        let mut from_follower = transfer(&mut follower.replica, "b");
        let _first = transfer(&mut a.replica, "c");
        let mut second = transfer(&mut a.replica, "b");

        // -- verify --
        assert!(matches!(to_self.try_recv(), Ok(Err(LeadershipTransferError::InvalidTarget(_)))));
        assert!(matches!(to_stranger.try_recv(), Ok(Err(LeadershipTransferError::InvalidTarget(_)))));
        assert!(matches!(from_follower.try_recv(), Ok(Err(LeadershipTransferError::NotLeader(None)))));
        assert!(matches!(second.try_recv(), Ok(Err(LeadershipTransferError::TransferInProgress))));
    }

    #[tokio::test]
    async fn expired_transfer_gives_writes_back_to_the_leader() {
        // -- setup --
        let mut a = elect_a(voters(&["a", "b", "c"]));
        let mut transfer_rx = transfer(&mut a.replica, "c");
        let transfer_id = match &a.replica.leadership_transfer {
            Some(transfer) => transfer.transfer_id,
            None => panic!("Transfer should be pending"),
        };

        // -- execute --
        a.replica.handle_leadership_transfer_timeout(LeadershipTransferTimeout {
            transfer_id: transfer_id + 1,
        });

        // -- verify --
        assert!(transfer_rx.try_recv().is_err());

        // -- execute --
        a.replica
            .handle_leadership_transfer_timeout(LeadershipTransferTimeout { transfer_id });

        // -- verify --
        assert!(matches!(transfer_rx.try_recv(), Ok(Err(LeadershipTransferError::Timeout))));
        assert_eq!(a.replica.status().role, ReplicaRole::Leader);
        let mut accepted = propose(&mut a.replica, None);
        assert!(accepted.try_recv().is_err());
        assert_eq!(a.replica.status().latest_entry, Some((Term::new(1), Index::new(2))));
    }

    #[tokio::test]
    async fn storage_failure_stops_the_replica() {
        // -- setup --
        let mut a = create("a", voters(&["a"]), MemoryStore::new());
        time_out(&mut a.replica);
        a.store.fail_writes(true);

        // -- execute --
        let result = propose(&mut a.replica, None).try_recv().unwrap();

        // -- verify --
        assert!(matches!(result, Err(ProposeError::LocalIoError(_))));
        assert!(a.replica.fault().is_some());
    }

    #[tokio::test]
    async fn chunked_snapshot_replaces_follower_state() {
        // -- setup --
        let mut b = create("b", voters(&["a", "b", "c"]), MemoryStore::new());
        b.replica
            .handle_append_entries(append_entries("a", 1, None, vec![command(1, 1)], None))
            .unwrap();
        let last_included = (Term::new(1), Index::new(10));
        let encoded = Snapshot::new(last_included, Bytes::from("7"), voters(&["a", "b", "c"]), vec![], vec![])
            .encode()
            .unwrap();
        let half = encoded.data.len() / 2;
        let chunk = |offset: usize, end: usize| InstallSnapshotInput {
            leader_term: Term::new(1),
            leader_id: id("a"),
            last_included,
            offset: offset as u64,
            data: encoded.data.slice(offset..end),
            done: end == encoded.data.len(),
        };

        // -- execute --
        let first = b.replica.handle_install_snapshot(chunk(0, half)).unwrap();
        let skipped = b.replica.handle_install_snapshot(chunk(half + 1, encoded.data.len()));
        let last = b
            .replica
            .handle_install_snapshot(chunk(half, encoded.data.len()))
            .unwrap();

        // -- verify --
        assert_eq!(first.next_offset, half as u64);
        match skipped {
            Err(InstallSnapshotError::UnexpectedChunk { expected_offset, .. }) => {
                assert_eq!(expected_offset, half as u64)
            }
            other => panic!("Unexpected result {:?}", other),
        }
        assert_eq!(last.next_offset, encoded.data.len() as u64);
        let status = b.replica.status();
        assert_eq!(status.snapshot_last, Some(last_included));
        assert_eq!(status.commit_index, Some(Index::new(10)));
        assert_eq!(status.last_applied, Some(Index::new(10)));
        assert_eq!(status.snapshots_installed, 1);
        assert_eq!(b.state_machine.count(), 7);
    }

    #[tokio::test]
    async fn restart_replays_committed_entries() {
        // -- setup --
        let store = MemoryStore::new();
        let mut a = create("a", voters(&["a"]), store.clone());
        time_out(&mut a.replica);
        propose(&mut a.replica, None);
        propose(&mut a.replica, Some("req-1"));
        drop(a);

        // -- execute --
        let restarted = create("a", voters(&["a"]), store);

        // -- verify --
        let status = restarted.replica.status();
        assert_eq!(status.term, Term::new(1));
        assert_eq!(status.role, ReplicaRole::Follower(None));
        assert_eq!(status.commit_index, Some(Index::new(3)));
        assert_eq!(status.last_applied, Some(Index::new(3)));
        assert_eq!(restarted.state_machine.count(), 2);
        assert!(restarted.replica.applier.sessions().lookup("req-1").is_some());
    }
}
