use crate::replica;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous inside the actor, except for snapshot encoding and writing which
// is spawned and reported back as an event.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append to log, replicate, and keep the callback until the entry is applied.
    // Candidate/Follower: Reject with a redirect.
    Propose(
        replica::ProposeInput,
        Callback<replica::ProposeOutput, replica::ProposeError>,
    ),

    // Leader: Append a configuration entry. Only one change may be in flight.
    // Candidate/Follower: Reject with a redirect.
    ChangeMembership(
        replica::MembershipChange,
        Callback<replica::MembershipChangeOutput, replica::MembershipChangeError>,
    ),

    // Leader: Stop taking proposals, catch the target up and tell it to campaign.
    // Candidate/Follower: Reject with a redirect.
    TransferLeadership(
        replica::ReplicaId,
        Callback<replica::LeadershipTransferOutput, replica::LeadershipTransferError>,
    ),

    TriggerSnapshot(Callback<replica::SnapshotOutput, replica::SnapshotError>),

    Status(Callback<replica::ReplicaStatus, replica::StatusError>),

    // Leader/Candidate: Transition to follower if the term is newer, then same as follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Candidate: Count the vote. Transition to leader on quorum.
    // Leader/Follower: discard unless it reveals a newer term.
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader/Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Update the peer's progress, advance commit index and apply.
    // Candidate/Follower: discard unless it reveals a newer term.
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Same term rules as AppendEntries. The last chunk replaces the state machine.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Follower: Accept the sender as leader, then campaign without waiting for a timeout.
    TimeoutNow(
        replica::TimeoutNowInput,
        Callback<replica::TimeoutNowOutput, replica::TimeoutNowError>,
    ),

    // Leader: Send the peer whatever it is missing, or a heartbeat.
    // Candidate/Follower: discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: discard
    // Candidate/Follower: Start a new election.
    ElectionTimeout(replica::ElectionTimeout),

    // Fail the transfer if it is still pending, and resume taking proposals if still leader.
    LeadershipTransferTimeout(replica::LeadershipTransferTimeout),

    SnapshotPersisted(replica::SnapshotPersisted),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        // Receiver may have given up (e.g. client timed out). Nothing to do about it.
        let _ = self.0.send(message);
    }
}

/// Error types that can express "the actor is gone".
pub(crate) trait ActorExitedError {
    fn actor_exited() -> Self;
}

macro_rules! impl_actor_exited {
    ($($error:ty),*) => {
        $(
            impl ActorExitedError for $error {
                fn actor_exited() -> Self {
                    <$error>::ActorExited
                }
            }
        )*
    };
}

impl_actor_exited!(
    replica::ProposeError,
    replica::MembershipChangeError,
    replica::LeadershipTransferError,
    replica::SnapshotError,
    replica::StatusError,
    replica::RequestVoteError,
    replica::AppendEntriesError,
    replica::InstallSnapshotError,
    replica::TimeoutNowError
);

#[derive(Debug, thiserror::Error)]
#[error("Replica actor is dead RIP")]
pub(crate) struct ActorExited;

/// ActorClient is the owning handle of a replica actor. The actor exits once every ActorClient is
/// dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn propose(
        &self,
        input: replica::ProposeInput,
    ) -> Result<replica::ProposeOutput, replica::ProposeError> {
        self.call(|callback| Event::Propose(input, callback)).await
    }

    pub(crate) async fn change_membership(
        &self,
        change: replica::MembershipChange,
    ) -> Result<replica::MembershipChangeOutput, replica::MembershipChangeError> {
        self.call(|callback| Event::ChangeMembership(change, callback)).await
    }

    pub(crate) async fn transfer_leadership(
        &self,
        target: replica::ReplicaId,
    ) -> Result<replica::LeadershipTransferOutput, replica::LeadershipTransferError> {
        self.call(|callback| Event::TransferLeadership(target, callback)).await
    }

    pub(crate) async fn trigger_snapshot(&self) -> Result<replica::SnapshotOutput, replica::SnapshotError> {
        self.call(Event::TriggerSnapshot).await
    }

    pub(crate) async fn status(&self) -> Result<replica::ReplicaStatus, replica::StatusError> {
        self.call(Event::Status).await
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        self.call(|callback| Event::RequestVote(input, callback)).await
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        self.call(|callback| Event::AppendEntries(input, callback)).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        self.call(|callback| Event::InstallSnapshot(input, callback)).await
    }

    pub(crate) async fn timeout_now(
        &self,
        input: replica::TimeoutNowInput,
    ) -> Result<replica::TimeoutNowOutput, replica::TimeoutNowError> {
        self.call(|callback| Event::TimeoutNow(input, callback)).await
    }

    async fn call<O, E, F>(&self, to_event: F) -> Result<O, E>
    where
        O: Debug,
        E: Error + ActorExitedError,
        F: FnOnce(Callback<O, E>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        self.send(to_event(Callback(tx))).await.map_err(|_| E::actor_exited())?;

        // Sender is dropped without a reply only if the actor stopped mid-request.
        rx.await.unwrap_or_else(|_| Err(E::actor_exited()))
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is held by everything the actor itself owns (timers, RPC tasks) and by routing
/// tables, so none of them keep the actor alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        self.sender
            .upgrade()
            .map(|sender| ActorClient { sender })
            .ok_or(ActorExited)
    }

    pub(crate) async fn propose(
        &self,
        input: replica::ProposeInput,
    ) -> Result<replica::ProposeOutput, replica::ProposeError> {
        match self.upgrade() {
            Ok(client) => client.propose(input).await,
            Err(_) => Err(replica::ProposeError::ActorExited),
        }
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        match self.upgrade() {
            Ok(client) => client.request_vote(input).await,
            Err(_) => Err(replica::RequestVoteError::ActorExited),
        }
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        match self.upgrade() {
            Ok(client) => client.append_entries(input).await,
            Err(_) => Err(replica::AppendEntriesError::ActorExited),
        }
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        match self.upgrade() {
            Ok(client) => client.install_snapshot(input).await,
            Err(_) => Err(replica::InstallSnapshotError::ActorExited),
        }
    }

    pub(crate) async fn timeout_now(
        &self,
        input: replica::TimeoutNowInput,
    ) -> Result<replica::TimeoutNowOutput, replica::TimeoutNowError> {
        match self.upgrade() {
            Ok(client) => client.timeout_now(input).await,
            Err(_) => Err(replica::TimeoutNowError::ActorExited),
        }
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_snapshot_persisted(&self, persisted: replica::SnapshotPersisted) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::SnapshotPersisted(persisted)).await
    }

    pub(crate) async fn leader_timer(&self, tick: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn election_timeout(&self, timeout: replica::ElectionTimeout) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::ElectionTimeout(timeout)).await
    }

    pub(crate) async fn leadership_transfer_timeout(
        &self,
        timeout: replica::LeadershipTransferTimeout,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::LeadershipTransferTimeout(timeout)).await
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica,
}

impl ReplicaActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);

            if let Some(fault) = self.replica.fault() {
                slog::crit!(self.logger, "Replica stopped: {}", fault);
                return;
            }
        }
        slog::info!(self.logger, "All clients dropped, replica actor exiting.");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Propose(input, callback) => {
                self.replica.handle_propose(input, callback);
            }
            Event::ChangeMembership(change, callback) => {
                self.replica.handle_change_membership(change, callback);
            }
            Event::TransferLeadership(target, callback) => {
                self.replica.handle_transfer_leadership(target, callback);
            }
            Event::TriggerSnapshot(callback) => {
                self.replica.handle_trigger_snapshot(callback);
            }
            Event::Status(callback) => {
                callback.send(Ok(self.replica.status()));
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::TimeoutNow(input, callback) => {
                let result = self.replica.handle_timeout_now(input);
                callback.send(result);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::ElectionTimeout(timeout) => {
                self.replica.handle_election_timeout(timeout);
            }
            Event::LeadershipTransferTimeout(timeout) => {
                self.replica.handle_leadership_transfer_timeout(timeout);
            }
            Event::SnapshotPersisted(persisted) => {
                self.replica.handle_snapshot_persisted(persisted);
            }
        }
    }
}
