use crate::actor::WeakActorClient;
use crate::replica::election::leader_state::LeaderStateTracker;
use crate::replica::election::state_change_listener::{self, ElectionStateChangeNotifier};
use crate::replica::election::timers::ElectionTimerHandle;
use crate::replica::election::{ElectionStateChangeListener, ElectionStateSnapshot};
use crate::replica::{LeaderRedirectInfo, ReplicaId, ReplicaRole, Term};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    term: Term,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone(), term));
        let (notifier, listener) = state_change_listener::new(Self::snapshot_of(&initial_state, term));

        let election_state = Self {
            state: initial_state,
            term,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<LeaderRedirectInfo>) {
        self.term = term;
        self.state = State::Follower(FollowerState::new(
            new_leader,
            &self.config,
            self.actor_client.clone(),
            term,
        ));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone(), term);

        // Vote for self
        cs.received_votes_from.insert(self.config.my_replica_id.clone());

        self.term = term;
        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    /// Becomes leader with an empty tracker. The caller adds peers from the configuration.
    pub(crate) fn transition_to_leader(&mut self, term: Term) {
        self.term = term;
        self.state = State::Leader(LeaderStateTracker::new(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            term,
        ));
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::snapshot_of(&self.state, self.term)
    }

    fn snapshot_of(state: &State, term: Term) -> ElectionStateSnapshot {
        let role = match state {
            State::Leader(_) => ReplicaRole::Leader,
            State::Candidate(_) => ReplicaRole::Candidate,
            State::Follower(fs) => ReplicaRole::Follower(fs.leader.clone()),
        };
        ElectionStateSnapshot { term, role }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Candidate(_) => CurrentLeader::Unknown,
            State::Follower(FollowerState { leader: Some(leader), .. }) => CurrentLeader::Other(leader.clone()),
            State::Follower(FollowerState { leader: None, .. }) => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Returns the votes received so far if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<&HashSet<ReplicaId>> {
        if let State::Candidate(cs) = &mut self.state {
            cs.received_votes_from.insert(vote_from);
            Some(&cs.received_votes_from)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(tracker) = &self.state {
            Some(tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(tracker) = &mut self.state {
            Some(tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader(Term={:?})", self.term),
            State::Candidate(cs) => write!(
                f,
                "Candidate(Term={:?}, Votes={})",
                self.term,
                cs.received_votes_from.len()
            ),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Term={:?}, Leader={:?})", self.term, leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => {
                write!(f, "Follower(Term={:?}, Leader=None)", self.term)
            }
        }
    }
}

enum State {
    Leader(LeaderStateTracker),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    election_timer: ElectionTimerHandle,
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient, term: Term) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
                term,
            ),
        }
    }
}

impl FollowerState {
    fn new(
        leader: Option<LeaderRedirectInfo>,
        config: &ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        Self {
            leader,
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
                term,
            ),
        }
    }
}
