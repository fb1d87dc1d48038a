use crate::api::types::RaftLeaderInfo;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaRole};

// Lazy event bus. Only election changes are published for now, which is all embedders so far
// have asked for.

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// An event of leader election or timeout. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the next event,
    /// those events will be clobbered into only the most recent event.
    Election(RaftElectionState),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftElectionState {
    Leader { term: u64 },
    Candidate { term: u64 },
    Follower { term: u64, leader: RaftLeaderInfo },
    FollowerNoLeader { term: u64 },
}

pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft replica observes, or None once
    /// the replica is gone.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|election_state| RaftEvent::Election(RaftElectionState::from(election_state)))
    }

    pub fn current_election_state(&self) -> RaftElectionState {
        RaftElectionState::from(self.election_state_change_listener.current())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftElectionState {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        let term = election_state.term.as_u64();
        match election_state.role {
            ReplicaRole::Leader => RaftElectionState::Leader { term },
            ReplicaRole::Candidate => RaftElectionState::Candidate { term },
            ReplicaRole::Follower(Some(leader)) => RaftElectionState::Follower {
                term,
                leader: RaftLeaderInfo::from(leader),
            },
            ReplicaRole::Follower(None) => RaftElectionState::FollowerNoLeader { term },
        }
    }
}
