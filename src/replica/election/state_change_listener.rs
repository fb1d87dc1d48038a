use crate::replica::{ReplicaRole, Term};
use tokio::sync::watch;

/// What the replica's election state looked like right after a transition.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ElectionStateSnapshot {
    pub(crate) term: Term,
    pub(crate) role: ReplicaRole,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Skip no-op notifications, e.g. a follower learning the leader it already knew.
        if *self.snd.borrow() != new_state {
            let _ = self.snd.send(new_state);
        }
    }
}

/// Observes election state changes. Only the latest state is kept, so a slow listener sees the
/// most recent transition rather than every one.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }

    /// Waits for the next transition. Returns None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
