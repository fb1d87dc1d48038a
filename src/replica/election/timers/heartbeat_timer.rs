use crate::actor::WeakActorClient;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::election::timers::wake_time::WakeTime;
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// HeartbeatTimerHandle is held by the leader for each peer. Dropping it stops the timer task.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: WakeTime,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: WakeTime,
    actor_client: WeakActorClient,
    event: LeaderTimerTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Pushes out the next time we notify the actor to send AE to this peer.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        let new_timeout = self.clock.now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_heartbeat_time = WakeTime::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: next_heartbeat_time.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time,
            actor_client,
            event: LeaderTimerTick { peer_id, term },
            clock,
        };
        let handle = HeartbeatTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The first iteration finds no wake time and fires right away, so a new leader (or a newly
        // added member) gets its first AppendEntries without waiting a full heartbeat.
        loop {
            let wake_time: Option<Instant> = self.next_heartbeat_time.take();
            match wake_time {
                Some(wake_time) => {
                    // A request went out to this peer recently, no heartbeat needed until then.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    let shared = match self.weak_shared.upgrade() {
                        Some(shared) => shared,
                        // No longer leader of the same term, or the peer was removed.
                        None => return,
                    };
                    let _ = self.actor_client.leader_timer(self.event.clone()).await;
                    shared.reset_heartbeat_timer();
                }
            }
        }
    }
}
