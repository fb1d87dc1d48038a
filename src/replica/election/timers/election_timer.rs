use crate::actor::WeakActorClient;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::election::timers::wake_time::WakeTime;
use crate::replica::{ElectionTimeout, Term};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// ElectionTimerHandle is held by a follower or candidate. Dropping it stops the timer task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    next_wake_time: WakeTime,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_wake_time: WakeTime,
    actor_client: WeakActorClient,
    event: ElectionTimeout,
    clock: C,
    // Not from the paper. Time to wait between repeated timeouts, in case the actor stayed in the
    // same state after handling one (e.g. a non-voting member).
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.shared.reset_timeout();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        term: Term,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let next_wake_time = WakeTime::new();
        let shared = Arc::new(Shared {
            next_wake_time: next_wake_time.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });

        // The task must find a deadline when it starts, otherwise it fires right away.
        shared.reset_timeout();

        let task = ElectionTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_wake_time,
            actor_client,
            event: ElectionTimeout { term },
            clock,
            timeout_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // Deadline was pushed out (e.g. by a leader heartbeat), sleep until then.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // We slept until the deadline and nobody pushed it out: we haven't heard from
                    // a leader in time.
                    if self.weak_shared.strong_count() == 0 {
                        return;
                    }
                    let _ = self.actor_client.election_timeout(self.event.clone()).await;
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // The handle has dropped, so the replica left the state this timer was armed for.
            if self.weak_shared.strong_count() == 0 {
                return;
            }
        }
    }
}
