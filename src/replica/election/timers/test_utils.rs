use crate::actor::Event;
use crate::replica::{ElectionTimeout, LeaderTimerTick, Term};
use std::time::Duration;
use tokio::sync::mpsc;

/// TestUtilActor stands in for the replica actor and asserts on what timer tasks enqueue.
pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    timeout: Duration,
}

impl TestUtilActor {
    pub(super) fn new(actor_queue_rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx: actor_queue_rx,
            timeout: Duration::from_millis(10),
        }
    }

    async fn recv(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected value")
    }

    pub(super) async fn assert_heartbeat_event(&mut self, expected: LeaderTimerTick) {
        match self.recv().await {
            Event::LeaderTimer(event) => assert_eq!(event, expected),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(super) async fn assert_election_timeout_event(&mut self, expected_term: Term) {
        match self.recv().await {
            Event::ElectionTimeout(event) => assert_eq!(event, ElectionTimeout { term: expected_term }),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        tokio::time::timeout(self.timeout, self.rx.recv())
            .await
            .expect_err("Expected timeout");
    }
}
