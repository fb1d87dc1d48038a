use tokio::time::{Duration, Instant};

/// Clock is the seam between timer tasks and time, so tests can drive timers by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use mock::mocked_clock;


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_wakes_sleepers_in_order() {
        // -- setup --
        let tick = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut clock, mut controller) = mocked_clock();
        let start = controller.current_time();

        tokio::spawn(async move {
            for n in 1..=4u32 {
                clock.sleep_until(start + tick * n).await;
                if tx.send(n).is_err() {
                    return;
                }
            }
        });

        // -- execute & verify --
        controller.advance(tick / 2);
        tokio::time::timeout(tick, rx.recv())
            .await
            .expect_err("Nothing is due yet");

        controller.advance(tick);
        assert_eq!(rx.recv().await, Some(1));

        // One big step releases every deadline it passes.
        controller.advance(tick * 3);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));

        assert_eq!(controller.elapsed_time(), tick * 9 / 2);
    }
}
