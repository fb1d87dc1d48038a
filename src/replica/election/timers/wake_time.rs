use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// WakeTime is the next instant a timer task should act at, shared between the task and its
/// handle. The task takes it before sleeping, so an empty slot after waking means nobody pushed
/// the deadline out in the meantime.
#[derive(Clone, Default)]
pub(super) struct WakeTime {
    next: Arc<Mutex<Option<Instant>>>,
}

impl WakeTime {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn replace(&self, wake_time: Instant) {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(wake_time);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.next.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
