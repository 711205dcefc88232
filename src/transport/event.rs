//! Wake-up signal for event-mode dispatch
//!
//! Produce, release and setup steps bump a generation counter; a waiter
//! sleeps until the counter moves past the last value `dispatch`
//! acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EventSignal {
    generation: Mutex<u64>,
    acknowledged: AtomicU64,
    changed: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.changed.notify_all();
    }

    /// Mark every notification so far as handled
    pub fn acknowledge(&self) {
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        self.acknowledged.store(*generation, Ordering::Release);
    }

    /// Notifications arrived since the last acknowledge
    pub fn is_pending(&self) -> bool {
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation != self.acknowledged.load(Ordering::Acquire)
    }

    /// Block until a notification is pending or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> bool {
        let seen = self.acknowledged.load(Ordering::Acquire);
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let (generation, _) = self
            .changed
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *generation != seen
    }
}
