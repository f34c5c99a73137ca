//! Clock abstraction so time-dependent components (circuit breaker, health
//! checker) can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Clock backed by `std::time::Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: starts at an arbitrary epoch and only
/// advances when told to.
#[derive(Debug)]
pub struct ManualClock {
    epoch: Instant,
    offset_millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now(), offset_millis: AtomicU64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}
