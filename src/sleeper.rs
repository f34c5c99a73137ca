//! Sleep abstraction: the broker retry engine and the datasource
//! reconnect loop both sleep between attempts through a `Sleeper` seam
//! rather than calling `tokio::time::sleep` directly, so tests can run
//! retry/backoff logic without real wall-clock delay.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps for real using the Tokio timer. Used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Never actually sleeps; used in tests that want retry logic to run at
/// full speed.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Records every requested duration without sleeping, so a test can
/// assert on the exact backoff sequence a retry loop produced.
#[derive(Debug, Default)]
pub struct TrackingSleeper {
    requested: Mutex<Vec<Duration>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.requested.lock().expect("tracking sleeper mutex poisoned").clone()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.lock().expect("tracking sleeper mutex poisoned").push(duration);
    }
}
