//! Timeout policy wrapping `tokio::time::timeout` with a typed error, used
//! by the rendering pool (per-task timeout) and the health checker
//! (per-probe timeout).

use std::fmt;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutError {
    pub after: Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out after {:?}", self.after)
    }
}

impl std::error::Error for TimeoutError {}

/// A named timeout duration, applied around an arbitrary future.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Run `fut` to completion or fail with [`TimeoutError`] once
    /// `self.duration` elapses.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.duration, fut).await.map_err(|_| TimeoutError { after: self.duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let policy = TimeoutPolicy::new(Duration::from_millis(100));
        let result = policy.run(async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn times_out_past_deadline() {
        let policy = TimeoutPolicy::new(Duration::from_millis(10));
        let result = policy
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await;
        assert!(result.is_err());
    }
}
