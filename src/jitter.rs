//! Jitter strategies to prevent thundering herd.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter: use the exact backoff delay.
    None,
    /// Full jitter: random between 0 and delay.
    Full,
    /// Equal jitter: random between delay/2 and delay.
    Equal,
    /// Decorrelated jitter: AWS-style, bounded by a base and a max.
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// Apply jitter to a delay duration using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
            Jitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;
                let upper = delay_millis.saturating_mul(3);
                let range_max = upper.min(max_millis);
                if base_millis >= range_max {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.random_range(base_millis..=range_max))
            }
        }
    }
}
