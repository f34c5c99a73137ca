//! Backoff strategies for retries, plus the specific reconnect-backoff
//! formula used by the datasource registry.

use crate::jitter::Jitter;
use std::time::Duration;

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// Linearly increasing delay.
    Linear { base: Duration },
    /// Exponentially increasing delay with optional cap.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Delay for a given attempt number (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let exp_delay = base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));
                match max {
                    Some(max) => exp_delay.min(*max),
                    None => exp_delay,
                }
            }
        }
    }
}

/// Bounded exponential backoff with full jitter:
/// `backoff(attempt) = min(initial * 2^attempt, max) + jitter`, jitter drawn
/// uniformly from `[0, jitter_max)`. Also exposes `next(current)` for
/// callers that track a running delay rather than an attempt counter:
/// `next(current) = min(current * factor, max)`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter_max: Duration,
    pub factor: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter_max: Duration::from_millis(500),
            factor: 2.0,
        }
    }
}

impl ReconnectBackoff {
    /// Delay for the given zero-indexed attempt, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    pub fn delay_with_rng<R: rand::Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_millis = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_millis == 0 { 0 } else { rng.random_range(0..jitter_millis) };
        base + Duration::from_millis(jitter)
    }

    /// The un-jittered component: `min(initial * 2^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.initial.checked_mul(multiplier).unwrap_or(self.max).min(self.max)
    }

    /// Advance a running delay: `min(current * factor, max)`. Used by
    /// callers that track delay state directly rather than an attempt
    /// index (e.g. a health-check heal loop that keeps retrying).
    pub fn next(&self, current: Duration) -> Duration {
        let scaled = current.mul_f64(self.factor);
        scaled.min(self.max)
    }

    /// Apply full jitter (uniform sample in `[0, current]`, capped at
    /// `max`) to a caller-tracked running delay.
    pub fn full_jitter(&self, current: Duration) -> Duration {
        self.full_jitter_with_rng(current, &mut rand::rng())
    }

    pub fn full_jitter_with_rng<R: rand::Rng>(&self, current: Duration, rng: &mut R) -> Duration {
        Jitter::Full.apply_with_rng(current, rng).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_backoff_base_matches_spec_formula() {
        let rb = ReconnectBackoff::default();
        assert_eq!(rb.base_delay(0), Duration::from_secs(1));
        assert_eq!(rb.base_delay(1), Duration::from_secs(2));
        assert_eq!(rb.base_delay(2), Duration::from_secs(4));
        // Caps at `max` regardless of how large the attempt counter gets.
        assert_eq!(rb.base_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn reconnect_backoff_delay_bounds_hold_for_many_attempts() {
        let rb = ReconnectBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..20u32 {
            let base = rb.base_delay(attempt);
            let delay = rb.delay_with_rng(attempt, &mut rng);
            assert!(delay >= base, "delay must be at least the un-jittered base");
            assert!(delay <= base + rb.jitter_max, "delay must not exceed base + jitter_max");
        }
    }

    #[test]
    fn reconnect_backoff_next_scales_by_factor_and_caps() {
        let rb = ReconnectBackoff::default();
        assert_eq!(rb.next(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(rb.next(Duration::from_secs(20)), Duration::from_secs(30));
    }

    #[test]
    fn reconnect_backoff_full_jitter_is_bounded() {
        let rb = ReconnectBackoff::default();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let j = rb.full_jitter_with_rng(Duration::from_secs(40), &mut rng);
            assert!(j <= rb.max);
        }
    }
}
