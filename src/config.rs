//! Service-wide configuration surface.
//!
//! `ServiceConfig` is a plain struct a caller populates (from environment,
//! a file, a secrets manager, whatever their own out-of-workspace config
//! loader does) and hands to [`crate::Service`]. No env-var parsing lives
//! here; every field carries its documented default.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_retries: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub retry_jitter_max: Duration,

    pub num_workers: usize,
    pub prefetch: u16,

    pub pdf_pool_workers: usize,
    pub pdf_timeout: Duration,
    pub pdf_min_valid_size: usize,

    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_open_timeout: Duration,
    pub circuit_breaker_max_probes: usize,

    pub health_check_interval: Duration,
    pub health_check_warmup: Duration,
    pub health_check_timeout: Duration,

    pub connect_retry_attempts: u32,

    pub reason_max_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_initial_backoff: Duration::from_secs(1),
            retry_max_backoff: Duration::from_secs(30),
            retry_jitter_max: Duration::from_millis(500),

            num_workers: 5,
            prefetch: 1,

            pdf_pool_workers: 2,
            pdf_timeout: Duration::from_secs(90),
            pdf_min_valid_size: 1000,

            circuit_breaker_threshold: 15,
            circuit_breaker_open_timeout: Duration::from_secs(30),
            circuit_breaker_max_probes: 3,

            health_check_interval: Duration::from_secs(30),
            health_check_warmup: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(5),

            connect_retry_attempts: 3,

            reason_max_len: crate::error::REASON_MAX_LEN,
        }
    }
}

impl ServiceConfig {
    pub fn reconnect_backoff(&self) -> crate::ReconnectBackoff {
        crate::ReconnectBackoff {
            initial: self.retry_initial_backoff,
            max: self.retry_max_backoff,
            jitter_max: self.retry_jitter_max,
            factor: 2.0,
        }
    }

    pub fn circuit_breaker_config(&self) -> crate::circuit_breaker::CircuitBreakerConfig {
        crate::circuit_breaker::CircuitBreakerConfig {
            threshold: self.circuit_breaker_threshold,
            open_timeout: self.circuit_breaker_open_timeout,
            max_probes: self.circuit_breaker_max_probes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.num_workers, 5);
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.pdf_pool_workers, 2);
        assert_eq!(config.pdf_timeout, Duration::from_secs(90));
        assert_eq!(config.pdf_min_valid_size, 1000);
        assert_eq!(config.circuit_breaker_threshold, 15);
        assert_eq!(config.circuit_breaker_open_timeout, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker_max_probes, 3);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.reason_max_len, 256);
    }
}
