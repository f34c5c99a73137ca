//! Lock-free, atomics-based circuit breaker, plus a registry that keys one
//! breaker per datasource name.
//!
//! Mirrors the state machine shape of a classic circuit breaker (closed /
//! open / half-open) but counts *consecutive* failures rather than a
//! rolling window: `threshold` consecutive failures opens
//! the circuit, `open_timeout` later a single probe is let through
//! (half-open), and up to `max_probes` concurrent probes are allowed
//! before the circuit is forced back open.

use crate::clock::{Clock, MonotonicClock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned by [`CircuitBreaker::call`] when the circuit refuses to let
/// the operation run at all.
#[derive(Debug, Clone, Copy)]
pub struct CircuitOpenError {
    pub consecutive_failures: usize,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit open after {} consecutive failures", self.consecutive_failures)
    }
}

impl std::error::Error for CircuitOpenError {}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub threshold: usize,
    pub open_timeout: Duration,
    pub max_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { threshold: 15, open_timeout: Duration::from_secs(30), max_probes: 3 }
    }
}

struct State {
    status: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_probes: AtomicUsize,
}

/// A single circuit breaker, cheaply cloneable (internal state is shared
/// via `Arc`).
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<State>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("state", &self.current_state()).finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(State {
                status: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_probes: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock),
            epoch: Instant::now(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.epoch = self.clock.now();
        self
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state.status.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("circuit breaker has only three states"),
        }
    }

    /// `true` iff a caller should currently treat this datasource/backend
    /// as usable without even attempting the call (used by the registry's
    /// `is_healthy` check, separate from the stricter gating `call` does).
    pub fn is_healthy(&self) -> bool {
        !matches!(self.current_state(), CircuitState::Open)
    }

    fn now_millis(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_millis() as u64
    }

    /// Run `op` if the circuit allows it, updating breaker state from the
    /// result. Returns `Err(CircuitOpenError)` without running `op` at all
    /// if the circuit is open and the timeout hasn't elapsed, or if the
    /// half-open probe budget is exhausted.
    pub async fn call<T, E, Fut, Op>(&self, mut op: Op) -> Result<T, CircuitBreakerCallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        loop {
            match self.state.status.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.open_timeout.as_millis() as u64 {
                        return Err(CircuitBreakerCallError::Open(CircuitOpenError {
                            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
                        }));
                    }
                    match self.state.status.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("circuit breaker: open → half-open");
                            self.state.half_open_probes.store(1, Ordering::Release);
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let inflight = self.state.half_open_probes.fetch_add(1, Ordering::AcqRel);
                    if inflight >= self.config.max_probes {
                        self.state.half_open_probes.fetch_sub(1, Ordering::Release);
                        return Err(CircuitBreakerCallError::Open(CircuitOpenError {
                            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
                        }));
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.current_state() == CircuitState::HalfOpen;
        let result = op().await;
        if was_half_open {
            self.state.half_open_probes.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(CircuitBreakerCallError::Inner)
    }

    fn on_success(&self) {
        match self.state.status.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .status
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open → closed");
                }
            }
            STATE_CLOSED => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        match self.state.status.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .status
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!("circuit breaker: half-open probe failed → open");
                }
            }
            STATE_CLOSED => {
                let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.threshold
                    && self
                        .state
                        .status
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::error!(failures, threshold = self.config.threshold, "circuit breaker: closed → open");
                }
            }
            _ => {}
        }
    }

    /// Force the breaker back to closed, clearing the failure count. Used
    /// when a health check confirms a datasource has recovered.
    pub fn reset(&self) {
        self.state.status.store(STATE_CLOSED, Ordering::Release);
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.half_open_probes.store(0, Ordering::Release);
    }
}

#[derive(Debug)]
pub enum CircuitBreakerCallError<E> {
    Open(CircuitOpenError),
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerCallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerCallError::Open(e) => write!(f, "{e}"),
            CircuitBreakerCallError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerCallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerCallError::Open(e) => Some(e),
            CircuitBreakerCallError::Inner(e) => Some(e),
        }
    }
}

/// One [`CircuitBreaker`] per datasource name, created lazily on first
/// access with the registry's shared config.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<std::collections::HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: RwLock::new(std::collections::HashMap::new()) }
    }

    pub fn get_or_insert(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().expect("circuit breaker registry lock poisoned").get(name) {
            return breaker.clone();
        }
        let mut write = self.breakers.write().expect("circuit breaker registry lock poisoned");
        write.entry(name.to_string()).or_insert_with(|| CircuitBreaker::new(self.config)).clone()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.breakers
            .read()
            .expect("circuit breaker registry lock poisoned")
            .get(name)
            .map(|b| b.is_healthy())
            .unwrap_or(true)
    }

    pub fn reset(&self, name: &str) {
        if let Some(breaker) = self.breakers.read().expect("circuit breaker registry lock poisoned").get(name) {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }
    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn starts_closed_and_executes() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let result = breaker.call(|| async { Ok::<_, TestError>(42) }).await;
        assert!(matches!(result, Ok(42)));
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { threshold: 3, ..Default::default() });
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = breaker
            .call(|| {
                let counter2 = counter2.clone();
                async move {
                    counter2.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerCallError::Open(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { threshold: 3, ..Default::default() });
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        let _ = breaker.call(|| async { Ok::<_, TestError>(()) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_opens_after_timeout_and_closes_on_success() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 1,
            open_timeout: Duration::from_millis(100),
            max_probes: 1,
        })
        .with_clock(clock.clone());

        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        let result = breaker.call(|| async { Ok::<_, TestError>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerCallError::Open(_))));

        clock.advance(Duration::from_millis(150));
        let result = breaker.call(|| async { Ok::<_, TestError>(99) }).await;
        assert!(matches!(result, Ok(99)));
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 1,
            open_timeout: Duration::from_millis(100),
            max_probes: 1,
        })
        .with_clock(clock.clone());

        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        clock.advance(Duration::from_millis(150));
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_keys_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig { threshold: 1, ..Default::default() });
        let a = registry.get_or_insert("datasource-a");
        let _ = a.call(|| async { Err::<(), _>(TestError) }).await;
        assert!(!registry.is_healthy("datasource-a"));
        assert!(registry.is_healthy("datasource-b"));
    }

    #[tokio::test]
    async fn registry_reset_clears_open_circuit() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig { threshold: 1, ..Default::default() });
        let breaker = registry.get_or_insert("ds");
        let _ = breaker.call(|| async { Err::<(), _>(TestError) }).await;
        assert!(!registry.is_healthy("ds"));
        registry.reset("ds");
        assert!(registry.is_healthy("ds"));
    }
}
