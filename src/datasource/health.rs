//! Background health checker. Strictly additive: it never
//! downgrades a datasource already `available`.

use super::{DatasourceRegistry, DatasourceStatus};
use crate::timeout::TimeoutPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct HealthChecker {
    registry: Arc<DatasourceRegistry>,
    interval: Duration,
    warmup: Duration,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<DatasourceRegistry>, interval: Duration, warmup: Duration, probe_timeout: Duration) -> Self {
        Self { registry, interval, warmup, probe_timeout }
    }

    /// Run the periodic heal loop until `cancellation` fires. Intended to
    /// be driven by `tokio::spawn`.
    pub async fn run(&self, cancellation: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.warmup) => {}
            _ = cancellation.cancelled() => return,
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("health checker stopping on cancellation");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// One pass over every registered datasource, healing those that need
    /// it. Exposed separately from `run` so tests can drive a single pass
    /// deterministically.
    pub async fn run_once(&self) {
        let candidates: Vec<String> = {
            let map = self.registry.datasources().await;
            map.iter()
                .filter(|(name, ds)| {
                    let breaker_open = !self.registry.breakers().is_healthy(name);
                    ds.needs_healing(breaker_open)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in candidates {
            self.heal_one(&name).await;
        }
    }

    async fn heal_one(&self, name: &str) {
        let policy = TimeoutPolicy::new(self.probe_timeout);
        let connect_result = policy.run(self.registry.connect_with_retry(name)).await;

        match connect_result {
            Ok(Ok(())) => {
                let connection = self.registry.get(name).await;
                match connection {
                    Ok(conn) => match policy.run(conn.probe()).await {
                        Ok(Ok(())) => {
                            self.mark(name, DatasourceStatus::Available, true).await;
                            self.registry.breakers().reset(name);
                        }
                        _ => {
                            self.mark(name, DatasourceStatus::Degraded, true).await;
                        }
                    },
                    Err(_) => {
                        self.mark(name, DatasourceStatus::Unavailable, false).await;
                    }
                }
            }
            _ => {
                self.mark(name, DatasourceStatus::Unavailable, false).await;
            }
        }
    }

    async fn mark(&self, name: &str, status: DatasourceStatus, initialized: bool) {
        let mut map = self.registry.datasources_mut().await;
        if let Some(ds) = map.get_mut(name) {
            // Never downgrade from `available`: only the request path's
            // circuit breaker is allowed to do that.
            if ds.status == DatasourceStatus::Available && status != DatasourceStatus::Available {
                return;
            }
            ds.status = status;
            ds.initialized = ds.initialized || initialized;
            if status == DatasourceStatus::Available {
                ds.last_error = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::datasource::{ConnectMode, DatasourceConfig, DatasourceKind};
    use crate::error::ReportError;
    use crate::ports::{DatasourceConnection, Row, SchemaInfo};
    use crate::ReconnectBackoff;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecoveringConnection {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DatasourceConnection for RecoveringConnection {
        async fn connect(&self) -> Result<(), ReportError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ReportError::unknown_msg("down"))
            }
        }
        async fn probe(&self) -> Result<(), ReportError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ReportError::unknown_msg("down"))
            }
        }
        async fn query(&self, _table: &str, _fields: &[String]) -> Result<Vec<Row>, ReportError> {
            Ok(vec![])
        }
        async fn discover_schema(&self) -> Result<SchemaInfo, ReportError> {
            Ok(SchemaInfo::default())
        }
    }

    fn config(name: &str) -> DatasourceConfig {
        DatasourceConfig {
            name: name.into(),
            config_name: name.into(),
            kind: DatasourceKind::Relational,
            host: "db".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            database: "d".into(),
            schemas: vec![],
            options: HashMap::new(),
            ssl_mode: None,
            connect_mode: ConnectMode::Lazy,
        }
    }

    #[tokio::test]
    async fn heals_unavailable_datasource_once_connection_recovers() {
        let healthy = Arc::new(AtomicBool::new(false));
        let healthy2 = healthy.clone();
        let registry = Arc::new(DatasourceRegistry::new(
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            ReconnectBackoff { initial: Duration::from_millis(1), max: Duration::from_millis(2), jitter_max: Duration::from_millis(1), factor: 2.0 },
            1,
            move |_cfg| Arc::new(RecoveringConnection { healthy: healthy2.clone() }) as Arc<dyn DatasourceConnection>,
        ));
        registry.register(vec![config("ds1")]).await;

        let checker = HealthChecker::new(registry.clone(), Duration::from_secs(30), Duration::from_millis(0), Duration::from_secs(1));
        checker.run_once().await;
        assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Unavailable));

        healthy.store(true, Ordering::SeqCst);
        checker.run_once().await;
        assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Available));
    }

    #[tokio::test]
    async fn never_downgrades_an_available_datasource() {
        let healthy = Arc::new(AtomicBool::new(true));
        let healthy2 = healthy.clone();
        let registry = Arc::new(DatasourceRegistry::new(
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            ReconnectBackoff::default(),
            1,
            move |_cfg| Arc::new(RecoveringConnection { healthy: healthy2.clone() }) as Arc<dyn DatasourceConnection>,
        ));
        registry.register(vec![config("ds1")]).await;
        let checker = HealthChecker::new(registry.clone(), Duration::from_secs(30), Duration::from_millis(0), Duration::from_secs(1));
        checker.run_once().await;
        assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Available));

        healthy.store(false, Ordering::SeqCst);
        checker.mark("ds1", DatasourceStatus::Unavailable, false).await;
        assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Available));
    }
}
