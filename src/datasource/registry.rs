//! `DatasourceRegistry`: owns the configured set of datasources, manages
//! lazy/eager connection lifecycle, and fronts every datasource access
//! with a per-name circuit breaker.

use super::{ConnectMode, Datasource, DatasourceConfig, DatasourceStatus};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::{is_fatal_connection, ReportError};
use crate::ports::DatasourceConnection;
use crate::ReconnectBackoff;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

/// Process-wide set of accepted datasource names, built once at startup.
/// `connect` refuses names outside this set to defend against
/// configuration races.
#[derive(Debug, Default)]
pub struct RegistrationOracle {
    accepted: OnceLock<HashSet<String>>,
}

impl RegistrationOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the accepted-names set. Subsequent calls are no-ops;
    /// use [`Self::reset_for_test`] in tests that need to re-seed it.
    pub fn init(&self, names: impl IntoIterator<Item = String>) {
        let _ = self.accepted.set(names.into_iter().collect());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.accepted.get().map(|s| s.contains(name)).unwrap_or(false)
    }

    #[cfg(test)]
    pub fn reset_for_test(&mut self, names: impl IntoIterator<Item = String>) {
        self.accepted = OnceLock::new();
        self.init(names);
    }
}

pub struct DatasourceRegistry {
    datasources: RwLock<HashMap<String, Datasource>>,
    breakers: Arc<CircuitBreakerRegistry>,
    oracle: RegistrationOracle,
    backoff: ReconnectBackoff,
    connect_retry_attempts: u32,
    connection_factory: Box<dyn Fn(&DatasourceConfig) -> Arc<dyn DatasourceConnection> + Send + Sync>,
}

impl DatasourceRegistry {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        backoff: ReconnectBackoff,
        connect_retry_attempts: u32,
        connection_factory: impl Fn(&DatasourceConfig) -> Arc<dyn DatasourceConnection> + Send + Sync + 'static,
    ) -> Self {
        Self {
            datasources: RwLock::new(HashMap::new()),
            breakers,
            oracle: RegistrationOracle::new(),
            backoff,
            connect_retry_attempts,
            connection_factory: Box::new(connection_factory),
        }
    }

    /// Register configured datasources; rejects entries with an empty
    /// `config_name`, logging a warning for each.
    pub async fn register(&self, configs: Vec<DatasourceConfig>) {
        let accepted: Vec<String> = configs.iter().filter(|c| c.is_valid()).map(|c| c.name.clone()).collect();
        self.oracle.init(accepted);

        let mut map = self.datasources.write().await;
        for config in configs {
            if !config.is_valid() {
                tracing::warn!(name = %config.name, "rejecting datasource with empty config_name");
                continue;
            }
            let mode = config.connect_mode;
            let name = config.name.clone();
            map.insert(name, Datasource::new(config));
            let _ = mode; // eager connection is driven by the caller via `connect_eager_all`
        }
    }

    /// Open connections for every `Eager`-mode datasource, with retry.
    pub async fn connect_eager_all(&self) {
        let names: Vec<String> = {
            let map = self.datasources.read().await;
            map.iter().filter(|(_, ds)| ds.config.connect_mode == ConnectMode::Eager).map(|(n, _)| n.clone()).collect()
        };
        for name in names {
            let _ = self.connect_with_retry(&name).await;
        }
    }

    /// Wrap `connect` in a bounded retry loop using the registry's
    /// backoff; exits immediately on a fatal error without further
    /// attempts.
    pub async fn connect_with_retry(&self, name: &str) -> Result<(), ReportError> {
        if !self.oracle.is_registered(name) {
            return Err(ReportError::unknown_msg(format!("datasource '{name}' is not a registered id")));
        }

        let connection = {
            let map = self.datasources.read().await;
            let ds = map.get(name).ok_or_else(|| ReportError::unknown_msg(format!("unknown datasource '{name}'")))?;
            self.connection_factory.as_ref()(&ds.config)
        };

        let mut attempt: u32 = 0;
        let mut last_error: Option<ReportError> = None;

        while attempt < self.connect_retry_attempts {
            match connection.connect().await {
                Ok(()) => {
                    self.record_outcome(name, DatasourceStatus::Available, None, attempt).await;
                    self.set_connection(name, connection).await;
                    return Ok(());
                }
                Err(err) => {
                    let message = err.to_string();
                    if is_fatal_connection(&message) {
                        tracing::error!(name, error = %message, "fatal connection error, not retrying");
                        self.record_outcome(name, DatasourceStatus::Unavailable, Some(message.clone()), attempt + 1).await;
                        return Err(err);
                    }
                    last_error = Some(err);
                    attempt += 1;
                    if attempt < self.connect_retry_attempts {
                        let delay = self.backoff.delay(attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let message = last_error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        self.record_outcome(name, DatasourceStatus::Unavailable, Some(message), attempt).await;
        Err(last_error.unwrap_or_else(|| ReportError::unknown_msg("connect failed with no recorded error")))
    }

    async fn set_connection(&self, name: &str, connection: Arc<dyn DatasourceConnection>) {
        let mut map = self.datasources.write().await;
        if let Some(ds) = map.get_mut(name) {
            ds.connection = Some(connection);
            ds.initialized = true;
        }
    }

    async fn record_outcome(&self, name: &str, status: DatasourceStatus, error: Option<String>, retry_count: u32) {
        let mut map = self.datasources.write().await;
        if let Some(ds) = map.get_mut(name) {
            ds.status = status;
            ds.last_error = error;
            ds.retry_count = retry_count;
            ds.last_attempt = Some(Utc::now());
        }
    }

    /// Fetch a usable connection for `name`, gated by its circuit breaker.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn DatasourceConnection>, ReportError> {
        let breaker = self.breakers.get_or_insert(name);
        if !breaker.is_healthy() {
            return Err(ReportError::unknown_msg(format!("circuit open for datasource '{name}'")));
        }

        let connection = {
            let map = self.datasources.read().await;
            map.get(name).and_then(|ds| ds.connection.clone())
        };

        match connection {
            Some(conn) => Ok(conn),
            None => {
                self.connect_with_retry(name).await?;
                let map = self.datasources.read().await;
                map.get(name)
                    .and_then(|ds| ds.connection.clone())
                    .ok_or_else(|| ReportError::unknown_msg(format!("datasource '{name}' has no connection after connect")))
            }
        }
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub async fn snapshot_status(&self, name: &str) -> Option<DatasourceStatus> {
        self.datasources.read().await.get(name).map(|ds| ds.status)
    }

    pub(crate) async fn datasources(&self) -> tokio::sync::RwLockReadGuard<'_, HashMap<String, Datasource>> {
        self.datasources.read().await
    }

    pub(crate) async fn datasources_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, HashMap<String, Datasource>> {
        self.datasources.write().await
    }
}
