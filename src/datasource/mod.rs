//! Datasource registry & resilience layer.

mod health;
mod registry;
mod schema;

pub use health::HealthChecker;
pub use registry::{DatasourceRegistry, RegistrationOracle};
pub use schema::sample_size_for;

use crate::ports::SchemaInfo;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceKind {
    Relational,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceStatus {
    Unknown,
    Available,
    Unavailable,
    Degraded,
}

/// How a datasource's connection is opened: not at all until first use
/// (`Lazy`), or eagerly at startup with retry (`Eager`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Lazy,
    Eager,
}

#[derive(Debug, Clone)]
pub struct DatasourceConfig {
    pub name: String,
    pub config_name: String,
    pub kind: DatasourceKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schemas: Vec<String>,
    pub options: std::collections::HashMap<String, String>,
    pub ssl_mode: Option<String>,
    pub connect_mode: ConnectMode,
}

impl DatasourceConfig {
    /// A definition is only accepted if `config_name` is non-empty;
    /// callers assembling the registry from raw config reject others
    /// with a warning.
    pub fn is_valid(&self) -> bool {
        !self.config_name.is_empty()
    }

    /// Connection-string rendering with user/password URL-encoded.
    /// The scheme is derived from `kind`.
    pub fn connection_string(&self) -> String {
        use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
        let scheme = match self.kind {
            DatasourceKind::Relational => "postgres",
            DatasourceKind::Document => "mongodb",
        };
        let user = utf8_percent_encode(&self.user, NON_ALPHANUMERIC);
        let password = utf8_percent_encode(&self.password, NON_ALPHANUMERIC);
        format!("{scheme}://{user}:{password}@{}:{}/{}", self.host, self.port, self.database)
    }

    /// The same connection string with credentials replaced by a fixed
    /// placeholder, safe to log.
    pub fn redacted_connection_string(&self) -> String {
        let scheme = match self.kind {
            DatasourceKind::Relational => "postgres",
            DatasourceKind::Document => "mongodb",
        };
        format!("{scheme}://***:***@{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Runtime state for one configured datasource, owned exclusively by the
/// registry and health checker.
pub struct Datasource {
    pub name: String,
    pub kind: DatasourceKind,
    pub config: DatasourceConfig,
    pub status: DatasourceStatus,
    pub initialized: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub connection: Option<Arc<dyn crate::ports::DatasourceConnection>>,
    pub schema_cache: Option<SchemaInfo>,
}

impl Datasource {
    pub fn new(config: DatasourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            config,
            status: DatasourceStatus::Unknown,
            initialized: false,
            last_error: None,
            retry_count: 0,
            last_attempt: None,
            connection: None,
            schema_cache: None,
        }
    }

    /// A datasource needs healing if unavailable, uninitialized,
    /// or (via the caller passing breaker state) its circuit is open.
    pub fn needs_healing(&self, breaker_open: bool) -> bool {
        self.status == DatasourceStatus::Unavailable || !self.initialized || breaker_open
    }
}
