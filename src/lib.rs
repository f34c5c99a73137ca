#![forbid(unsafe_code)]

//! # reporter
//!
//! Core of a report-generation worker service: a reliable message-driven
//! pipeline that consumes report-generation requests from a broker,
//! orchestrates template rendering and data retrieval against heterogeneous
//! datasources, and guarantees either successful completion with persisted
//! artifacts or a durable failure record.
//!
//! The crate is organized the way a resilience toolkit is organized: small,
//! independently testable primitives (backoff, jitter, circuit breaker,
//! timeout) composed by larger subsystems (datasource registry, rendering
//! pool, broker consumer, orchestrator). Every external system (the broker,
//! object storage, relational/document datasources, the rendering
//! subprocess) is reached through a trait in [`ports`]; concrete backends
//! live in sibling crates (`reporter-amqp`, `reporter-s3`,
//! `reporter-postgres`, `reporter-mongo`, `reporter-render`) so this crate
//! never depends on a specific driver.
//!
//! ## Quick start
//!
//! ```no_run
//! use reporter::ServiceConfig;
//!
//! let config = ServiceConfig::default();
//! assert_eq!(config.max_retries, 5);
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod error;
mod headers;
mod jitter;
mod sleeper;
mod timeout;

pub mod broker;
pub mod config;
pub mod datasource;
pub mod orchestrator;
pub mod ports;
pub mod render;
pub mod service;

pub use backoff::{Backoff, ReconnectBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ServiceConfig;
pub use error::{is_fatal_connection, is_retryable, truncate_reason, truncate_to_len, ReportError};
pub use headers::HeaderValue;
pub use jitter::Jitter;
pub use service::Service;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy};

pub mod prelude {
    //! Convenient re-exports for common `reporter` types.
    pub use crate::{
        Backoff, CircuitBreaker, CircuitBreakerRegistry, Clock, HeaderValue, Jitter,
        MonotonicClock, ReconnectBackoff, ReportError, Service, ServiceConfig, Sleeper,
        TimeoutPolicy,
    };
}
