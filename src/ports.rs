//! Port traits: every external system the core reaches is behind one of
//! these. Concrete backends live in sibling crates (`reporter-amqp`,
//! `reporter-s3`, `reporter-postgres`, `reporter-mongo`, `reporter-render`);
//! this crate depends on none of them.

use crate::broker::DeliveryEnvelope;
use crate::error::ReportError;
use crate::orchestrator::model::{ErrorMetadata, Report, ReportStatus, Template};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// One row of a datasource query result, keyed by field name.
pub type Row = HashMap<String, Value>;

/// Discovered table/column structure for one datasource, used to populate
/// `Datasource::schema_cache`.
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    pub tables: HashMap<String, Vec<String>>,
}

/// A live (or about-to-be-opened) connection to one configured datasource.
/// Implemented per backend (`reporter-postgres`, `reporter-mongo`).
#[async_trait]
pub trait DatasourceConnection: Send + Sync {
    /// Open the underlying connection. Called by `connect_with_retry`.
    async fn connect(&self) -> Result<(), ReportError>;

    /// A lightweight liveness probe (e.g. read schema metadata), used by
    /// the health checker after a successful `connect`.
    async fn probe(&self) -> Result<(), ReportError>;

    /// Execute a field-projected query against `table`.
    async fn query(&self, table: &str, fields: &[String]) -> Result<Vec<Row>, ReportError>;

    /// Discover table/column structure, using tiered sampling for
    /// document stores.
    async fn discover_schema(&self) -> Result<SchemaInfo, ReportError>;
}

/// Durable object storage (S3-compatible). Implemented by `reporter-s3`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent on overwrite.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReportError>;
}

/// Read-only template metadata/bytes lookup. Implemented by `reporter-mongo`.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Template, ReportError>;

    /// The template's rendered-source bytes (e.g. an HTML/text template
    /// body keyed by `Template::filename`).
    async fn get_bytes(&self, template: &Template) -> Result<Vec<u8>, ReportError>;
}

/// Report metadata persistence. Implemented by `reporter-mongo`.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Report>, ReportError>;

    /// Conditional upsert: MUST NOT overwrite an already-terminal status.
    async fn update_status(
        &self,
        id: Uuid,
        new_status: ReportStatus,
        metadata: Option<ErrorMetadata>,
        artifact_ref: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), ReportError>;

    /// Create indexes required for efficient lookup; idempotent.
    async fn ensure_indexes(&self) -> Result<(), ReportError>;
}

/// A single inbound or republished broker message, addressed by an opaque
/// delivery tag the backend uses to ack/nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: DeliveryEnvelope,
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub content_type: Option<String>,
    /// Opaque backend-assigned identifier for ack/nack.
    pub tag: u64,
}

/// Broker consumer/publisher seam. Implemented by `reporter-amqp`.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Subscribe to `queue`, applying `prefetch` as the consumer's QoS.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<BoxStream<'static, Delivery>, ReportError>;

    async fn ack(&self, tag: u64) -> Result<(), ReportError>;

    /// Negatively acknowledge without requeueing: routes to the queue's
    /// dead-letter exchange (declared externally, out of scope here).
    async fn nack_no_requeue(&self, tag: u64) -> Result<(), ReportError>;

    /// Republish with the original exchange, routing key, content-type, and
    /// body; `delivery_mode` persistent; `new_headers` as the full header
    /// set (caller has already merged original headers with the updated
    /// `retry_count`/`failure_reason`).
    async fn republish(&self, original: &Delivery, new_headers: DeliveryEnvelope) -> Result<(), ReportError>;
}

/// Document-rendering backend: turns input bytes into output artifact
/// bytes. Implemented by `reporter-render` (headless Chromium).
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, input: &[u8]) -> Result<Vec<u8>, ReportError>;
}
