//! Wire/persisted data types for the report-generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Immutable message body consumed from the broker. Exists from publish
/// until terminal acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub template_id: Uuid,
    pub report_id: Uuid,
    pub output_format: String,
    /// `{datasource name -> {table -> [field, ...]}}`
    pub data_queries: HashMap<String, HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Owned by the template store; read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub output_format: String,
    pub description: String,
    pub filename: String,
    pub mapped_fields: HashMap<String, HashMap<String, Vec<String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Processing,
    Finished,
    Error,
}

impl ReportStatus {
    /// `true` once a report has reached `finished` or `error`: a terminal
    /// status is never overwritten.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReportStatus::Finished | ReportStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_code: Option<String>,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub status: ReportStatus,
    pub artifact_ref: Option<String>,
    pub error_metadata: Option<ErrorMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new_pending(id: Uuid, now: DateTime<Utc>) -> Self {
        Self { id, status: ReportStatus::Pending, artifact_ref: None, error_metadata: None, created_at: now, updated_at: now }
    }
}

/// Deterministic object-storage key for a report artifact.
pub fn artifact_key(report_id: Uuid, output_format: &str) -> String {
    format!("reports/{report_id}.{output_format}")
}
