//! Report-generation orchestrator: the 9-step pipeline from parsing the
//! incoming request through rendering and persisting the finished artifact.

pub mod model;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::datasource::DatasourceRegistry;
use crate::error::{is_retryable, truncate_to_len, ReportError};
use crate::ports::{ObjectStore, ReportStore, TemplateStore};
use crate::render::RenderPool;
use chrono::Utc;
use model::{artifact_key, ErrorMetadata, Report, ReportRequest, ReportStatus};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct ReportOrchestrator {
    pub template_store: Arc<dyn TemplateStore>,
    pub report_store: Arc<dyn ReportStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub datasources: Arc<DatasourceRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub render_pool: Option<Arc<RenderPool>>,
    pub reason_max_len: usize,
    pub artifact_bucket: String,
}

/// Output formats that require document conversion through the rendering
/// pool rather than being persisted as raw rendered text/HTML.
fn requires_conversion(output_format: &str) -> bool {
    matches!(output_format, "pdf")
}

impl ReportOrchestrator {
    #[tracing::instrument(skip_all, fields(request_id))]
    pub async fn handle(&self, request_id: &str, body: &[u8]) -> Result<(), ReportError> {
        tracing::Span::current().record("request_id", request_id);

        // Step 1: parse.
        let request: ReportRequest = serde_json::from_slice(body)
            .map_err(|e| ReportError::validation("TPL-PARSE", format!("invalid report request body: {e}")))?;

        // Step 2: idempotence check.
        let existing = self.report_store.find_by_id(request.report_id).await?;
        if let Some(report) = &existing {
            if report.status.is_terminal() {
                tracing::info!(report_id = %request.report_id, status = ?report.status, "report already terminal; acknowledging without further work");
                return Ok(());
            }
        }

        // Step 3: transition to processing (best-effort).
        if let Err(e) = self.report_store.update_status(request.report_id, ReportStatus::Processing, None, None, None).await {
            tracing::warn!(error = %e, report_id = %request.report_id, "failed to transition report to processing; continuing");
        }

        match self.run_pipeline(&request).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.handle_error_with_update(&request, &err).await;
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, request: &ReportRequest) -> Result<(), ReportError> {
        // Step 4: fetch template.
        let template = self.template_store.get(request.template_id).await?;
        let template_bytes = self.template_store.get_bytes(&template).await?;

        // Step 5: fan out datasource queries.
        let collected = self.collect_query_data(request).await?;

        // Step 6: render template with collected data.
        let rendered = render_template(&template_bytes, &collected);

        // Step 7: optional document conversion.
        let artifact = if requires_conversion(&request.output_format) {
            self.convert_via_pool(rendered).await?
        } else {
            rendered
        };

        // Step 8: persist artifact.
        let key = artifact_key(request.report_id, &request.output_format);
        self.object_store.put(&self.artifact_bucket, &key, artifact).await?;

        // Step 9: mark finished.
        self.report_store
            .update_status(request.report_id, ReportStatus::Finished, None, Some(key), Some(Utc::now()))
            .await?;

        Ok(())
    }

    async fn collect_query_data(&self, request: &ReportRequest) -> Result<HashMap<String, Vec<crate::ports::Row>>, ReportError> {
        let mut results = HashMap::new();
        let mut first_retryable_error: Option<ReportError> = None;
        let mut any_succeeded = false;

        for (ds_name, tables) in &request.data_queries {
            let breaker = self.breakers.get_or_insert(ds_name);
            for (table, fields) in tables {
                let connection = match self.datasources.get(ds_name).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        if first_retryable_error.is_none() {
                            first_retryable_error = Some(e);
                        }
                        continue;
                    }
                };

                let outcome = breaker.call(|| connection.query(table, fields)).await;
                match outcome {
                    Ok(rows) => {
                        any_succeeded = true;
                        results.insert(format!("{ds_name}.{table}"), rows);
                    }
                    Err(crate::circuit_breaker::CircuitBreakerCallError::Open(_)) => {
                        let e = ReportError::unknown_msg(format!("circuit open for datasource '{ds_name}'"));
                        if first_retryable_error.is_none() {
                            first_retryable_error = Some(e);
                        }
                    }
                    Err(crate::circuit_breaker::CircuitBreakerCallError::Inner(e)) => {
                        if !is_retryable(&e) {
                            // Business error from a datasource short-circuits
                            // the whole job.
                            return Err(e);
                        }
                        if first_retryable_error.is_none() {
                            first_retryable_error = Some(e);
                        }
                    }
                }
            }
        }

        if !any_succeeded {
            if let Some(err) = first_retryable_error {
                return Err(err);
            }
        }

        Ok(results)
    }

    async fn convert_via_pool(&self, rendered: Vec<u8>) -> Result<Vec<u8>, ReportError> {
        let pool = self.render_pool.as_ref().ok_or_else(|| ReportError::unknown_msg("rendering pool not configured for this output format"))?;
        let dir = tempfile::tempdir().map_err(|e| ReportError::unknown_msg(format!("failed to create temp dir: {e}")))?;
        let out_path = dir.path().join("artifact.out");
        pool.submit(rendered, out_path.clone()).await.map_err(|e| ReportError::unknown_msg(e.to_string()))?;
        tokio::fs::read(&out_path).await.map_err(|e| ReportError::unknown_msg(format!("failed to read rendered artifact: {e}")))
    }

    /// On any error after step 3, update the report to `error` with
    /// metadata; status-update failure is logged, never surfaces in place
    /// of the original error.
    async fn handle_error_with_update(&self, request: &ReportRequest, err: &ReportError) {
        let metadata = ErrorMetadata {
            error_code: err.code().map(|s| s.to_string()),
            error_message: truncate_to_len(&err.to_string(), self.reason_max_len),
            failed_at: Utc::now(),
            attempts: 1,
        };
        if let Err(update_err) = self
            .report_store
            .update_status(request.report_id, ReportStatus::Error, Some(metadata), None, Some(Utc::now()))
            .await
        {
            tracing::error!(error = %update_err, report_id = %request.report_id, original_error = %err, "failed to persist error status; surfacing original error");
        }
    }
}

/// Pure rendering step: merges the template source with collected query
/// data. The template DSL itself is out of scope; this performs
/// only the mechanical substitution of already-resolved field values.
fn render_template(template_bytes: &[u8], data: &HashMap<String, Vec<crate::ports::Row>>) -> Vec<u8> {
    let mut out = template_bytes.to_vec();
    out.push(b'\n');
    if let Ok(json) = serde_json::to_vec(data) {
        out.extend(json);
    }
    out
}
