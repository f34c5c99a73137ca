//! End-to-end scenarios for datasource healing and rendering
//! pool timeout handling, each driven through the orchestrator
//! rather than the bare primitive.

use async_trait::async_trait;
use reporter::datasource::{ConnectMode, DatasourceConfig, DatasourceKind, DatasourceRegistry, DatasourceStatus, HealthChecker};
use reporter::orchestrator::model::{ErrorMetadata, Report, ReportRequest, ReportStatus, Template};
use reporter::orchestrator::ReportOrchestrator;
use reporter::ports::{DatasourceConnection, ObjectStore, ReportStore, Row, SchemaInfo, TemplateStore};
use reporter::render::RenderPool;
use reporter::{CircuitBreakerRegistry, ReconnectBackoff, ReportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

struct RecoveringConnection {
    healthy: Arc<AtomicBool>,
}
#[async_trait]
impl DatasourceConnection for RecoveringConnection {
    async fn connect(&self) -> Result<(), ReportError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReportError::unknown_msg("connection down"))
        }
    }
    async fn probe(&self) -> Result<(), ReportError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReportError::unknown_msg("connection down"))
        }
    }
    async fn query(&self, _table: &str, _fields: &[String]) -> Result<Vec<Row>, ReportError> {
        Ok(vec![HashMap::from([("x".to_string(), Value::from(1))])])
    }
    async fn discover_schema(&self) -> Result<SchemaInfo, ReportError> {
        Ok(SchemaInfo::default())
    }
}

fn datasource_config(name: &str) -> DatasourceConfig {
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
async fn unavailable_datasource_heals_and_subsequent_request_succeeds() {
    let healthy = Arc::new(AtomicBool::new(false));
    let healthy2 = healthy.clone();
    let registry = Arc::new(DatasourceRegistry::new(
        Arc::new(CircuitBreakerRegistry::default()),
        ReconnectBackoff { initial: Duration::from_millis(1), max: Duration::from_millis(2), jitter_max: Duration::from_millis(1), factor: 2.0 },
        1,
        move |_cfg| Arc::new(RecoveringConnection { healthy: healthy2.clone() }) as Arc<dyn DatasourceConnection>,
    ));
    registry.register(vec![datasource_config("ds1")]).await;

    let checker = HealthChecker::new(registry.clone(), Duration::from_secs(30), Duration::from_millis(0), Duration::from_secs(1));
    checker.run_once().await;
    assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Unavailable));

    healthy.store(true, Ordering::SeqCst);
    checker.run_once().await;
    assert_eq!(registry.snapshot_status("ds1").await, Some(DatasourceStatus::Available));

    // A direct `get` after healing returns a usable connection.
    assert!(registry.get("ds1").await.is_ok());
}

struct FakeTemplateStore;
#[async_trait]
impl TemplateStore for FakeTemplateStore {
    async fn get(&self, id: Uuid) -> Result<Template, ReportError> {
        let now = chrono::Utc::now();
        Ok(Template { id, output_format: "pdf".into(), description: "d".into(), filename: "t.html".into(), mapped_fields: HashMap::new(), created_at: now, updated_at: now, deleted_at: None })
    }
    async fn get_bytes(&self, _template: &Template) -> Result<Vec<u8>, ReportError> {
        Ok(b"<html></html>".to_vec())
    }
}

#[derive(Default)]
struct FakeReportStore {
    reports: Mutex<HashMap<Uuid, Report>>,
}
#[async_trait]
impl ReportStore for FakeReportStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Report>, ReportError> {
        Ok(self.reports.lock().unwrap().get(&id).cloned())
    }
    async fn update_status(
        &self,
        id: Uuid,
        new_status: ReportStatus,
        metadata: Option<ErrorMetadata>,
        artifact_ref: Option<String>,
        _finished_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), ReportError> {
        let mut reports = self.reports.lock().unwrap();
        let entry = reports.entry(id).or_insert_with(|| Report::new_pending(id, chrono::Utc::now()));
        if entry.status.is_terminal() {
            return Ok(());
        }
        entry.status = new_status;
        entry.error_metadata = metadata;
        entry.artifact_ref = artifact_ref;
        Ok(())
    }
    async fn ensure_indexes(&self) -> Result<(), ReportError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeObjectStore;
#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> Result<(), ReportError> {
        Ok(())
    }
}

struct HangingBackend;
#[async_trait]
impl reporter::ports::RenderBackend for HangingBackend {
    async fn render(&self, _input: &[u8]) -> Result<Vec<u8>, ReportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![])
    }
}

#[tokio::test]
async fn pdf_output_surfaces_a_timeout_error_from_a_hanging_rendering_backend() {
    let report_store = Arc::new(FakeReportStore::default());
    let render_pool = Arc::new(RenderPool::start(1, Duration::from_millis(20), 0, || HangingBackend));
    let orchestrator = ReportOrchestrator {
        template_store: Arc::new(FakeTemplateStore),
        report_store: report_store.clone(),
        object_store: Arc::new(FakeObjectStore),
        datasources: Arc::new(DatasourceRegistry::new(Arc::new(CircuitBreakerRegistry::default()), ReconnectBackoff::default(), 1, |_cfg| {
            panic!("no datasource expected for this report")
        })),
        breakers: Arc::new(CircuitBreakerRegistry::default()),
        render_pool: Some(render_pool.clone()),
        reason_max_len: 256,
        artifact_bucket: "reports".into(),
    };

    let report_id = Uuid::new_v4();
    let req = ReportRequest { template_id: Uuid::nil(), report_id, output_format: "pdf".into(), data_queries: HashMap::new(), params: Value::Null };
    let body = serde_json::to_vec(&req).unwrap();

    let result = orchestrator.handle("R-timeout", &body).await;
    assert!(result.is_err());

    let report = report_store.find_by_id(report_id).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Error);
    assert!(report.error_metadata.is_some());

    render_pool.close().await;
}
