//! Full stack example: a fake broker delivers one report request, the
//! consumer dispatches it to a `ReportOrchestrator` backed entirely by
//! in-memory fakes, and the result is acked back to the broker.
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reporter::broker::{generate_request_id, Consumer, DeliveryEnvelope, Handler, RetryEngine};
use reporter::datasource::{ConnectMode, DatasourceConfig, DatasourceKind, DatasourceRegistry};
use reporter::orchestrator::model::{ErrorMetadata, Report, ReportRequest, ReportStatus, Template};
use reporter::orchestrator::ReportOrchestrator;
use reporter::ports::{Delivery, DatasourceConnection, MessageBroker, ObjectStore, ReportStore, Row, SchemaInfo, TemplateStore};
use reporter::{CircuitBreakerRegistry, InstantSleeper, ReconnectBackoff, ReportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct DemoBroker {
    acked: Mutex<Vec<u64>>,
    deliveries: Mutex<Option<Vec<Delivery>>>,
}

#[async_trait]
impl MessageBroker for DemoBroker {
    async fn consume(&self, _queue: &str, _prefetch: u16) -> Result<BoxStream<'static, Delivery>, ReportError> {
        let deliveries = self.deliveries.lock().unwrap().take().unwrap_or_default();
        Ok(stream::iter(deliveries).boxed())
    }
    async fn ack(&self, tag: u64) -> Result<(), ReportError> {
        println!("broker: acked delivery {tag}");
        self.acked.lock().unwrap().push(tag);
        Ok(())
    }
    async fn nack_no_requeue(&self, tag: u64) -> Result<(), ReportError> {
        println!("broker: nacked delivery {tag} to DLQ");
        Ok(())
    }
    async fn republish(&self, _original: &Delivery, new_headers: DeliveryEnvelope) -> Result<(), ReportError> {
        println!("broker: republished with retry_count {}", new_headers.retry_count);
        Ok(())
    }
}

struct DemoDatasourceConnection;
#[async_trait]
impl DatasourceConnection for DemoDatasourceConnection {
    async fn connect(&self) -> Result<(), ReportError> {
        Ok(())
    }
    async fn probe(&self) -> Result<(), ReportError> {
        Ok(())
    }
    async fn query(&self, table: &str, fields: &[String]) -> Result<Vec<Row>, ReportError> {
        let _ = (table, fields);
        Ok(vec![HashMap::from([("revenue".to_string(), Value::from(4200))])])
    }
    async fn discover_schema(&self) -> Result<SchemaInfo, ReportError> {
        Ok(SchemaInfo::default())
    }
}

struct DemoTemplateStore;
#[async_trait]
impl TemplateStore for DemoTemplateStore {
    async fn get(&self, id: Uuid) -> Result<Template, ReportError> {
        let now = chrono::Utc::now();
        Ok(Template { id, output_format: "txt".into(), description: "monthly revenue".into(), filename: "revenue.txt".into(), mapped_fields: HashMap::new(), created_at: now, updated_at: now, deleted_at: None })
    }
    async fn get_bytes(&self, _template: &Template) -> Result<Vec<u8>, ReportError> {
        Ok(b"Revenue report:".to_vec())
    }
}

#[derive(Default)]
struct DemoReportStore {
    reports: Mutex<HashMap<Uuid, Report>>,
}
#[async_trait]
impl ReportStore for DemoReportStore {
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
struct DemoObjectStore;
#[async_trait]
impl ObjectStore for DemoObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReportError> {
        println!("object store: wrote {} bytes to {bucket}/{key}", bytes.len());
        Ok(())
    }
}

struct OrchestratorHandler {
    orchestrator: Arc<ReportOrchestrator>,
}
#[async_trait]
impl Handler for OrchestratorHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ReportError> {
        self.orchestrator.handle(&delivery.envelope.request_id, &delivery.body).await
    }
}

#[tokio::main]
async fn main() {
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let datasources = Arc::new(DatasourceRegistry::new(breakers.clone(), ReconnectBackoff::default(), 3, |_cfg| {
        Arc::new(DemoDatasourceConnection) as Arc<dyn DatasourceConnection>
    }));
    datasources
        .register(vec![DatasourceConfig {
            name: "billing".into(),
            config_name: "billing".into(),
            kind: DatasourceKind::Relational,
            host: "billing.internal".into(),
            port: 5432,
            user: "reporter".into(),
            password: "swordfish".into(),
            database: "billing".into(),
            schemas: vec![],
            options: HashMap::new(),
            ssl_mode: None,
            connect_mode: ConnectMode::Eager,
        }])
        .await;
    datasources.connect_eager_all().await;

    let report_store = Arc::new(DemoReportStore::default());
    let orchestrator = Arc::new(ReportOrchestrator {
        template_store: Arc::new(DemoTemplateStore),
        report_store: report_store.clone(),
        object_store: Arc::new(DemoObjectStore),
        datasources,
        breakers,
        render_pool: None,
        reason_max_len: 256,
        artifact_bucket: "demo-reports".into(),
    });

    let report_id = Uuid::new_v4();
    let request = ReportRequest {
        template_id: Uuid::nil(),
        report_id,
        output_format: "txt".into(),
        data_queries: HashMap::from([("billing".to_string(), HashMap::from([("invoices".to_string(), vec!["revenue".to_string()])]))]),
        params: Value::Null,
    };
    let body = serde_json::to_vec(&request).unwrap();

    let broker = Arc::new(DemoBroker {
        acked: Mutex::new(vec![]),
        deliveries: Mutex::new(Some(vec![Delivery {
            envelope: DeliveryEnvelope { request_id: generate_request_id(), retry_count: 0, failure_reason: None, tenant_id: None, extra: Default::default() },
            body,
            routing_key: "reports.generate".into(),
            exchange: "".into(),
            content_type: Some("application/json".into()),
            tag: 1,
        }])),
    });

    let retry_engine = Arc::new(RetryEngine::new(5, ReconnectBackoff::default(), 256, Arc::new(InstantSleeper)));
    let consumer = Consumer::new(broker.clone() as Arc<dyn MessageBroker>, retry_engine, CancellationToken::new());
    let handler: Arc<dyn Handler> = Arc::new(OrchestratorHandler { orchestrator });

    let handles = consumer.spawn_for_queue("reports.generate", 1, 1, handler).await.expect("consume queue");
    for handle in handles {
        handle.await.expect("worker task");
    }

    let report = report_store.find_by_id(report_id).await.unwrap().unwrap();
    println!("final report status: {:?}", report.status);
}
