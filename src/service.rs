//! `Service`: owns the long-lived components of a running worker and tears
//! them down in the reverse of their construction order.

use crate::datasource::DatasourceRegistry;
use crate::ports::{MessageBroker, ReportStore};
use crate::render::RenderPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Construction order is: datasource registry → health checker → broker
/// connection → consumer workers → rendering pool. `shutdown` runs the
/// exact reverse: health checker → consumer workers → rendering pool →
/// broker channel → broker connection → metadata store.
pub struct Service {
    health_cancellation: CancellationToken,
    health_task: Option<JoinHandle<()>>,
    consumer_cancellation: CancellationToken,
    consumer_workers: Vec<JoinHandle<()>>,
    render_pool: Arc<RenderPool>,
    broker: Arc<dyn MessageBroker>,
    datasources: Arc<DatasourceRegistry>,
    report_store: Arc<dyn ReportStore>,
}

impl Service {
    /// Assemble a `Service` from already-started components. Callers are
    /// expected to have already: registered datasources, run
    /// `connect_eager_all`, spawned the health checker loop (handing in its
    /// `JoinHandle` and the `CancellationToken` that stops it), and spawned
    /// consumer workers via `Consumer::spawn_for_queue`.
    pub fn new(
        health_cancellation: CancellationToken,
        health_task: JoinHandle<()>,
        consumer_cancellation: CancellationToken,
        consumer_workers: Vec<JoinHandle<()>>,
        render_pool: Arc<RenderPool>,
        broker: Arc<dyn MessageBroker>,
        datasources: Arc<DatasourceRegistry>,
        report_store: Arc<dyn ReportStore>,
    ) -> Self {
        Self {
            health_cancellation,
            health_task: Some(health_task),
            consumer_cancellation,
            consumer_workers,
            render_pool,
            broker,
            datasources,
            report_store,
        }
    }

    /// Tear down every component in the reverse of construction order.
    /// Each step is best-effort: a failure in one step is logged and does
    /// not prevent later steps from running.
    pub async fn shutdown(mut self) {
        tracing::info!("service shutdown: stopping health checker");
        self.health_cancellation.cancel();
        if let Some(handle) = self.health_task.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "health checker task panicked during shutdown");
            }
        }

        tracing::info!(workers = self.consumer_workers.len(), "service shutdown: stopping consumer workers");
        self.consumer_cancellation.cancel();
        for handle in self.consumer_workers.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "consumer worker task panicked during shutdown");
            }
        }

        tracing::info!("service shutdown: draining rendering pool");
        self.render_pool.close().await;

        tracing::info!("service shutdown: releasing broker channel and connection");
        drop(self.broker);

        tracing::info!("service shutdown: releasing datasource connections and metadata store");
        drop(self.datasources);
        drop(self.report_store);

        tracing::info!("service shutdown complete");
    }
}
