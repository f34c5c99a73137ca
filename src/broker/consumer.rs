//! Multi-worker broker consumer: setup and worker loop.

use super::retry::{RetryAction, RetryEngine};
use crate::error::ReportError;
use crate::ports::{Delivery, MessageBroker};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A per-message handler invoked by the consumer. Returns `Ok(())` on
/// success (ack) or `Err(ReportError)` for the retry engine to classify.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ReportError>;
}

/// Spawns `num_workers` tasks per queue over the broker's delivery
/// stream, each running the same worker loop.
pub struct Consumer {
    broker: Arc<dyn MessageBroker>,
    retry_engine: Arc<RetryEngine>,
    cancellation: CancellationToken,
}

impl Consumer {
    pub fn new(broker: Arc<dyn MessageBroker>, retry_engine: Arc<RetryEngine>, cancellation: CancellationToken) -> Self {
        Self { broker, retry_engine, cancellation }
    }

    /// Connect to `queue` with the given prefetch and spawn `num_workers`
    /// worker tasks over the resulting stream. Returns the join handles
    /// so the caller (`Service`) can await them at shutdown.
    pub async fn spawn_for_queue(
        &self,
        queue: &str,
        prefetch: u16,
        num_workers: usize,
        handler: Arc<dyn Handler>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, ReportError> {
        let stream = self.broker.consume(queue, prefetch).await?;
        // Multiple workers draining one stream: guard with a mutex rather
        // than splitting, since `BoxStream` isn't required to be `Clone`.
        let stream = Arc::new(Mutex::new(stream));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let stream = stream.clone();
            let broker = self.broker.clone();
            let retry_engine = self.retry_engine.clone();
            let handler = handler.clone();
            let cancellation = self.cancellation.child_token();
            let queue = queue.to_string();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, stream, broker, retry_engine, handler, cancellation).await;
            }));
        }
        Ok(handles)
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: String,
    stream: Arc<Mutex<futures::stream::BoxStream<'static, Delivery>>>,
    broker: Arc<dyn MessageBroker>,
    retry_engine: Arc<RetryEngine>,
    handler: Arc<dyn Handler>,
    cancellation: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::info!(worker_id, queue, "worker stopping on cancellation");
                return;
            }
            next = async {
                let mut guard = stream.lock().await;
                guard.next().await
            } => next,
        };

        let Some(delivery) = delivery else {
            tracing::info!(worker_id, queue, "delivery stream closed");
            return;
        };

        process_one(&delivery, &broker, &retry_engine, &handler).await;
    }
}

#[tracing::instrument(skip_all, fields(request_id = %delivery.envelope.request_id))]
async fn process_one(delivery: &Delivery, broker: &Arc<dyn MessageBroker>, retry_engine: &Arc<RetryEngine>, handler: &Arc<dyn Handler>) {
    if delivery.envelope.request_id.is_empty() {
        tracing::warn!("delivery missing request_id; this should have been generated upstream");
    }

    match handler.handle(delivery).await {
        Ok(()) => {
            if let Err(e) = broker.ack(delivery.tag).await {
                tracing::error!(error = %e, "failed to ack delivery");
            }
        }
        Err(err) => {
            let decision = retry_engine.decide(&delivery.envelope, &err).await;
            match decision.action {
                RetryAction::Ack => {
                    let _ = broker.ack(delivery.tag).await;
                }
                RetryAction::Dlq => {
                    if let Err(e) = broker.nack_no_requeue(delivery.tag).await {
                        tracing::error!(error = %e, "failed to nack delivery to DLQ");
                    }
                }
                RetryAction::RepublishWithBackoff => {
                    let headers = decision.new_headers.expect("republish decision always carries new headers");
                    if let Err(e) = broker.republish(delivery, headers).await {
                        tracing::error!(error = %e, "failed to republish delivery");
                    }
                    if let Err(e) = broker.nack_no_requeue(delivery.tag).await {
                        tracing::error!(error = %e, "failed to nack original delivery after republish");
                    }
                }
            }
        }
    }
}

/// Generate a time-ordered request id for deliveries that arrive without
/// one.
pub fn generate_request_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeliveryEnvelope;
    use crate::sleeper::InstantSleeper;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBroker {
        acked: Arc<std::sync::Mutex<Vec<u64>>>,
        nacked: Arc<std::sync::Mutex<Vec<u64>>>,
        republished: Arc<std::sync::Mutex<Vec<DeliveryEnvelope>>>,
        deliveries: std::sync::Mutex<Option<Vec<Delivery>>>,
    }

    #[async_trait::async_trait]
    impl MessageBroker for FakeBroker {
        async fn consume(&self, _queue: &str, _prefetch: u16) -> Result<futures::stream::BoxStream<'static, Delivery>, ReportError> {
            let deliveries = self.deliveries.lock().unwrap().take().unwrap_or_default();
            Ok(stream::iter(deliveries).boxed())
        }

        async fn ack(&self, tag: u64) -> Result<(), ReportError> {
            self.acked.lock().unwrap().push(tag);
            Ok(())
        }

        async fn nack_no_requeue(&self, tag: u64) -> Result<(), ReportError> {
            self.nacked.lock().unwrap().push(tag);
            Ok(())
        }

        async fn republish(&self, _original: &Delivery, new_headers: DeliveryEnvelope) -> Result<(), ReportError> {
            self.republished.lock().unwrap().push(new_headers);
            Ok(())
        }
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl Handler for AlwaysFails {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), ReportError> {
            Err(ReportError::unknown_msg("transient"))
        }
    }

    struct FailsNTimes {
        remaining: AtomicUsize,
    }
    #[async_trait::async_trait]
    impl Handler for FailsNTimes {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), ReportError> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                Err(ReportError::unknown_msg("transient"))
            } else {
                Ok(())
            }
        }
    }

    fn delivery(retry_count: u32, tag: u64) -> Delivery {
        Delivery {
            envelope: DeliveryEnvelope { request_id: "R1".into(), retry_count, failure_reason: None, tenant_id: None, extra: Default::default() },
            body: vec![],
            routing_key: "reports".into(),
            exchange: "".into(),
            content_type: Some("application/json".into()),
            tag,
        }
    }

    #[tokio::test]
    async fn non_retryable_error_nacks_without_republish() {
        let broker = Arc::new(FakeBroker {
            acked: Default::default(),
            nacked: Default::default(),
            republished: Default::default(),
            deliveries: std::sync::Mutex::new(Some(vec![delivery(0, 1)])),
        });
        let retry_engine = Arc::new(RetryEngine::new(5, crate::ReconnectBackoff::default(), 256, Arc::new(InstantSleeper)));
        struct AlwaysBusiness;
        #[async_trait::async_trait]
        impl Handler for AlwaysBusiness {
            async fn handle(&self, _d: &Delivery) -> Result<(), ReportError> {
                Err(ReportError::validation("TPL-0001", "bad"))
            }
        }

        process_one(&delivery(0, 1), &(broker.clone() as Arc<dyn MessageBroker>), &retry_engine, &(Arc::new(AlwaysBusiness) as Arc<dyn Handler>)).await;

        assert_eq!(*broker.nacked.lock().unwrap(), vec![1]);
        assert!(broker.republished.lock().unwrap().is_empty());
        assert!(broker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retryable_error_republishes_then_nacks_original() {
        let broker = Arc::new(FakeBroker {
            acked: Default::default(),
            nacked: Default::default(),
            republished: Default::default(),
            deliveries: std::sync::Mutex::new(Some(vec![])),
        });
        let retry_engine = Arc::new(RetryEngine::new(5, crate::ReconnectBackoff::default(), 256, Arc::new(InstantSleeper)));
        let handler: Arc<dyn Handler> = Arc::new(AlwaysFails);

        process_one(&delivery(0, 7), &(broker.clone() as Arc<dyn MessageBroker>), &retry_engine, &handler).await;

        assert_eq!(broker.republished.lock().unwrap().len(), 1);
        assert_eq!(broker.republished.lock().unwrap()[0].retry_count, 1);
        assert_eq!(*broker.nacked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let broker = Arc::new(FakeBroker {
            acked: Default::default(),
            nacked: Default::default(),
            republished: Default::default(),
            deliveries: std::sync::Mutex::new(Some(vec![])),
        });
        let retry_engine = Arc::new(RetryEngine::new(5, crate::ReconnectBackoff::default(), 256, Arc::new(InstantSleeper)));
        let handler: Arc<dyn Handler> = Arc::new(FailsNTimes { remaining: AtomicUsize::new(1) });

        process_one(&delivery(0, 3), &(broker.clone() as Arc<dyn MessageBroker>), &retry_engine, &handler).await;

        assert_eq!(*broker.acked.lock().unwrap(), vec![3]);
        assert!(broker.nacked.lock().unwrap().is_empty());
    }
}
