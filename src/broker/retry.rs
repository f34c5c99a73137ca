//! Retry engine: the three-way branch applied to every
//! handler failure.

use super::DeliveryEnvelope;
use crate::error::{is_retryable_with, truncate_to_len, ClassifierConfig, ReportError};
use crate::sleeper::Sleeper;
use crate::ReconnectBackoff;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Positively acknowledge the original delivery.
    Ack,
    /// Nack the original delivery without requeue; broker routes to DLQ.
    Dlq,
    /// Republish with updated headers, then nack the original without
    /// requeue.
    RepublishWithBackoff,
}

/// Decides ack/DLQ/republish for a handler failure and carries out the
/// sleep + republish side effects.
pub struct RetryEngine {
    max_retries: u32,
    backoff: ReconnectBackoff,
    reason_max_len: usize,
    classifier: ClassifierConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryEngine {
    pub fn new(max_retries: u32, backoff: ReconnectBackoff, reason_max_len: usize, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { max_retries, backoff, reason_max_len, classifier: ClassifierConfig::default(), sleeper }
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Decide what to do with `envelope` given the handler's `error`,
    /// sleeping for the computed backoff when republishing. Does not talk
    /// to the broker itself: the caller (`Consumer`) performs the actual
    /// ack/nack/republish once it has the decision.
    pub async fn decide(&self, envelope: &DeliveryEnvelope, error: &ReportError) -> super::RetryDecision {
        if !is_retryable_with(error, &self.classifier) {
            return super::RetryDecision { action: RetryAction::Dlq, delay: None, new_headers: None };
        }

        if envelope.retry_count >= self.max_retries {
            tracing::warn!(
                request_id = %envelope.request_id,
                retry_count = envelope.retry_count,
                max_retries = self.max_retries,
                "retries exhausted"
            );
            return super::RetryDecision { action: RetryAction::Dlq, delay: None, new_headers: None };
        }

        let delay = self.backoff.delay(envelope.retry_count);
        self.sleeper.sleep(delay).await;

        let reason = truncate_to_len(&error.to_string(), self.reason_max_len);
        let new_headers = envelope.for_republish(&reason, self.reason_max_len);

        super::RetryDecision { action: RetryAction::RepublishWithBackoff, delay: Some(delay), new_headers: Some(new_headers) }
    }
}
