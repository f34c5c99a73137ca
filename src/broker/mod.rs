//! Broker consumer and retry engine.

mod consumer;
mod retry;

pub use consumer::{generate_request_id, Consumer, Handler};
pub use retry::{RetryAction, RetryEngine};

use std::collections::HashMap;
use std::time::Duration;

/// Broker delivery headers relevant to the retry engine, plus any
/// caller-defined headers preserved verbatim across republish.
#[derive(Debug, Clone, Default)]
pub struct DeliveryEnvelope {
    pub request_id: String,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub tenant_id: Option<String>,
    /// Every other header present on the delivery, preserved byte-for-byte
    /// across republish (e.g. `x-trace-id`, `x-custom-*`).
    pub extra: HashMap<String, crate::headers::HeaderValue>,
}

impl DeliveryEnvelope {
    /// Build the envelope for a republish: same `request_id` and `extra`
    /// headers, `retry_count` incremented by exactly one, `failure_reason`
    /// truncated and set.
    pub fn for_republish(&self, reason: &str, reason_max_len: usize) -> Self {
        Self {
            request_id: self.request_id.clone(),
            retry_count: self.retry_count + 1,
            failure_reason: Some(crate::error::truncate_to_len(reason, reason_max_len)),
            tenant_id: self.tenant_id.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Computed from the handler's error plus the current `retry_count`.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay: Option<Duration>,
    pub new_headers: Option<DeliveryEnvelope>,
}
