//! Minimal retry-engine example: a handler failure that recovers within
//! the retry budget, then one that doesn't.
use reporter::broker::{DeliveryEnvelope, RetryAction, RetryEngine};
use reporter::{InstantSleeper, ReconnectBackoff, ReportError};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let engine = RetryEngine::new(3, ReconnectBackoff::default(), 256, Arc::new(InstantSleeper));

    let envelope = DeliveryEnvelope { request_id: "demo-1".into(), retry_count: 0, failure_reason: None, tenant_id: None, extra: Default::default() };
    let decision = engine.decide(&envelope, &ReportError::unknown_msg("datasource timed out")).await;
    println!("first failure -> {:?} (retry_count now {:?})", decision.action, decision.new_headers.as_ref().map(|h| h.retry_count));
    assert_eq!(decision.action, RetryAction::RepublishWithBackoff);

    let exhausted = DeliveryEnvelope { retry_count: 3, ..envelope.clone() };
    let decision = engine.decide(&exhausted, &ReportError::unknown_msg("still timing out")).await;
    println!("after {} retries -> {:?}", exhausted.retry_count, decision.action);
    assert_eq!(decision.action, RetryAction::Dlq);

    let business = engine.decide(&envelope, &ReportError::validation("TPL-0004", "unknown template id")).await;
    println!("business error -> {:?} (no retry attempted)", business.action);
    assert_eq!(business.action, RetryAction::Dlq);
}
