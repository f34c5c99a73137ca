//! AMQP adapter implementing [`reporter::ports::MessageBroker`] over
//! [`lapin`]. One [`AmqpBroker`] owns one [`lapin::Channel`]; consumers
//! created from it share that channel for ack/nack/republish, matching
//! "the broker channel is not shared across workers for
//! publishes" by handing each consumer its own channel.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use reporter::broker::DeliveryEnvelope;
use reporter::ports::{Delivery, MessageBroker};
use reporter::{HeaderValue, ReportError};
use std::collections::HashMap;

/// Reserved header names the retry engine manages directly; every other
/// header on a delivery is preserved verbatim in [`DeliveryEnvelope::extra`].
const RESERVED_HEADERS: &[&str] = &["request_id", "retry_count", "failure_reason", "tenant_id"];

pub struct AmqpBroker {
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self, ReportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(ReportError::unknown)?;
        let channel = connection.create_channel().await.map_err(ReportError::unknown)?;
        Ok(Self { channel })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

fn envelope_from_fields(fields: &FieldTable) -> DeliveryEnvelope {
    let mut envelope = DeliveryEnvelope::default();
    for (key, value) in fields.inner() {
        let name = key.as_str();
        let parsed = header_value_from_amqp(value);
        match name {
            "request_id" => envelope.request_id = parsed.to_string(),
            "retry_count" => envelope.retry_count = parsed.as_retry_count(),
            "failure_reason" => {
                if let HeaderValue::Str(s) = parsed {
                    envelope.failure_reason = Some(s);
                }
            }
            "tenant_id" => {
                if let HeaderValue::Str(s) = parsed {
                    envelope.tenant_id = Some(s);
                }
            }
            other => {
                envelope.extra.insert(other.to_string(), parsed);
            }
        }
    }
    envelope
}

fn header_value_from_amqp(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::ShortShort(n) => HeaderValue::Int(*n as i32),
        AMQPValue::ShortInt(n) => HeaderValue::Int(*n as i32),
        AMQPValue::LongInt(n) => HeaderValue::Int(*n),
        AMQPValue::LongLongInt(n) => HeaderValue::Long(*n),
        AMQPValue::Float(f) => HeaderValue::Float(*f as f64),
        AMQPValue::Double(f) => HeaderValue::Float(*f),
        AMQPValue::LongString(s) => HeaderValue::Str(s.to_string()),
        AMQPValue::ShortString(s) => HeaderValue::Str(s.to_string()),
        _ => HeaderValue::Other,
    }
}

fn fields_from_envelope(envelope: &DeliveryEnvelope) -> FieldTable {
    let mut fields = FieldTable::default();
    fields.insert(
        "request_id".into(),
        AMQPValue::LongString(LongString::from(envelope.request_id.as_str())),
    );
    fields.insert("retry_count".into(), AMQPValue::LongInt(envelope.retry_count as i32));
    if let Some(reason) = &envelope.failure_reason {
        fields.insert("failure_reason".into(), AMQPValue::LongString(LongString::from(reason.as_str())));
    }
    if let Some(tenant) = &envelope.tenant_id {
        fields.insert("tenant_id".into(), AMQPValue::LongString(LongString::from(tenant.as_str())));
    }
    for (key, value) in &envelope.extra {
        if RESERVED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        let amqp_value = match value {
            HeaderValue::Int(n) => AMQPValue::LongInt(*n),
            HeaderValue::Long(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Other => continue,
        };
        fields.insert(key.as_str().into(), amqp_value);
    }
    fields
}

fn delivery_from_lapin(delivery: LapinDelivery) -> Delivery {
    let headers = delivery.properties.headers().clone().unwrap_or_default();
    let envelope = envelope_from_fields(&headers);
    let routing_key = delivery.routing_key.to_string();
    let exchange = delivery.exchange.to_string();
    let content_type = delivery.properties.content_type().as_ref().map(|s| s.to_string());
    Delivery {
        envelope,
        body: delivery.data.clone(),
        routing_key,
        exchange,
        content_type,
        tag: delivery.delivery_tag,
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<BoxStream<'static, Delivery>, ReportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(ReportError::unknown)?;

        let consumer = self
            .channel
            .basic_consume(queue, "reporter", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(ReportError::unknown)?;

        let stream = consumer.filter_map(|result| async move {
            match result {
                Ok(delivery) => Some(delivery_from_lapin(delivery)),
                Err(err) => {
                    tracing::error!(error = %err, "amqp delivery stream error");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, tag: u64) -> Result<(), ReportError> {
        self.channel.basic_ack(tag, BasicAckOptions::default()).await.map_err(ReportError::unknown)
    }

    async fn nack_no_requeue(&self, tag: u64) -> Result<(), ReportError> {
        self.channel
            .basic_nack(tag, BasicNackOptions { multiple: false, requeue: false })
            .await
            .map_err(ReportError::unknown)
    }

    async fn republish(&self, original: &Delivery, new_headers: DeliveryEnvelope) -> Result<(), ReportError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent, matches the original delivery
            .with_headers(fields_from_envelope(&new_headers));
        if let Some(content_type) = &original.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }

        self.channel
            .basic_publish(
                &original.exchange,
                &original.routing_key,
                BasicPublishOptions::default(),
                &original.body,
                properties,
            )
            .await
            .map_err(ReportError::unknown)?
            .await
            .map_err(ReportError::unknown)?;
        Ok(())
    }
}
