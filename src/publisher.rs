//! Declares exchanges, publishes with confirms, and supports delayed
//! delivery via a per-delay TTL queue.
//!
//! Exchange-declare-then-publish with `BasicProperties` construction,
//! `confirm_select` plus an awaited confirm for the publish-confirm wait.
//! Delay queues are declared with `queue_declare` and TTL/DLX arguments in
//! a `FieldTable`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::envelope::MessageEnvelope;
use crate::error::PublishError;
use crate::middleware::{compose, handler_fn, ComposedHandler, Context, Middleware};

/// Maximum accepted delay: 24h in milliseconds.
pub const MAX_DELAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<String>,
    pub exchange_kind: Option<ExchangeKind>,
    pub routing_key: Option<String>,
    pub persistent: bool,
    pub metadata: Option<Value>,
    pub delay: Option<Duration>,
    /// Absolute epoch-millis this message should become visible at.
    /// A value in the past falls back to immediate publish.
    pub scheduled_at: Option<i64>,
}

#[derive(Clone)]
struct DelaySpec {
    delay_ms: u64,
}

/// Publishes pub/sub messages against topic/fanout/direct exchanges.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    default_exchange: String,
    default_exchange_kind: ExchangeKind,
    channel: Arc<Mutex<Option<Channel>>>,
    asserted_exchanges: Arc<Mutex<HashSet<String>>>,
    global_middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, default_exchange: impl Into<String>) -> Self {
        Self {
            connection,
            default_exchange: default_exchange.into(),
            default_exchange_kind: ExchangeKind::Topic,
            channel: Arc::new(Mutex::new(None)),
            asserted_exchanges: Arc::new(Mutex::new(HashSet::new())),
            global_middlewares: Mutex::new(Vec::new()),
        }
    }

    /// Prepends a global middleware applied to every subsequent `publish`.
    pub async fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        self.global_middlewares.lock().await.push(mw);
    }

    pub async fn publish(
        &self,
        event_name: &str,
        data: Value,
        middlewares: &[Arc<dyn Middleware>],
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        if event_name.is_empty() {
            return Err(PublishError::Validation("eventName must not be empty".to_string()));
        }

        let delay = self.resolve_delay(&options)?;

        let mut envelope = MessageEnvelope::new(event_name, data);
        if let Some(delay) = &delay {
            envelope = envelope.with_metadata(serde_json::json!({
                "delayedUntil": now_millis() + delay.delay_ms as i64,
                "originalDelay": delay.delay_ms,
            }));
        } else if let Some(metadata) = options.metadata.clone() {
            envelope = envelope.with_metadata(metadata);
        }
        let envelope_value = serde_json::to_value(&envelope).expect("envelope always serializes");

        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.default_exchange.clone());
        let exchange_kind = options.exchange_kind.clone().unwrap_or_else(|| self.default_exchange_kind.clone());
        let routing_key = options.routing_key.clone().unwrap_or_else(|| event_name.to_string());

        let mut chain = self.global_middlewares.lock().await.clone();
        chain.extend_from_slice(middlewares);

        let terminal = self.terminal_handler(exchange, exchange_kind, routing_key, options.persistent, delay);
        let composed = compose(&chain, terminal);

        let ctx = Context {
            event_name: Some(event_name.to_string()),
            command: None,
            message_id: None,
            metadata: options.metadata,
        };

        composed(envelope_value, ctx)
            .await
            .map(|_| ())
            .map_err(|e| PublishError::PublishFailed(e.message))
    }

    /// Fans out the same event to multiple exchanges. Fails with
    /// *Validation* on an empty exchange list; each publish is independent
    /// (atomicity is per-exchange only).
    pub async fn publish_to_many(
        &self,
        exchanges: &[String],
        event_name: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        if exchanges.is_empty() {
            return Err(PublishError::Validation("exchange list must not be empty".to_string()));
        }
        for exchange in exchanges {
            let mut per_exchange = options.clone();
            per_exchange.exchange = Some(exchange.clone());
            self.publish(event_name, data.clone(), &[], per_exchange).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.asserted_exchanges.lock().await.clear();
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close(0, "publisher closed").await;
        }
    }

    fn resolve_delay(&self, options: &PublishOptions) -> Result<Option<DelaySpec>, PublishError> {
        if let Some(scheduled_at) = options.scheduled_at {
            let now = now_millis();
            if scheduled_at <= now {
                return Ok(None);
            }
            let delay_ms = (scheduled_at - now) as u64;
            return self.validate_delay(delay_ms).map(Some);
        }
        if let Some(delay) = options.delay {
            if delay.is_zero() {
                return Ok(None);
            }
            return self.validate_delay(delay.as_millis() as u64).map(Some);
        }
        Ok(None)
    }

    fn validate_delay(&self, delay_ms: u64) -> Result<DelaySpec, PublishError> {
        if delay_ms > MAX_DELAY_MS {
            return Err(PublishError::Validation(format!(
                "delay {delay_ms}ms exceeds the {MAX_DELAY_MS}ms maximum"
            )));
        }
        Ok(DelaySpec { delay_ms })
    }

    fn terminal_handler(
        &self,
        exchange: String,
        exchange_kind: ExchangeKind,
        routing_key: String,
        persistent: bool,
        delay: Option<DelaySpec>,
    ) -> ComposedHandler {
        let connection = Arc::clone(&self.connection);
        let channel = Arc::clone(&self.channel);
        let asserted = Arc::clone(&self.asserted_exchanges);

        handler_fn(move |message: Value, _ctx: Context| {
            let connection = Arc::clone(&connection);
            let channel = Arc::clone(&channel);
            let asserted = Arc::clone(&asserted);
            let exchange = exchange.clone();
            let exchange_kind = exchange_kind.clone();
            let routing_key = routing_key.clone();
            let delay = delay.clone();
            async move {
                let (ch, is_new) = get_or_open_channel(&connection, &channel)
                    .await
                    .map_err(|e| crate::error::HandlerError::transient(e.to_string()))?;
                if is_new {
                    asserted.lock().await.clear();
                }

                let body = serde_json::to_vec(&message)
                    .map_err(|e| crate::error::HandlerError::permanent(e.to_string()))?;

                let (publish_exchange, publish_routing_key) = if let Some(delay) = delay {
                    let queue_name = format!("hermes.delay.{}.{}", delay.delay_ms, Uuid::new_v4());
                    declare_delay_queue(&ch, &queue_name, delay.delay_ms, &exchange, &routing_key)
                        .await
                        .map_err(|e| crate::error::HandlerError::transient(e.to_string()))?;
                    (String::new(), queue_name)
                } else {
                    assert_exchange(&ch, &asserted, &exchange, exchange_kind)
                        .await
                        .map_err(|e| crate::error::HandlerError::transient(e.to_string()))?;
                    (exchange.clone(), routing_key.clone())
                };

                let mut props = BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_timestamp((now_millis() / 1000) as u64);
                if persistent {
                    props = props.with_delivery_mode(2);
                }

                let confirm = ch
                    .basic_publish(
                        &publish_exchange,
                        &publish_routing_key,
                        BasicPublishOptions::default(),
                        &body,
                        props,
                    )
                    .await
                    .map_err(|e| crate::error::HandlerError::transient(e.to_string()))?;
                confirm
                    .await
                    .map_err(|e| crate::error::HandlerError::transient(e.to_string()))?;

                Ok(message)
            }
        })
    }
}

/// Returns the cached channel if still connected, else opens and confirm-
/// selects a new one. The bool reports whether a new channel was opened,
/// so callers can drop any state that was memoized per the old channel
/// (e.g. which exchanges have already been asserted on it).
async fn get_or_open_channel(
    connection: &ConnectionManager,
    channel: &Mutex<Option<Channel>>,
) -> Result<(Channel, bool), crate::error::ChannelError> {
    let mut guard = channel.lock().await;
    if let Some(ch) = guard.as_ref() {
        if ch.status().connected() {
            return Ok((ch.clone(), false));
        }
    }
    let new_channel = connection.create_channel().await?;
    new_channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| crate::error::ChannelError::OpenFailed(e.to_string()))?;
    *guard = Some(new_channel.clone());
    Ok((new_channel, true))
}

async fn assert_exchange(
    channel: &Channel,
    asserted: &Mutex<HashSet<String>>,
    exchange: &str,
    kind: ExchangeKind,
) -> Result<(), PublishError> {
    if exchange.is_empty() {
        return Ok(());
    }
    let mut guard = asserted.lock().await;
    if guard.contains(exchange) {
        return Ok(());
    }
    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| PublishError::ExchangeAssertion(e.to_string()))?;
    guard.insert(exchange.to_string());
    Ok(())
}

/// Declares `hermes.delay.{delayMs}.{uuid}` with `x-message-ttl`,
/// `x-dead-letter-exchange`, `x-dead-letter-routing-key`; non-durable,
/// auto-delete.
async fn declare_delay_queue(
    channel: &Channel,
    queue_name: &str,
    delay_ms: u64,
    target_exchange: &str,
    target_routing_key: &str,
) -> Result<(), PublishError> {
    debug!(queue = queue_name, delay_ms, "declaring delay queue");
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongUInt(delay_ms as u32));
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(target_exchange.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(target_routing_key.into()),
    );
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: false,
                auto_delete: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map_err(|e| PublishError::ExchangeAssertion(e.to_string()))?;
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher_stub() -> (Arc<ConnectionManager>, String) {
        let config = crate::config::BrokerConfig::default();
        (Arc::new(ConnectionManager::new(config)), "events".to_string())
    }

    #[tokio::test]
    async fn delay_at_max_boundary_is_accepted() {
        let (conn, exchange) = publisher_stub();
        let publisher = Publisher::new(conn, exchange);
        let options = PublishOptions {
            delay: Some(Duration::from_millis(MAX_DELAY_MS)),
            ..Default::default()
        };
        assert!(publisher.resolve_delay(&options).unwrap().is_some());
    }

    #[tokio::test]
    async fn delay_past_max_boundary_is_rejected() {
        let (conn, exchange) = publisher_stub();
        let publisher = Publisher::new(conn, exchange);
        let options = PublishOptions {
            delay: Some(Duration::from_millis(MAX_DELAY_MS + 1)),
            ..Default::default()
        };
        assert!(matches!(
            publisher.resolve_delay(&options),
            Err(PublishError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn scheduled_at_in_past_is_immediate() {
        let (conn, exchange) = publisher_stub();
        let publisher = Publisher::new(conn, exchange);
        let options = PublishOptions {
            scheduled_at: Some(now_millis() - 5_000),
            ..Default::default()
        };
        assert!(publisher.resolve_delay(&options).unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_event_name_is_validation_error() {
        let (conn, exchange) = publisher_stub();
        let publisher = Publisher::new(conn, exchange);
        let err = publisher
            .publish("", serde_json::json!({}), &[], PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
    }
}
