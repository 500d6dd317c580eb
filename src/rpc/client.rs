//! Correlated request/response calls over the broker's direct reply-to
//! pseudo-queue.
//!
//! One consumer on `amq.rabbitmq.direct-reply-to` is shared across every
//! call; replies are demultiplexed by `correlationId` against a pending map
//! of one-shot channels, the same shape as a single temporary queue per
//! call but without the declare/purge round trip that costs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_lite::stream::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{PublishError, RpcError};
use crate::middleware::{compose, ComposedHandler, Context, Middleware};

const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub request_queue: String,
    pub default_timeout: Duration,
    pub sweeper_interval: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            request_queue: "rpc.requests".to_string(),
            default_timeout: Duration::from_secs(10),
            sweeper_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
pub struct SendOptions {
    pub timeout: Option<Duration>,
    pub metadata: Option<Value>,
    pub signal: Option<CancellationToken>,
    pub correlation_id: Option<String>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
}

struct Pending {
    sender: oneshot::Sender<Result<Value, RpcError>>,
    created_at: Instant,
}

pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    options: RpcClientOptions,
    channel: Mutex<Option<Channel>>,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    consume_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcClient {
    pub fn new(connection: Arc<ConnectionManager>, options: RpcClientOptions) -> Arc<Self> {
        Arc::new(Self {
            connection,
            options,
            channel: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            consume_task: Mutex::new(None),
        })
    }

    /// Opens the shared channel, starts the direct reply-to consumer, and
    /// starts the pending-entry sweeper. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), PublishError> {
        if self.channel.lock().await.is_some() {
            return Ok(());
        }
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Channel(e.into()))?;
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO,
                &format!("hermes-rpc-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PublishError::PublishFailed(e.to_string()))?;
        *self.channel.lock().await = Some(channel);

        let this = Arc::clone(self);
        let consume_task = tokio::spawn(async move { this.consume_replies(consumer).await });
        *self.consume_task.lock().await = Some(consume_task);

        let this = Arc::clone(self);
        let sweeper = tokio::spawn(async move { this.sweep_loop().await });
        *self.sweeper.lock().await = Some(sweeper);
        Ok(())
    }

    async fn consume_replies(self: Arc<Self>, mut consumer: lapin::Consumer) {
        loop {
            match consumer.next().await {
                Some(Ok(delivery)) => self.handle_reply(&delivery).await,
                Some(Err(e)) => {
                    warn!(error = %e, "rpc reply consumer error");
                    break;
                }
                None => {
                    debug!("rpc reply consumer cancelled");
                    break;
                }
            }
        }
    }

    /// Looks up the correlation id; if unknown, logs and drops. Otherwise
    /// resolves the pending entry with the decoded result.
    async fn handle_reply(&self, delivery: &lapin::message::Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id().as_ref().map(|c| c.to_string()) else {
            warn!("rpc reply missing correlation id, dropping");
            return;
        };
        let Some(pending) = self.pending.lock().await.remove(&correlation_id) else {
            debug!(correlation_id, "rpc reply for unknown or already-resolved correlation id, dropping");
            return;
        };
        let result = match serde_json::from_slice::<ResponseEnvelope>(&delivery.data) {
            Ok(envelope) if envelope.success => Ok(envelope.data.unwrap_or(Value::Null)),
            Ok(envelope) => {
                let error = envelope.error.unwrap_or(crate::envelope::ResponseError {
                    code: crate::error::codes::HANDLER_ERROR.to_string(),
                    message: "remote handler failed without error detail".to_string(),
                    details: None,
                    stack: None,
                });
                Err(RpcError::Remote {
                    code: error.code,
                    message: error.message,
                    details: error.details,
                })
            }
            Err(e) => Err(RpcError::Remote {
                code: crate::error::codes::VALIDATION_ERROR.to_string(),
                message: format!("malformed response envelope: {e}"),
                details: None,
            }),
        };
        let _ = pending.sender.send(result);
    }

    /// Evicts pending entries older than `2 * default_timeout`; these are
    /// entries whose own timeout task somehow failed to fire.
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.sweeper_interval);
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let max_age = self.options.default_timeout * 2;
            let mut pending = self.pending.lock().await;
            pending.retain(|id, entry| {
                let stale = entry.created_at.elapsed() > max_age;
                if stale {
                    warn!(correlation_id = %id, "evicting stale rpc correlation entry");
                }
                !stale
            });
        }
    }

    /// Sends `command` with `data`, returning the rehydrated response data
    /// or a classified [`RpcError`].
    pub async fn send(&self, command: &str, data: Value, options: SendOptions) -> Result<Value, RpcError> {
        if command.trim().is_empty() {
            return Err(RpcError::Validation("command must not be empty".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let correlation_id = options.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = options.timeout.unwrap_or(self.options.default_timeout);

        let handler: ComposedHandler = {
            let connection_queue = self.options.request_queue.clone();
            let channel_slot = self.channel.lock().await.clone();
            Arc::new(move |data: Value, ctx: Context| {
                let queue = connection_queue.clone();
                let channel = channel_slot.clone();
                let correlation_id = ctx.message_id.clone().unwrap_or_default();
                Box::pin(async move {
                    let channel = channel.ok_or_else(|| {
                        crate::error::HandlerError::transient("rpc client channel not open")
                    })?;
                    let command = ctx.command.clone().unwrap_or_default();
                    let mut envelope = RequestEnvelope::new(correlation_id.clone(), &command, data);
                    envelope.metadata = ctx.metadata.clone();
                    let body = serde_json::to_vec(&envelope).map_err(crate::error::HandlerError::from)?;
                    let properties = BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_message_id(correlation_id.clone().into())
                        .with_correlation_id(correlation_id.into())
                        .with_reply_to(DIRECT_REPLY_TO.into())
                        .with_timestamp(chrono::Utc::now().timestamp_millis() as u64);
                    channel
                        .basic_publish(
                            "",
                            &queue,
                            BasicPublishOptions::default(),
                            &body,
                            properties,
                        )
                        .await
                        .map_err(crate::error::HandlerError::from)?
                        .await
                        .map_err(crate::error::HandlerError::from)?;
                    Ok(Value::Null)
                })
            })
        };
        let composed = compose(&options.middlewares, handler);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            correlation_id.clone(),
            Pending {
                sender: tx,
                created_at: Instant::now(),
            },
        );

        let ctx = Context {
            event_name: None,
            command: Some(command.to_uppercase()),
            message_id: Some(correlation_id.clone()),
            metadata: options.metadata,
        };
        if let Err(e) = composed(data, ctx).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(RpcError::Publish(PublishError::PublishFailed(e.message)));
        }

        let signal = options.signal.unwrap_or_default();
        tokio::select! {
            result = rx => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RpcError::Aborted),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(RpcError::Timeout)
            }
            _ = signal.cancelled() => {
                self.pending.lock().await.remove(&correlation_id);
                Err(RpcError::Aborted)
            }
        }
    }

    /// Cancels the sweeper and reply consumer, rejects every pending entry
    /// with [`RpcError::Closed`], and closes the channel.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.consume_task.lock().await.take() {
            task.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.sender.send(Err(RpcError::Closed));
        }
        drop(pending);
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close(0, "rpc client closed").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected_before_publish() {
        let err = RpcError::Validation("command must not be empty".to_string());
        assert!(matches!(err, RpcError::Validation(_)));
    }
}
