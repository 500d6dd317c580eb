//! Consumes the request queue, dispatches to registered command handlers
//! under the deduplicator, and replies on `replyTo` with the same
//! ack/retry/DLQ discipline as the Subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_lite::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Consumer};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{AckMode, DeduplicatorConfig, ParserConfig, RetryConfig};
use crate::connection::ConnectionManager;
use crate::dedup::{Deduplicator, Lookup};
use crate::envelope::{ResponseEnvelope, ResponseError};
use crate::error::ChannelError;
use crate::middleware::{compose, ComposedHandler, Context, Middleware};
use crate::subscriber::{classify_slow, retry_count_from_properties, with_retry_count, SlowMessageEvent};
use crate::validator::Validator;

type KeyExtractor = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct RpcServerOptions {
    pub request_queue: String,
    pub prefetch: u16,
    /// Whether a handler failure goes through the retry/DLQ state machine
    /// or is always nack-dropped with no retry (§4.8.2). Defaults to
    /// `Auto`.
    pub ack_mode: AckMode,
    pub retry: RetryConfig,
    pub parser: ParserConfig,
    pub dedup: DeduplicatorConfig,
    /// Derives the deduplication key from the request payload, taking
    /// priority over `properties.messageId` (§4.4). `None` falls back to
    /// the message id, then a content hash.
    pub dedup_key_extractor: Option<KeyExtractor>,
    /// Optional schema validator applied to the decoded request `data`
    /// before dispatch. `None` is permissive (§9 open question: response/
    /// request shape validation is opt-in, not a protocol-level guarantee).
    pub request_validator: Option<Arc<dyn Validator>>,
    pub max_reconnect_attempts: u32,
    pub slow_warn_threshold: Option<Duration>,
    pub slow_error_threshold: Option<Duration>,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            request_queue: "rpc.requests".to_string(),
            prefetch: 10,
            ack_mode: AckMode::Auto,
            retry: RetryConfig::default(),
            parser: ParserConfig::default(),
            dedup: DeduplicatorConfig::default(),
            dedup_key_extractor: None,
            request_validator: None,
            max_reconnect_attempts: 10,
            slow_warn_threshold: None,
            slow_error_threshold: None,
        }
    }
}

pub struct StopOptions {
    pub timeout: Duration,
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            force: false,
        }
    }
}

pub struct RpcServer {
    connection: Arc<ConnectionManager>,
    options: RpcServerOptions,
    handlers: Mutex<HashMap<String, ComposedHandler>>,
    global_middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    dedup: Deduplicator,
    channel: Mutex<Option<Channel>>,
    consumer_tag: Mutex<Option<String>>,
    /// §6 DLQ substrate asserted for the request queue, if any; used to
    /// explicitly route `MalformedStrategy::Dlq` requests there.
    dlq_target: Mutex<Option<crate::connection::DlqTarget>>,
    running: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    consumer_count: AtomicUsize,
    reconnect_attempt: AtomicU32,
    consume_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_slow: Mutex<Option<Arc<dyn Fn(SlowMessageEvent) + Send + Sync>>>,
}

impl RpcServer {
    pub fn new(connection: Arc<ConnectionManager>, options: RpcServerOptions) -> Arc<Self> {
        let dedup = Deduplicator::new(options.dedup);
        Arc::new(Self {
            connection,
            options,
            handlers: Mutex::new(HashMap::new()),
            global_middlewares: Mutex::new(Vec::new()),
            dedup,
            channel: Mutex::new(None),
            consumer_tag: Mutex::new(None),
            dlq_target: Mutex::new(None),
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            consumer_count: AtomicUsize::new(0),
            reconnect_attempt: AtomicU32::new(0),
            consume_task: Mutex::new(None),
            on_slow: Mutex::new(None),
        })
    }

    pub async fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        self.global_middlewares.lock().await.push(mw);
    }

    /// Registers a callback fired once a handler's wall-clock duration
    /// crosses `slow_warn_threshold`/`slow_error_threshold` (§4.8.2.6).
    pub async fn on_slow_message(&self, callback: Arc<dyn Fn(SlowMessageEvent) + Send + Sync>) {
        *self.on_slow.lock().await = Some(callback);
    }

    /// Composes `middlewares` with `handler` now, at registration time.
    /// Overwriting an existing command logs a warning.
    pub async fn register_handler(
        &self,
        command: &str,
        middlewares: &[Arc<dyn Middleware>],
        handler: ComposedHandler,
    ) {
        let key = command.to_uppercase();
        let mut chain = self.global_middlewares.lock().await.clone();
        chain.extend_from_slice(middlewares);
        let composed = compose(&chain, handler);
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&key) {
            warn!(command = %key, "overwriting existing rpc handler registration");
        }
        handlers.insert(key, composed);
    }

    pub async fn unregister_handler(&self, command: &str) {
        self.handlers.lock().await.remove(&command.to_uppercase());
    }

    pub fn is_server_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumer_count.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        let consumer = self.open_and_consume().await?;
        self.running.store(true, Ordering::SeqCst);
        self.consumer_count.store(1, Ordering::SeqCst);
        self.reconnect_attempt.store(0, Ordering::SeqCst);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.consume_loop(consumer).await });
        *self.consume_task.lock().await = Some(task);
        Ok(())
    }

    async fn open_and_consume(self: &Arc<Self>) -> Result<Consumer, ChannelError> {
        let channel = self.connection.create_channel().await?;
        let mut declare_args = FieldTable::default();
        let mut dlq_target = None;
        if self.options.retry.dlq.enabled {
            let target = crate::connection::assert_dlq(&channel, &self.options.request_queue, &self.options.retry.dlq)
                .await
                .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
            declare_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(target.exchange.as_str().into()),
            );
            declare_args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(target.routing_key.as_str().into()),
            );
            dlq_target = Some(target);
        }
        channel
            .queue_declare(
                &self.options.request_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                declare_args,
            )
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        *self.dlq_target.lock().await = dlq_target;

        channel
            .basic_qos(self.options.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        let consumer_tag = format!("hermes-rpc-server-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.options.request_queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        *self.channel.lock().await = Some(channel);
        *self.consumer_tag.lock().await = Some(consumer_tag);
        Ok(consumer)
    }

    async fn consume_loop(self: Arc<Self>, mut consumer: Consumer) {
        loop {
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.handle_request(&delivery).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "rpc server delivery error");
                    break;
                }
                None => {
                    debug!("rpc server consumer cancelled by broker");
                    break;
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
        }
        if self.running.load(Ordering::SeqCst) {
            self.recover().await;
        }
    }

    async fn recover(self: Arc<Self>) {
        loop {
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.options.max_reconnect_attempts {
                error!("rpc server exhausted reconnect attempts, giving up");
                self.running.store(false, Ordering::SeqCst);
                self.consumer_count.store(0, Ordering::SeqCst);
                return;
            }
            let delay_secs = 5f64 * 2f64.powi((attempt - 1) as i32);
            let delay = Duration::from_secs_f64(delay_secs.min(60.0));
            warn!(attempt, ?delay, "rpc server reconnecting");
            tokio::time::sleep(delay).await;

            match self.open_and_consume().await {
                Ok(consumer) => {
                    self.consumer_count.store(1, Ordering::SeqCst);
                    self.reconnect_attempt.store(0, Ordering::SeqCst);
                    let this = Arc::clone(&self);
                    let task = tokio::spawn(async move { this.consume_loop(consumer).await });
                    *self.consume_task.lock().await = Some(task);
                    return;
                }
                Err(e) => warn!(error = %e, "rpc server reconnect attempt failed"),
            }
        }
    }

    async fn handle_request(&self, delivery: &lapin::message::Delivery) {
        let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.to_string());
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();

        let parsed = crate::parser::parse(&delivery.data, &self.options.parser);
        let value = match parsed {
            crate::parser::ParseOutcome::Ok(v) => v,
            crate::parser::ParseOutcome::Fail { error, strategy } => {
                warn!(error = %error, "malformed rpc request");
                self.apply_malformed_strategy(delivery, strategy).await;
                return;
            }
        };

        let mut request: crate::envelope::RequestEnvelope = match serde_json::from_value(value.clone()) {
            Ok(req) => req,
            Err(e) => {
                self.reply_error(reply_to.as_deref(), &correlation_id, crate::error::codes::VALIDATION_ERROR, &e.to_string(), None)
                    .await;
                let _ = delivery
                    .nack(BasicNackOptions { requeue: false, multiple: false })
                    .await;
                return;
            }
        };

        if let Some(validator) = &self.options.request_validator {
            match validator.validate(&request.data) {
                Ok(coerced) => request.data = coerced,
                Err(issues) => {
                    let details = serde_json::json!(issues
                        .iter()
                        .map(|i| serde_json::json!({"path": i.path, "message": i.message}))
                        .collect::<Vec<_>>());
                    self.reply_error(
                        reply_to.as_deref(),
                        &correlation_id,
                        crate::error::codes::VALIDATION_ERROR,
                        "request data failed schema validation",
                        Some(details),
                    )
                    .await;
                    let _ = delivery
                        .nack(BasicNackOptions { requeue: false, multiple: false })
                        .await;
                    return;
                }
            }
        }

        let key_extractor: Option<&dyn Fn(&Value) -> Option<String>> =
            self.options.dedup_key_extractor.as_deref();
        let message_id = delivery.properties.message_id().as_ref().map(|s| s.to_string());
        let dedup_key = Deduplicator::derive_key(
            &request.data,
            message_id.as_deref().or(Some(request.id.as_str())),
            &delivery.data,
            key_extractor,
        );
        if let Lookup::Hit(cached) = self.dedup.lookup(&dedup_key).await {
            self.reply_success(reply_to.as_deref(), &correlation_id, cached).await;
            let _ = delivery.ack(BasicAckOptions::default()).await;
            return;
        }

        let command = request.command.to_uppercase();
        let handler = self.handlers.lock().await.get(&command).cloned();

        let ctx = Context {
            event_name: None,
            command: Some(command.clone()),
            message_id: Some(request.id.clone()),
            metadata: request.metadata.clone(),
        };

        let start = Instant::now();
        let result = match handler {
            Some(handler) => handler(request.data.clone(), ctx).await,
            None => Err(crate::error::HandlerError::permanent(format!(
                "no handler registered for command {command}"
            ))),
        };
        self.report_slow(start.elapsed(), command.clone(), Some(request.id.clone())).await;

        match result {
            Ok(data) => {
                self.dedup.store(dedup_key, data.clone()).await;
                self.reply_success(reply_to.as_deref(), &correlation_id, data).await;
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Err(err) => {
                self.reply_error(
                    reply_to.as_deref(),
                    &correlation_id,
                    if err.transient {
                        crate::error::codes::TRANSIENT_ERROR
                    } else {
                        crate::error::codes::HANDLER_ERROR
                    },
                    &err.message,
                    err.details.clone(),
                )
                .await;
                self.nack_with_retry_policy(delivery, err.transient).await;
            }
        }
    }

    async fn report_slow(&self, elapsed: Duration, command: String, message_id: Option<String>) {
        let Some(severity) =
            classify_slow(elapsed, self.options.slow_warn_threshold, self.options.slow_error_threshold)
        else {
            return;
        };
        if let Some(cb) = self.on_slow.lock().await.clone() {
            cb(SlowMessageEvent {
                event_name: None,
                command: Some(command),
                message_id,
                duration: elapsed,
                severity,
            });
        }
    }

    async fn reply_success(&self, reply_to: Option<&str>, correlation_id: &str, data: Value) {
        let Some(reply_to) = reply_to else { return };
        let envelope = ResponseEnvelope::ok(correlation_id, data);
        self.publish_reply(reply_to, correlation_id, &envelope).await;
    }

    async fn reply_error(
        &self,
        reply_to: Option<&str>,
        correlation_id: &str,
        code: &str,
        message: &str,
        details: Option<Value>,
    ) {
        let Some(reply_to) = reply_to else { return };
        let envelope = match details {
            Some(d) => ResponseEnvelope::err_with_details(correlation_id, code, message, d),
            None => ResponseEnvelope::err(correlation_id, code, message),
        };
        self.publish_reply(reply_to, correlation_id, &envelope).await;
    }

    async fn publish_reply(&self, reply_to: &str, correlation_id: &str, envelope: &ResponseEnvelope) {
        let Some(channel) = self.channel.lock().await.clone() else {
            return;
        };
        let Ok(body) = serde_json::to_vec(envelope) else {
            return;
        };
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_correlation_id(correlation_id.into())
            .with_timestamp(chrono::Utc::now().timestamp_millis() as u64);
        if let Err(e) = channel
            .basic_publish("", reply_to, BasicPublishOptions::default(), &body, properties)
            .await
        {
            warn!(error = %e, "failed to publish rpc reply");
        }
    }

    /// `Reject` nack-drops and leaves dead-lettering to whatever DLX the
    /// request queue itself was declared with. `Dlq` instead explicitly
    /// republishes the raw frame to the asserted §6 substrate and acks the
    /// original, independent of the queue's own dead-letter wiring.
    async fn apply_malformed_strategy(
        &self,
        delivery: &lapin::message::Delivery,
        strategy: crate::error::MalformedStrategy,
    ) {
        match strategy {
            crate::error::MalformedStrategy::Ignore => {
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            crate::error::MalformedStrategy::Reject => {
                let _ = delivery
                    .nack(BasicNackOptions { requeue: false, multiple: false })
                    .await;
            }
            crate::error::MalformedStrategy::Dlq => {
                let target = self.dlq_target.lock().await.clone();
                let channel = self.channel.lock().await.clone();
                match (target, channel) {
                    (Some(target), Some(channel)) => {
                        let publish = channel
                            .basic_publish(
                                &target.exchange,
                                &target.routing_key,
                                BasicPublishOptions::default(),
                                &delivery.data,
                                delivery.properties.clone(),
                            )
                            .await;
                        match publish {
                            Ok(confirm) => {
                                if let Err(e) = confirm.await {
                                    warn!(error = %e, "dlq publish for malformed request was not confirmed");
                                }
                                let _ = delivery.ack(BasicAckOptions::default()).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "dlq publish failed, falling back to nack-drop");
                                let _ = delivery
                                    .nack(BasicNackOptions { requeue: false, multiple: false })
                                    .await;
                            }
                        }
                    }
                    _ => {
                        warn!("no dlq substrate asserted for this queue, falling back to nack-drop");
                        let _ = delivery
                            .nack(BasicNackOptions { requeue: false, multiple: false })
                            .await;
                    }
                }
            }
        }
    }

    /// Mirrors [`crate::subscriber::Subscriber`]'s retry discipline: a retry
    /// republishes a copy with `x-retry-count` incremented rather than
    /// relying on a broker-level requeue, since requeue alone can't rewrite
    /// headers on redelivery. `AckMode::Manual` skips all of that and
    /// always nack-drops (§4.8.2).
    async fn nack_with_retry_policy(&self, delivery: &lapin::message::Delivery, transient: bool) {
        if self.options.ack_mode == AckMode::Manual {
            let _ = delivery
                .nack(BasicNackOptions { requeue: false, multiple: false })
                .await;
            return;
        }
        if !transient || !self.options.retry.requeue_transient_errors {
            let _ = delivery
                .nack(BasicNackOptions { requeue: false, multiple: false })
                .await;
            return;
        }
        let attempts = retry_count_from_properties(&delivery.properties);
        if attempts >= self.options.retry.max_retries {
            let _ = delivery
                .nack(BasicNackOptions { requeue: false, multiple: false })
                .await;
            return;
        }
        if self.requeue_with_incremented_retry(delivery, attempts + 1).await.is_err() {
            warn!("retry republish failed, falling back to a plain requeue");
            let _ = delivery
                .nack(BasicNackOptions { requeue: true, multiple: false })
                .await;
            return;
        }
        let _ = delivery
            .nack(BasicNackOptions { requeue: false, multiple: false })
            .await;
    }

    async fn requeue_with_incremented_retry(
        &self,
        delivery: &lapin::message::Delivery,
        next_attempt: u32,
    ) -> Result<(), ()> {
        let channel = self.channel.lock().await.clone().ok_or(())?;
        let queue_name = self.options.request_queue.clone();
        let properties = with_retry_count(delivery.properties.clone(), next_attempt);
        let body = delivery.data.clone();
        let delay = self.options.retry.retry_delay;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let publish = channel
                .basic_publish("", &queue_name, BasicPublishOptions::default(), &body, properties)
                .await;
            match publish {
                Ok(confirm) => {
                    if let Err(e) = confirm.await {
                        warn!(error = %e, "retry republish was not confirmed");
                    }
                }
                Err(e) => warn!(error = %e, "retry republish failed"),
            }
        });
        Ok(())
    }

    /// Cancels the consumer tag, then polls in-flight size every 100ms
    /// until zero or `timeout` elapses (unless `force`), then closes the
    /// channel and clears the deduplicator.
    pub async fn stop(&self, options: StopOptions) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tag) = self.consumer_tag.lock().await.take() {
            if let Some(channel) = self.channel.lock().await.as_ref() {
                let _ = channel.basic_cancel(&tag, BasicCancelOptions::default()).await;
            }
        }

        if options.force {
            if let Some(task) = self.consume_task.lock().await.take() {
                task.abort();
            }
        } else {
            let deadline = tokio::time::Instant::now() + options.timeout;
            while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // Dropping the handle here does not abort the task (unlike
            // `JoinHandle::abort`); `basic_cancel` above already ended the
            // consumer stream, so `consume_loop` exits on its own.
            self.consume_task.lock().await.take();
        }

        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close(0, "rpc server stopped").await;
        }
        self.dedup.clear().await;
        self.consumer_count.store(0, Ordering::SeqCst);
    }
}
