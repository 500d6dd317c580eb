//! Queue+binding setup, pattern-match dispatch, per-handler execution
//! discipline, and consumer recovery.
//!
//! Generalizes a single fixed consumer per topic into N pattern-bound
//! handlers dispatched per message, each handler wrapped in its own
//! composed middleware chain. Retry accounting prefers an explicit
//! `x-retry-count` header and falls back to summing `x-death` entries only
//! when that header is absent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_lite::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Consumer, ExchangeKind};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ParserConfig, RetryConfig};
use crate::connection::ConnectionManager;
use crate::envelope::MessageEnvelope;
use crate::middleware::{compose, ComposedHandler, Context, Middleware};
use crate::parser::{self, ParseOutcome};

/// Strict: any handler failure nack-drops the message. Isolated: the
/// message is always acked; per-handler failures are reported out-of-band
/// (invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Strict,
    Isolated,
}

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const FIRST_FAILURE_HEADER: &str = "x-first-failure";

#[derive(Clone)]
pub struct SubscriberOptions {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// `None` requests a broker-assigned exclusive, auto-delete queue name.
    pub queue: Option<String>,
    pub prefetch: u16,
    pub dispatch_mode: DispatchMode,
    pub retry: RetryConfig,
    pub parser: ParserConfig,
    pub max_reconnect_attempts: u32,
    /// Handler duration at or above which `on_slow_message` fires with
    /// [`SlowSeverity::Warn`].
    pub slow_warn_threshold: Option<Duration>,
    /// Handler duration at or above which `on_slow_message` fires with
    /// [`SlowSeverity::Error`] instead of `Warn`.
    pub slow_error_threshold: Option<Duration>,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_kind: ExchangeKind::Topic,
            queue: None,
            prefetch: 10,
            dispatch_mode: DispatchMode::Strict,
            retry: RetryConfig::default(),
            parser: ParserConfig::default(),
            max_reconnect_attempts: 10,
            slow_warn_threshold: None,
            slow_error_threshold: None,
        }
    }
}

struct Binding {
    pattern: String,
    regex: Regex,
    handler: ComposedHandler,
    /// Optional per-handler wall-clock timeout (§4.7.6); a handler that
    /// overruns it fails with a `HandlerTimeout`-classified permanent error.
    timeout: Option<Duration>,
}

/// `eventName` -> routing-key style pattern compilation. `.` is literal,
/// `*` matches one segment, `#` matches zero or more, anchored.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    for part in pattern.split('.') {
        if !out.ends_with('^') {
            out.push_str(r"\.");
        }
        match part {
            "*" => out.push_str(r"[^.]+"),
            "#" => {
                // `#` consumes the preceding separator too, so it can match
                // zero segments (`a.#` matches `a`).
                if out.ends_with(r"\.") {
                    out.truncate(out.len() - 2);
                    out.push_str(r"(\..*)?");
                } else {
                    out.push_str(".*");
                }
            }
            literal => out.push_str(&regex::escape(literal)),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Reads `x-retry-count` if present, else sums the `count` field across
/// `x-death` entries. Writes always go through `x-retry-count`; `x-death`
/// is treated as a read-only fallback for messages that predate it.
pub fn retry_count_from_properties(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };
    if let Some(v) = headers.inner().get(RETRY_COUNT_HEADER) {
        return amqp_value_as_u32(v).unwrap_or(0);
    }
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else {
        return 0;
    };
    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => table.inner().get("count").and_then(amqp_value_as_u32),
            _ => None,
        })
        .sum()
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(*n as u32),
        _ => None,
    }
}

/// Severity bucket for a slow-handler observation (§4.7.7 / §4.8.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowSeverity {
    Warn,
    Error,
}

/// Reported to an `on_slow_message` callback once a handler's wall-clock
/// duration crosses the configured warn/error threshold.
#[derive(Debug, Clone)]
pub struct SlowMessageEvent {
    pub event_name: Option<String>,
    pub command: Option<String>,
    pub message_id: Option<String>,
    pub duration: Duration,
    pub severity: SlowSeverity,
}

/// Classifies `elapsed` against the configured thresholds, if any.
/// `error` is checked first since it implies `warn`.
pub fn classify_slow(elapsed: Duration, warn: Option<Duration>, error: Option<Duration>) -> Option<SlowSeverity> {
    if let Some(error) = error {
        if elapsed >= error {
            return Some(SlowSeverity::Error);
        }
    }
    if let Some(warn) = warn {
        if elapsed >= warn {
            return Some(SlowSeverity::Warn);
        }
    }
    None
}

pub(crate) fn with_retry_count(properties: BasicProperties, next: u32) -> BasicProperties {
    let mut headers = properties.headers().as_ref().cloned().unwrap_or_default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(next));
    if headers.inner().get(FIRST_FAILURE_HEADER).is_none() {
        headers.insert(
            FIRST_FAILURE_HEADER.into(),
            AMQPValue::LongLongInt(chrono::Utc::now().timestamp_millis()),
        );
    }
    properties.with_headers(headers)
}

pub struct Subscriber {
    connection: Arc<ConnectionManager>,
    options: SubscriberOptions,
    bindings: Mutex<Vec<Binding>>,
    global_middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    channel: Mutex<Option<Channel>>,
    consumer_tag: Mutex<Option<String>>,
    queue_name: Mutex<Option<String>>,
    /// §6 DLQ substrate asserted for the current queue, if any; used to
    /// explicitly route `MalformedStrategy::Dlq` messages there.
    dlq_target: Mutex<Option<crate::connection::DlqTarget>>,
    running: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    consumer_count: AtomicUsize,
    reconnect_attempt: AtomicU32,
    consume_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_error: Mutex<Option<Arc<dyn Fn(String, Option<String>, String) + Send + Sync>>>,
    on_slow: Mutex<Option<Arc<dyn Fn(SlowMessageEvent) + Send + Sync>>>,
}

impl Subscriber {
    pub fn new(connection: Arc<ConnectionManager>, options: SubscriberOptions) -> Arc<Self> {
        Arc::new(Self {
            connection,
            options,
            bindings: Mutex::new(Vec::new()),
            global_middlewares: Mutex::new(Vec::new()),
            channel: Mutex::new(None),
            consumer_tag: Mutex::new(None),
            queue_name: Mutex::new(None),
            dlq_target: Mutex::new(None),
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            consumer_count: AtomicUsize::new(0),
            reconnect_attempt: AtomicU32::new(0),
            consume_task: Mutex::new(None),
            on_error: Mutex::new(None),
            on_slow: Mutex::new(None),
        })
    }

    /// Registers a callback invoked in isolated mode with
    /// `(eventName, messageId, error)` for each per-handler failure.
    pub async fn on_handler_error(
        &self,
        callback: Arc<dyn Fn(String, Option<String>, String) + Send + Sync>,
    ) {
        *self.on_error.lock().await = Some(callback);
    }

    /// Registers a callback fired once per handler execution whose duration
    /// crosses `slow_warn_threshold`/`slow_error_threshold` (§4.7.7).
    pub async fn on_slow_message(&self, callback: Arc<dyn Fn(SlowMessageEvent) + Send + Sync>) {
        *self.on_slow.lock().await = Some(callback);
    }

    pub async fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        self.global_middlewares.lock().await.push(mw);
    }

    pub async fn on(
        &self,
        pattern: &str,
        middlewares: &[Arc<dyn Middleware>],
        handler: ComposedHandler,
    ) -> Result<(), regex::Error> {
        self.on_with_timeout(pattern, middlewares, handler, None).await
    }

    /// Same as [`Subscriber::on`] but bounds the composed handler with a
    /// per-handler wall-clock timeout.
    pub async fn on_with_timeout(
        &self,
        pattern: &str,
        middlewares: &[Arc<dyn Middleware>],
        handler: ComposedHandler,
        timeout: Option<Duration>,
    ) -> Result<(), regex::Error> {
        let regex = compile_pattern(pattern)?;
        let mut chain = self.global_middlewares.lock().await.clone();
        chain.extend_from_slice(middlewares);
        let composed = compose(&chain, handler);
        self.bindings.lock().await.push(Binding {
            pattern: pattern.to_string(),
            regex,
            handler: composed,
            timeout,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumer_count.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), crate::error::ChannelError> {
        use crate::error::ChannelError;

        if self.bindings.lock().await.is_empty() {
            return Err(ChannelError::OpenFailed(
                "start() requires at least one registered handler".to_string(),
            ));
        }

        let consumer = self.open_and_bind().await?;
        self.running.store(true, Ordering::SeqCst);
        self.consumer_count.store(1, Ordering::SeqCst);
        self.reconnect_attempt.store(0, Ordering::SeqCst);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.consume_loop(consumer).await });
        *self.consume_task.lock().await = Some(task);
        Ok(())
    }

    async fn open_and_bind(self: &Arc<Self>) -> Result<Consumer, crate::error::ChannelError> {
        use crate::error::ChannelError;

        let channel = self.connection.create_channel().await?;
        channel
            .exchange_declare(
                &self.options.exchange,
                self.options.exchange_kind.clone(),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        let (queue_name, declare_opts) = match &self.options.queue {
            Some(name) => (
                name.clone(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            ),
            None => (
                String::new(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            ),
        };
        // The DLQ substrate needs the main queue's final name up front (it's
        // baked into `Q.dlq`/`Q.dead`), so a broker-assigned anonymous queue
        // (no `self.options.queue`) has nothing stable to derive it from and
        // is declared with no dead-letter wiring at all.
        let mut declare_args = FieldTable::default();
        let mut dlq_target = None;
        if self.options.retry.dlq.enabled {
            if let Some(name) = &self.options.queue {
                let target = crate::connection::assert_dlq(&channel, name, &self.options.retry.dlq)
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
        }
        let queue = channel
            .queue_declare(&queue_name, declare_opts, declare_args)
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        let queue_name = queue.name().to_string();
        *self.dlq_target.lock().await = dlq_target;

        let patterns: HashSet<String> = self
            .bindings
            .lock()
            .await
            .iter()
            .map(|b| b.pattern.clone())
            .collect();
        for pattern in &patterns {
            channel
                .queue_bind(
                    &queue_name,
                    &self.options.exchange,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        }

        channel
            .basic_qos(self.options.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        let consumer_tag = format!("hermes-sub-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;

        *self.channel.lock().await = Some(channel);
        *self.consumer_tag.lock().await = Some(consumer_tag);
        *self.queue_name.lock().await = Some(queue_name);
        Ok(consumer)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.consume_task.lock().await.take() {
            task.abort();
        }
        if let Some(tag) = self.consumer_tag.lock().await.take() {
            if let Some(channel) = self.channel.lock().await.as_ref() {
                let _ = channel.basic_cancel(&tag, BasicCancelOptions::default()).await;
            }
        }
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close(0, "subscriber stopped").await;
        }
        self.consumer_count.store(0, Ordering::SeqCst);
    }

    async fn consume_loop(self: Arc<Self>, mut consumer: Consumer) {
        loop {
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.handle_delivery(&delivery).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "subscriber delivery error");
                    break;
                }
                None => {
                    debug!("subscriber consumer cancelled by broker");
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

    /// Consumer recovery: re-register with exponential backoff
    /// `min(5s * 2^(n-1), 60s)` up to `max_reconnect_attempts`.
    async fn recover(self: Arc<Self>) {
        loop {
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.options.max_reconnect_attempts {
                error!("subscriber exhausted reconnect attempts, giving up");
                self.running.store(false, Ordering::SeqCst);
                self.consumer_count.store(0, Ordering::SeqCst);
                return;
            }
            let delay_secs = 5f64 * 2f64.powi((attempt - 1) as i32);
            let delay = Duration::from_secs_f64(delay_secs.min(60.0));
            warn!(attempt, ?delay, "subscriber reconnecting");
            tokio::time::sleep(delay).await;

            match self.open_and_bind().await {
                Ok(consumer) => {
                    self.consumer_count.store(1, Ordering::SeqCst);
                    self.reconnect_attempt.store(0, Ordering::SeqCst);
                    let this = Arc::clone(&self);
                    let task = tokio::spawn(async move { this.consume_loop(consumer).await });
                    *self.consume_task.lock().await = Some(task);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "subscriber reconnect attempt failed");
                }
            }
        }
    }

    async fn handle_delivery(&self, delivery: &lapin::message::Delivery) {
        let parsed = parser::parse(&delivery.data, &self.options.parser);
        let value = match parsed {
            ParseOutcome::Ok(v) => v,
            ParseOutcome::Fail { error, strategy } => {
                warn!(error = %error, "malformed message");
                self.apply_malformed_strategy(delivery, strategy).await;
                return;
            }
        };

        let (event_name, data, metadata) = match serde_json::from_value::<MessageEnvelope>(value.clone()) {
            Ok(envelope) => (envelope.event_name, envelope.data, envelope.metadata),
            Err(_) => (delivery.routing_key.to_string(), value, None),
        };

        let bindings = self.bindings.lock().await;
        let matching: Vec<&Binding> = bindings
            .iter()
            .filter(|b| b.regex.is_match(&event_name))
            .collect();

        if matching.is_empty() {
            debug!(event = %event_name, "no handler matched, acking");
            drop(bindings);
            let _ = delivery.ack(BasicAckOptions::default()).await;
            return;
        }

        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string());
        let ctx = Context {
            event_name: Some(event_name.clone()),
            command: None,
            message_id: message_id.clone(),
            metadata,
        };

        let futures: Vec<_> = matching
            .iter()
            .map(|b| {
                let handler = Arc::clone(&b.handler);
                let timeout = b.timeout;
                let data = data.clone();
                let ctx = ctx.clone();
                async move {
                    let start = Instant::now();
                    let result = match timeout {
                        Some(t) => match tokio::time::timeout(t, handler(data, ctx)).await {
                            Ok(r) => r,
                            Err(_) => Err(crate::error::HandlerError::permanent("handler timed out")),
                        },
                        None => handler(data, ctx).await,
                    };
                    (result, start.elapsed())
                }
            })
            .collect();
        drop(bindings);

        let outcomes = futures::future::join_all(futures).await;
        for (_, elapsed) in &outcomes {
            self.report_slow(*elapsed, Some(event_name.clone()), None, message_id.clone()).await;
        }
        let results: Vec<_> = outcomes.into_iter().map(|(r, _)| r).collect();

        match self.options.dispatch_mode {
            DispatchMode::Strict => {
                if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                    warn!(event = %event_name, error = %err.message, "handler failed, nack-drop");
                    self.nack_with_retry_policy(delivery, err.transient).await;
                } else {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
            }
            DispatchMode::Isolated => {
                for result in results {
                    if let Err(err) = result {
                        if let Some(cb) = self.on_error.lock().await.clone() {
                            cb(event_name.clone(), message_id.clone(), err.message.clone());
                        } else {
                            warn!(event = %event_name, error = %err.message, "isolated handler failed");
                        }
                    }
                }
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
        }
    }

    /// Transient errors are retried subject to the retry budget; permanent
    /// errors and exhausted retries nack-drop straight to the queue's DLX.
    ///
    /// A plain broker-level nack-requeue redelivers the original message
    /// unchanged, which can't carry an incremented `x-retry-count` (invariant
    /// 6). So a retry instead republishes a copy with the header rewritten
    /// and drops the original — the broker sees one extra publish instead of
    /// a redelivery, but the attempt count recorded on the wire stays
    /// accurate.
    /// `Reject` nack-drops and leaves dead-lettering to whatever DLX the
    /// queue itself was declared with (§4.3: "lost unless the queue has a
    /// DLX"). `Dlq` instead explicitly republishes the raw frame to the
    /// asserted §6 substrate and acks the original, so delivery there
    /// doesn't depend on the queue's own dead-letter wiring being present.
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
                                    warn!(error = %e, "dlq publish for malformed message was not confirmed");
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

    async fn nack_with_retry_policy(&self, delivery: &lapin::message::Delivery, transient: bool) {
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
        let queue_name = self.queue_name.lock().await.clone().ok_or(())?;
        let channel = self.channel.lock().await.clone().ok_or(())?;
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

    /// Invokes `on_slow_message` if `elapsed` crosses either configured
    /// threshold.
    async fn report_slow(
        &self,
        elapsed: Duration,
        event_name: Option<String>,
        command: Option<String>,
        message_id: Option<String>,
    ) {
        let Some(severity) = classify_slow(elapsed, self.options.slow_warn_threshold, self.options.slow_error_threshold)
        else {
            return;
        };
        if let Some(cb) = self.on_slow.lock().await.clone() {
            cb(SlowMessageEvent {
                event_name,
                command,
                message_id,
                duration: elapsed,
                severity,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_wildcard_matches_one_segment() {
        let re = compile_pattern("*").unwrap();
        assert!(re.is_match("order"));
        assert!(!re.is_match("order.created"));
    }

    #[test]
    fn hash_matches_anything() {
        let re = compile_pattern("#").unwrap();
        assert!(re.is_match("order"));
        assert!(re.is_match("order.created.v2"));
    }

    #[test]
    fn prefix_star_requires_exact_segment_count() {
        let re = compile_pattern("a.*").unwrap();
        assert!(!re.is_match("a"));
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("a.b.c"));
    }

    #[test]
    fn prefix_hash_matches_bare_prefix_too() {
        let re = compile_pattern("a.#").unwrap();
        assert!(re.is_match("a"));
        assert!(re.is_match("a.b"));
        assert!(re.is_match("a.b.c"));
    }

    #[test]
    fn topic_wildcard_scenario_from_spec() {
        let re = compile_pattern("order.#").unwrap();
        assert!(re.is_match("order.created"));
        assert!(re.is_match("order.shipped.express"));
    }

    #[test]
    fn non_matching_topic_scenario_from_spec() {
        let re = compile_pattern("user.*").unwrap();
        assert!(!re.is_match("order.created"));
    }

    #[test]
    fn retry_count_header_takes_priority_over_x_death() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(2));
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count_from_properties(&props), 2);
    }

    #[test]
    fn with_retry_count_sets_header_and_first_failure_once() {
        let props = BasicProperties::default();
        let props = with_retry_count(props, 1);
        assert_eq!(retry_count_from_properties(&props), 1);
        let first_failure = props
            .headers()
            .as_ref()
            .unwrap()
            .inner()
            .get(FIRST_FAILURE_HEADER)
            .cloned();
        assert!(first_failure.is_some());

        let props = with_retry_count(props, 2);
        assert_eq!(retry_count_from_properties(&props), 2);
        let first_failure_again = props
            .headers()
            .as_ref()
            .unwrap()
            .inner()
            .get(FIRST_FAILURE_HEADER)
            .cloned();
        assert_eq!(first_failure, first_failure_again);
    }

    #[test]
    fn classify_slow_prefers_error_over_warn() {
        let warn = Some(Duration::from_millis(100));
        let error = Some(Duration::from_millis(500));
        assert_eq!(classify_slow(Duration::from_millis(50), warn, error), None);
        assert_eq!(
            classify_slow(Duration::from_millis(200), warn, error),
            Some(SlowSeverity::Warn)
        );
        assert_eq!(
            classify_slow(Duration::from_millis(500), warn, error),
            Some(SlowSeverity::Error)
        );
    }

    #[test]
    fn classify_slow_with_no_thresholds_never_fires() {
        assert_eq!(classify_slow(Duration::from_secs(999), None, None), None);
    }

    #[test]
    fn falls_back_to_x_death_sum_when_header_absent() {
        let mut death_entry = FieldTable::default();
        death_entry.insert("count".into(), AMQPValue::LongLongInt(3));
        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(vec![AMQPValue::FieldTable(Box::new(death_entry))].into()),
        );
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count_from_properties(&props), 3);
    }
}
