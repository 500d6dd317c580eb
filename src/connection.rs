//! Owns the single transport connection, reconnects with exponential
//! backoff behind an optional circuit breaker, and fans out lifecycle
//! events.
//!
//! Uses `Connection::connect` with `ConnectionProperties::default()` for
//! the transport call, and a circuit breaker gating the backoff loop.
//! A background health-poll task watches `connection.status().connected()`
//! and triggers a reconnect on disconnect.
//!
//! Heartbeat negotiation itself is handled by `lapin`'s connection reactor
//! (driven by the AMQP `heartbeat` URI query parameter, or the broker's
//! default); this manager only reacts to the resulting disconnect, it does
//! not implement the heartbeat protocol itself.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};

struct Shared {
    config: BrokerConfig,
    connection: RwLock<Option<Connection>>,
    connect_lock: Mutex<()>,
    circuit_breaker: Mutex<CircuitBreaker>,
    closed: AtomicBool,
    attempt: AtomicU32,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Produces a ready-to-use AMQP connection on demand and tolerates
/// transient faults.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    health_task: tokio::task::JoinHandle<()>,
}

static SHARED_CACHE: Mutex<Option<std::collections::HashMap<String, Weak<Shared>>>> =
    Mutex::const_new(None);

impl ConnectionManager {
    /// Builds a manager that owns its own connection; the common case.
    pub fn new(config: BrokerConfig) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            circuit_breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker)),
            config,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            events: tx,
        });
        let health_task = spawn_health_loop(Arc::clone(&shared));
        Self { shared, health_task }
    }

    /// Opt-in factory that caches managers by URL ("a factory may cache
    /// by URL if a singleton is desired, but that caching is not a
    /// correctness requirement"). Returns a fresh manager when none of the
    /// cached weak references for `url` are still alive.
    pub async fn shared(config: BrokerConfig) -> Arc<ConnectionManagerHandle> {
        let mut guard = SHARED_CACHE.lock().await;
        let cache = guard.get_or_insert_with(Default::default);
        if let Some(weak) = cache.get(&config.url) {
            if let Some(shared) = weak.upgrade() {
                return Arc::new(ConnectionManagerHandle { shared });
            }
        }
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            circuit_breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker)),
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            events: tx,
            config: config.clone(),
        });
        cache.insert(config.url.clone(), Arc::downgrade(&shared));
        let _ = spawn_health_loop(Arc::clone(&shared));
        Arc::new(ConnectionManagerHandle { shared })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the live connection, connecting or reconnecting as needed.
    pub async fn get_connection(&self) -> Result<Connection, ConnectionError> {
        get_connection_impl(&self.shared).await
    }

    pub async fn create_channel(&self) -> Result<Channel, ConnectionError> {
        let conn = self.get_connection().await?;
        conn.create_channel()
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Cancels the reconnect timer, closes the connection and refuses
    /// further `get_connection` calls.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.health_task.abort();
        if let Some(conn) = self.shared.connection.write().await.take() {
            let _ = conn.close(0, "closed by client").await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.health_task.abort();
    }
}

/// A handle into a cached, shared [`ConnectionManager`] (see
/// [`ConnectionManager::shared`]). Exposes the same read surface; only the
/// owner that created the underlying manager can `close()` it outright,
/// since closing a shared connection would affect every other holder.
pub struct ConnectionManagerHandle {
    shared: Arc<Shared>,
}

impl ConnectionManagerHandle {
    pub async fn get_connection(&self) -> Result<Connection, ConnectionError> {
        get_connection_impl(&self.shared).await
    }

    pub async fn create_channel(&self) -> Result<Channel, ConnectionError> {
        let conn = self.get_connection().await?;
        conn.create_channel()
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Closes the shared connection outright. Affects every other holder of
    /// this cached handle; only call this when tearing the process down.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.shared.connection.write().await.take() {
            let _ = conn.close(0, "closed by client").await;
        }
    }
}

async fn get_connection_impl(shared: &Arc<Shared>) -> Result<Connection, ConnectionError> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(ConnectionError::Closed);
    }
    {
        let guard = shared.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }
    }
    connect_with_backoff(shared).await
}

async fn connect_with_backoff(shared: &Arc<Shared>) -> Result<Connection, ConnectionError> {
    // Only one caller drives the actual reconnect; the rest wait on the lock
    // then re-check the cached connection, matching "if a connect is in
    // flight, callers suspend until it completes".
    let _guard = shared.connect_lock.lock().await;
    if shared.closed.load(Ordering::SeqCst) {
        return Err(ConnectionError::Closed);
    }
    {
        let existing = shared.connection.read().await;
        if let Some(conn) = existing.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }
    }

    let reconnect = &shared.config.reconnect;
    let mut attempt = 0u32;
    loop {
        {
            let mut cb = shared.circuit_breaker.lock().await;
            if !cb.allow_request() {
                return Err(ConnectionError::CircuitOpen);
            }
        }

        match Connection::connect(&shared.config.url, ConnectionProperties::default()).await {
            Ok(conn) => {
                let transition = {
                    let mut cb = shared.circuit_breaker.lock().await;
                    cb.record_success()
                };
                if let Some((from, to)) = transition {
                    emit(shared, ConnectionEvent::CircuitBreakerStateChange { from, to });
                    if to == CircuitState::Closed {
                        emit(shared, ConnectionEvent::CircuitBreakerReset);
                    }
                }
                *shared.connection.write().await = Some(conn.clone());
                shared.attempt.store(0, Ordering::SeqCst);
                info!("connected to broker");
                emit(shared, ConnectionEvent::Connected);
                return Ok(conn);
            }
            Err(e) => {
                let message = e.to_string();
                if is_auth_failure(&message) {
                    warn!(error = %message, "non-retryable connect failure");
                    emit(shared, ConnectionEvent::Error { message: message.clone() });
                    return Err(ConnectionError::ConnectFailed(message));
                }

                let transition = {
                    let mut cb = shared.circuit_breaker.lock().await;
                    cb.record_failure()
                };
                if let Some((from, to)) = transition {
                    emit(shared, ConnectionEvent::CircuitBreakerStateChange { from, to });
                }

                attempt += 1;
                if attempt > reconnect.max_attempts {
                    emit(shared, ConnectionEvent::MaxAttemptsReached);
                    return Err(ConnectionError::MaxAttemptsReached);
                }
                let delay = reconnect.delay_for(attempt - 1);
                debug!(attempt, ?delay, error = %message, "retrying broker connection");
                emit(shared, ConnectionEvent::Reconnecting { attempt, delay });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `ECONNREFUSED`, `ETIMEDOUT`, `ENOTFOUND`, `503` and messages containing
/// "connection" are transient; everything else that
/// looks like an auth/ACL rejection is treated as non-retryable.
fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("access") || lower.contains("auth") || lower.contains("forbidden"))
        && !lower.contains("connection")
}

fn emit(shared: &Shared, event: ConnectionEvent) {
    let _ = shared.events.send(event);
}

/// Where a dead-lettered message for `main_queue` ends up, per §6's DLQ
/// convention.
#[derive(Debug, Clone)]
pub struct DlqTarget {
    /// The `dlx` exchange to declare on the main queue as
    /// `x-dead-letter-exchange`.
    pub exchange: String,
    /// The `Q.dead` routing key to declare on the main queue as
    /// `x-dead-letter-routing-key`, and that `Q.dlq` is bound with.
    pub routing_key: String,
    /// The asserted `Q.dlq` queue name.
    pub queue: String,
}

/// Implements §6's DLQ convention for `main_queue`: asserts a durable
/// direct `options.exchange` (`dlx` by default), asserts `{main_queue}.dlq`
/// durable with `x-message-ttl`/`x-max-length` from `options`, and binds
/// the DLQ to the exchange with routing key `{main_queue}.dead`. The
/// caller then points the main queue's own
/// `x-dead-letter-exchange`/`x-dead-letter-routing-key` at the returned
/// [`DlqTarget`] when it declares it.
pub async fn assert_dlq(
    channel: &Channel,
    main_queue: &str,
    options: &crate::config::DlqConfig,
) -> Result<DlqTarget, ConnectionError> {
    use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
    use lapin::types::{AMQPValue, FieldTable};
    use lapin::ExchangeKind;

    channel
        .exchange_declare(
            &options.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;

    let dlq_name = format!("{main_queue}.dlq");
    let routing_key = format!("{main_queue}.dead");

    let mut dlq_args = FieldTable::default();
    if let Some(ttl) = options.message_ttl {
        dlq_args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl.as_millis() as u32));
    }
    if let Some(max_length) = options.max_length {
        dlq_args.insert("x-max-length".into(), AMQPValue::LongUInt(max_length));
    }
    channel
        .queue_declare(
            &dlq_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            dlq_args,
        )
        .await
        .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;

    channel
        .queue_bind(
            &dlq_name,
            &options.exchange,
            &routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;

    Ok(DlqTarget {
        exchange: options.exchange.clone(),
        routing_key,
        queue: dlq_name,
    })
}

fn spawn_health_loop(shared: Arc<Shared>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            let disconnected = {
                let guard = shared.connection.read().await;
                match guard.as_ref() {
                    Some(conn) => !conn.status().connected(),
                    None => false,
                }
            };
            if disconnected {
                warn!("connection unexpectedly closed, reconnecting");
                emit(&shared, ConnectionEvent::Disconnected {
                    reason: "connection status reported not connected".to_string(),
                });
                let _ = connect_with_backoff(&shared).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_not_retried() {
        assert!(is_auth_failure("ACCESS_REFUSED - login was refused"));
        assert!(!is_auth_failure("connection refused"));
    }
}
