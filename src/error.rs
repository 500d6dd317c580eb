//! Error taxonomy for the broker-client fabric.
//!
//! Every public operation fails into one of these families rather than a
//! single catch-all error, so callers can match on the kind that actually
//! matters to them. Each variant carries the stable error code surfaced in
//! logs and, for RPC, rehydrated on the wire.

use thiserror::Error;

/// Stable error code strings surfaced to callers and over the wire.
pub mod codes {
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const CHANNEL_ERROR: &str = "CHANNEL_ERROR";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const TRANSIENT_ERROR: &str = "TRANSIENT_ERROR";
    pub const PERMANENT_ERROR: &str = "PERMANENT_ERROR";
    pub const PUBLISH_ERROR: &str = "PUBLISH_ERROR";
    pub const EXCHANGE_ERROR: &str = "EXCHANGE_ERROR";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
}

/// Errors raised by [`crate::connection::ConnectionManager`].
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to broker: {0}")]
    ConnectFailed(String),
    #[error("connection is closed")]
    Closed,
    #[error("circuit breaker is open, failing fast")]
    CircuitOpen,
    #[error("max reconnect attempts reached")]
    MaxAttemptsReached,
}

/// Errors raised by [`crate::channel_pool::ChannelPool`].
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to open channel: {0}")]
    OpenFailed(String),
    #[error("timed out waiting for a free channel")]
    AcquireTimeout,
    #[error("pool is draining, no new channels are issued")]
    PoolDraining,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Errors raised while validating and parsing an inbound message.
///
/// This is the non-fatal twin of [`MalformedStrategy`]: the parser always
/// returns a strategy alongside the error so callers don't have to guess how
/// to react, but the error itself is kept so it can be logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message body of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("message body contains a NUL byte")]
    NulByte,
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("decoded payload is null")]
    NullPayload,
}

/// What a consumer should do with a message that failed parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedStrategy {
    /// Nack the message without requeue; it is lost unless the queue's own
    /// DLX happens to catch it.
    Reject,
    /// Explicitly republish the raw message to the asserted §6 DLQ
    /// substrate and ack the original, independent of the queue's DLX.
    Dlq,
    /// Ack the message as if it had never arrived.
    Ignore,
}

/// Errors raised by [`crate::publisher::Publisher`].
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("failed to declare exchange: {0}")]
    ExchangeAssertion(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Classification of a handler failure, driving the Subscriber's and
/// RpcServer's ack/nack/DLQ decision.
#[derive(Error, Debug)]
pub enum ClassifiedError {
    /// Should be retried (nack-requeue, subject to the retry budget).
    #[error("transient error: {0}")]
    Transient(String),
    /// Should not be retried (nack-drop / DLQ).
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl ClassifiedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClassifiedError::Transient(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ClassifiedError::Transient(_) => codes::TRANSIENT_ERROR,
            ClassifiedError::Permanent(_) => codes::PERMANENT_ERROR,
        }
    }
}

/// A handler-facing error, convertible from any user error via [`From`].
///
/// User handlers return `Result<T, HandlerError>`; middlewares and the
/// dispatch pipeline never need to know the concrete error type.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Whether this failure should be retried. Defaults to transient.
    pub transient: bool,
}

impl HandlerError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            transient: true,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError {
            message: err.to_string(),
            details: None,
            transient: true,
        }
    }
}

impl From<lapin::Error> for HandlerError {
    fn from(err: lapin::Error) -> Self {
        HandlerError {
            message: err.to_string(),
            details: None,
            transient: true,
        }
    }
}

/// Errors surfaced by [`crate::rpc::client::RpcClient::send`].
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc request timed out")]
    Timeout,
    #[error("rpc request was aborted")]
    Aborted,
    #[error("rpc client is closing")]
    Closed,
    #[error("command name must not be empty")]
    Validation(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
    /// A server-side error, rehydrated from the response envelope's `error` field.
    #[error("{code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },
}
