//! Typed observer over `ConnectionManager` lifecycle events.
//!
//! Backed by `tokio::sync::broadcast` rather than a callback registry, so
//! any number of observers can subscribe and late subscribers simply miss
//! events emitted before they subscribed.

use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// The closed set of events a [`crate::connection::ConnectionManager`] emits.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    MaxAttemptsReached,
    CircuitBreakerStateChange { from: CircuitState, to: CircuitState },
    CircuitBreakerReset,
    Error { message: String },
}

/// Default channel capacity for the connection event broadcast.
///
/// Lagging subscribers drop the oldest events rather than block the
/// connection manager; this mirrors an event emitter's fire-and-forget
/// semantics more closely than an unbounded channel would.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
