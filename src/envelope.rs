//! Wire envelopes for Pub/Sub messages and RPC requests/responses.
//!
//! All three envelope shapes are plain `serde`-derived structs; the wire
//! form is JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Pub/Sub message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub data: Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessageEnvelope {
    pub fn new(event_name: impl Into<String>, data: Value) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            timestamp: now_millis(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// RPC request envelope. `command` is canonicalised to upper-case at
/// construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub command: String,
    pub timestamp: i64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, command: impl AsRef<str>, data: Value) -> Self {
        Self {
            id: id.into(),
            command: command.as_ref().to_uppercase(),
            timestamp: now_millis(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Structured error payload nested in a failed [`ResponseEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// RPC response envelope. Exactly one of `data`/`error` is populated,
/// matching `success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub timestamp: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            success: false,
            data: None,
            error: Some(ResponseError {
                code: code.into(),
                message: message.into(),
                details: None,
                stack: None,
            }),
        }
    }

    pub fn err_with_details(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        let mut env = Self::err(id, code, message);
        env.error.as_mut().unwrap().details = Some(details);
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_envelope_round_trips() {
        let env = MessageEnvelope::new("order.created", serde_json::json!({"id": 1}));
        let wire = serde_json::to_string(&env).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.event_name, "order.created");
        assert_eq!(back.data, serde_json::json!({"id": 1}));
    }

    #[test]
    fn request_command_is_uppercased() {
        let req = RequestEnvelope::new("id-1", "add", serde_json::json!({"a": 1}));
        assert_eq!(req.command, "ADD");
    }

    #[test]
    fn response_success_and_error_are_mutually_exclusive_in_practice() {
        let ok = ResponseEnvelope::ok("id-1", serde_json::json!({"sum": 8}));
        assert!(ok.success && ok.data.is_some() && ok.error.is_none());

        let err = ResponseEnvelope::err("id-1", "TIMEOUT_ERROR", "handler timed out");
        assert!(!err.success && err.data.is_none() && err.error.is_some());
    }
}
