//! Stateless size/NUL-byte/JSON validation of inbound frames.

use serde_json::Value;

use crate::config::ParserConfig;
use crate::error::{MalformedStrategy, ParseError};

/// Outcome of validating one inbound frame.
pub enum ParseOutcome {
    Ok(Value),
    Fail {
        error: ParseError,
        strategy: MalformedStrategy,
    },
}

/// Validates `content` against `config`'s size limit, checks for embedded
/// NUL bytes, then parses it as JSON and rejects a top-level `null`.
pub fn parse(content: &[u8], config: &ParserConfig) -> ParseOutcome {
    if content.len() > config.max_body_bytes {
        return ParseOutcome::Fail {
            error: ParseError::TooLarge {
                size: content.len(),
                max: config.max_body_bytes,
            },
            strategy: config.malformed_strategy,
        };
    }

    if content.contains(&0u8) {
        return ParseOutcome::Fail {
            error: ParseError::NulByte,
            strategy: config.malformed_strategy,
        };
    }

    let value: Value = match serde_json::from_slice(content) {
        Ok(v) => v,
        Err(e) => {
            return ParseOutcome::Fail {
                error: ParseError::InvalidJson(e.to_string()),
                strategy: config.malformed_strategy,
            }
        }
    };

    if value.is_null() {
        return ParseOutcome::Fail {
            error: ParseError::NullPayload,
            strategy: config.malformed_strategy,
        };
    }

    ParseOutcome::Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ParserConfig {
        ParserConfig {
            max_body_bytes: 1024,
            malformed_strategy: MalformedStrategy::Reject,
        }
    }

    #[test]
    fn accepts_well_formed_json() {
        match parse(br#"{"a":1}"#, &cfg()) {
            ParseOutcome::Ok(v) => assert_eq!(v, serde_json::json!({"a": 1})),
            ParseOutcome::Fail { .. } => panic!("expected ok"),
        }
    }

    #[test]
    fn rejects_oversized_body() {
        let huge = vec![b'a'; 2048];
        match parse(&huge, &cfg()) {
            ParseOutcome::Fail { error, .. } => {
                assert!(matches!(error, ParseError::TooLarge { .. }))
            }
            ParseOutcome::Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn rejects_nul_byte() {
        let mut body = br#"{"a":1}"#.to_vec();
        body.push(0);
        match parse(&body, &cfg()) {
            ParseOutcome::Fail { error, .. } => assert_eq!(error, ParseError::NulByte),
            ParseOutcome::Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        match parse(b"{not json", &cfg()) {
            ParseOutcome::Fail { error, .. } => {
                assert!(matches!(error, ParseError::InvalidJson(_)))
            }
            ParseOutcome::Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn rejects_null_payload() {
        match parse(b"null", &cfg()) {
            ParseOutcome::Fail { error, .. } => assert_eq!(error, ParseError::NullPayload),
            ParseOutcome::Ok(_) => panic!("expected failure"),
        }
    }
}
