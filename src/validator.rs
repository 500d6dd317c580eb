//! The contract this crate consumes from an external schema-validation
//! library. The fluent builder that would normally produce a `Validator`
//! lives outside the core (§1 Out of scope); only this trait matters here.

use serde_json::Value;

/// One structured validation failure, mirroring the wire shape
/// `{path, message}` a schema validator reports per violated field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Validates a decoded JSON payload, returning the (possibly coerced) value
/// on success or the list of violations on failure.
pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<Value, Vec<ValidationIssue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RequireObject;

    impl Validator for RequireObject {
        fn validate(&self, value: &Value) -> Result<Value, Vec<ValidationIssue>> {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(vec![ValidationIssue {
                    path: "$".to_string(),
                    message: "expected an object".to_string(),
                }])
            }
        }
    }

    #[test]
    fn rejects_non_object_payload() {
        let errors = RequireObject.validate(&serde_json::json!(1)).unwrap_err();
        assert_eq!(errors[0].path, "$");
    }

    #[test]
    fn accepts_object_payload() {
        assert!(RequireObject.validate(&serde_json::json!({"a": 1})).is_ok());
    }
}
