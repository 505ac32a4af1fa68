//! Client error types.
//!
//! [`ClientError`] covers local misuse (bad endpoint, reserved
//! collection names). [`DdpError`] is the normalized shape of every
//! error the *server* hands us: method failures, subscription `nosub`
//! errors, and login failures all funnel through it.

use driftwire_core::StoreError;
use serde_json::Value;
use thiserror::Error;

/// Errors raised locally by the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The configured endpoint is not a plausible DDP URL.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The offending URL.
        endpoint: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Store-level failure (reserved collection name).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normalized server-side error.
///
/// DDP errors arrive as loosely-shaped EJSON objects; this struct is
/// the one shape the rest of the client (and application callbacks)
/// see. `is_logout_triggered` marks login failures that also cleared
/// the local session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DdpError {
    /// Machine-readable error value (number or string).
    pub error: Option<Value>,
    /// Short human-readable reason.
    pub reason: Option<String>,
    /// Longer message, when the server provides one.
    pub message: Option<String>,
    /// Structured detail payload (rate-limit metadata lives here).
    pub details: Option<Value>,
    /// User id associated with the failed login attempt, if known.
    pub user_id: Option<String>,
    /// Token associated with the failed login attempt, if known.
    pub token: Option<String>,
    /// Whether this failure forced a local logout.
    pub is_logout_triggered: bool,
}

impl DdpError {
    /// Normalize an arbitrary server error value.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let get_str =
            |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        match value {
            Value::Object(_) => Self {
                error: value.get("error").cloned(),
                reason: get_str("reason"),
                message: get_str("message"),
                details: value.get("details").cloned(),
                user_id: None,
                token: None,
                is_logout_triggered: false,
            },
            Value::String(s) => Self { reason: Some(s.clone()), ..Self::default() },
            other => Self { error: Some(other.clone()), ..Self::default() },
        }
    }

    /// The error code as a string, whatever its wire type was.
    ///
    /// `403` and `"403"` classify identically.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Display for DdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self
            .reason
            .as_deref()
            .or(self.message.as_deref())
            .map(str::to_string)
            .or_else(|| self.code())
            .unwrap_or_else(|| "unknown server error".to_string());
        write!(f, "{text}")
    }
}

impl std::error::Error for DdpError {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalizes_object_errors() {
        let err = DdpError::from_value(&json!({
            "error": 403,
            "reason": "Token expired",
            "details": {"timeToReset": 400},
        }));
        assert_eq!(err.code().as_deref(), Some("403"));
        assert_eq!(err.reason.as_deref(), Some("Token expired"));
        assert_eq!(err.details, Some(json!({"timeToReset": 400})));
        assert!(!err.is_logout_triggered);
    }

    #[test]
    fn string_error_codes_match_numeric_ones() {
        let a = DdpError::from_value(&json!({"error": "403"}));
        let b = DdpError::from_value(&json!({"error": 403}));
        assert_eq!(a.code(), b.code());
    }

    #[test]
    fn bare_string_becomes_reason() {
        let err = DdpError::from_value(&json!("it broke"));
        assert_eq!(err.reason.as_deref(), Some("it broke"));
        assert_eq!(err.to_string(), "it broke");
    }
}
