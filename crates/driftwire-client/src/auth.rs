//! Authentication state and login-failure classification.
//!
//! The controller itself lives in the connection (login is just a
//! method call with special result routing); this module holds the
//! pieces that are pure state or pure logic: retry bookkeeping,
//! failure classification, the password digest, and the user selector.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::DdpError;

/// First retry delay after a retryable login failure.
pub(crate) const INITIAL_RETRY_TIMEOUT: Duration = Duration::from_millis(50);

/// Retry delay reset applied by `load_initial_user`.
pub(crate) const RELOAD_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Retry delay ceiling.
pub(crate) const MAX_RETRY_TIMEOUT: Duration = Duration::from_millis(8000);

/// Slack added on top of a server-provided `timeToReset`.
pub(crate) const RATE_LIMIT_GRACE: Duration = Duration::from_millis(100);

/// Error codes that mean the resume token is dead and retrying is
/// pointless.
const RESUME_REJECTION_CODES: &[&str] =
    &["403", "token-expired", "not-authorized", "incorrect-auth-token"];

/// Mutable auth state, owned by the connection.
pub(crate) struct AuthState<I> {
    pub token: Option<String>,
    pub token_expires: Option<String>,
    pub user_id: Option<String>,
    /// Guards against concurrent token resumes.
    pub is_calling_login: bool,
    /// Current retry delay; doubles per failure up to the ceiling.
    pub retry_timeout: Duration,
    /// Scheduled token-login retry: deadline plus the token to use.
    pub retry_at: Option<(I, String)>,
    /// Scheduled `load_initial_user` (rate-limit recovery).
    pub reload_at: Option<I>,
}

impl<I> Default for AuthState<I> {
    fn default() -> Self {
        Self {
            token: None,
            token_expires: None,
            user_id: None,
            is_calling_login: false,
            retry_timeout: INITIAL_RETRY_TIMEOUT,
            retry_at: None,
            reload_at: None,
        }
    }
}

impl<I> AuthState<I> {
    /// The delay to use for the next retry; doubles the stored timeout
    /// up to [`MAX_RETRY_TIMEOUT`].
    pub fn bump_retry(&mut self) -> Duration {
        let delay = self.retry_timeout;
        self.retry_timeout = (self.retry_timeout * 2).min(MAX_RETRY_TIMEOUT);
        delay
    }

    pub fn clear_session(&mut self) {
        self.token = None;
        self.token_expires = None;
        self.user_id = None;
    }
}

/// How to react to a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginFailureClass {
    /// Server throttled us; re-run the initial load after the delay.
    RateLimited(Duration),
    /// The token is dead; clear auth and do not retry.
    ResumeRejected,
    /// Transient; retry with backoff.
    Retryable,
}

/// Classify a login failure.
pub(crate) fn classify(error: &DdpError) -> LoginFailureClass {
    let Some(code) = error.code() else {
        return LoginFailureClass::Retryable;
    };

    if code == "too-many-requests" {
        let reset_ms = error
            .details
            .as_ref()
            .and_then(|d| d.get("timeToReset"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        return LoginFailureClass::RateLimited(
            Duration::from_millis(reset_ms) + RATE_LIMIT_GRACE,
        );
    }

    if RESUME_REJECTION_CODES.contains(&code.as_str()) {
        return LoginFailureClass::ResumeRejected;
    }

    LoginFailureClass::Retryable
}

/// Who is logging in: an account name or an email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSelector {
    /// Match on `username`.
    Username(String),
    /// Match on `email`.
    Email(String),
}

impl UserSelector {
    pub(crate) fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        match self {
            Self::Username(name) => map.insert("username".to_string(), Value::from(name.clone())),
            Self::Email(email) => map.insert("email".to_string(), Value::from(email.clone())),
        };
        Value::Object(map)
    }
}

impl From<&str> for UserSelector {
    /// Bare strings split on `@`: addresses are emails, everything else
    /// is a username.
    fn from(s: &str) -> Self {
        if s.contains('@') {
            Self::Email(s.to_string())
        } else {
            Self::Username(s.to_string())
        }
    }
}

/// The `{digest, algorithm}` password parameter. The plaintext never
/// goes on the wire.
pub(crate) fn password_digest(password: &str) -> Value {
    let digest = Sha256::digest(password.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let mut map = serde_json::Map::new();
    map.insert("digest".to_string(), Value::from(hex));
    map.insert("algorithm".to_string(), Value::from("sha-256"));
    Value::Object(map)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut auth: AuthState<std::time::Instant> = AuthState::default();
        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(auth.bump_retry());
        }
        assert_eq!(delays[0], Duration::from_millis(50));
        assert_eq!(delays[1], Duration::from_millis(100));
        assert!(delays.windows(2).all(|w| w[1] <= w[0] * 2));
        assert!(delays.iter().all(|d| *d <= MAX_RETRY_TIMEOUT));
        assert_eq!(*delays.last().unwrap(), MAX_RETRY_TIMEOUT);
    }

    #[test]
    fn rate_limit_honors_time_to_reset() {
        let err = DdpError::from_value(&json!({
            "error": "too-many-requests",
            "details": {"timeToReset": 400},
        }));
        assert_eq!(
            classify(&err),
            LoginFailureClass::RateLimited(Duration::from_millis(500))
        );
    }

    #[test]
    fn rejection_codes_all_classify_as_rejected() {
        for code in [json!(403), json!("403"), json!("token-expired"), json!("not-authorized")] {
            let err = DdpError::from_value(&json!({"error": code}));
            assert_eq!(classify(&err), LoginFailureClass::ResumeRejected);
        }
    }

    #[test]
    fn anything_else_is_retryable() {
        let err = DdpError::from_value(&json!({"error": 500, "reason": "Internal server error"}));
        assert_eq!(classify(&err), LoginFailureClass::Retryable);
    }

    #[test]
    fn selector_splits_on_at_sign() {
        assert_eq!(UserSelector::from("ada"), UserSelector::Username("ada".to_string()));
        assert_eq!(
            UserSelector::from("ada@example.com"),
            UserSelector::Email("ada@example.com".to_string())
        );
    }

    #[test]
    fn digest_is_hex_sha256() {
        let value = password_digest("hunter2");
        assert_eq!(value["algorithm"], "sha-256");
        let digest = value["digest"].as_str().unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Same input, same digest.
        assert_eq!(password_digest("hunter2"), value);
    }
}
