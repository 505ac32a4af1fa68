//! Protocol error types.
//!
//! Strongly-typed errors for frame parsing. Malformed frames are
//! recoverable by design: the session layer drops them and keeps the
//! socket alive.

use thiserror::Error;

/// Errors produced while encoding or decoding DDP frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame text was not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame carried a known `msg` tag but an invalid payload shape.
    #[error("invalid payload for '{msg}': {reason}")]
    InvalidPayload {
        /// The `msg` tag of the offending frame.
        msg: String,
        /// Why deserialization failed.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_msg_tag() {
        let err = ProtocolError::InvalidPayload {
            msg: "ready".to_string(),
            reason: "subs must be an array".to_string(),
        };
        assert!(err.to_string().contains("ready"));
    }
}
