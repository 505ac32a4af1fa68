//! DDP wire protocol
//!
//! Message types and the EJSON codec for the DDP (Distributed Data
//! Protocol) text channel. Every frame on the wire is an EJSON string;
//! this crate owns the translation between frame text and typed
//! messages, leaving transport and session logic to `driftwire-client`.
//!
//! # Components
//!
//! - [`ClientMessage`]: frames the client puts on the wire
//! - [`ServerMessage`]: frames the server sends, parsed by explicit
//!   dispatch on the `msg` tag
//! - [`ejson`]: extended-JSON helpers (`$date`, `$binary`, deep
//!   equality)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod ejson;
mod errors;
mod message;

pub use ejson::Ejson;
pub use errors::ProtocolError;
pub use message::{ChangedMessage, ClientMessage, ServerMessage};

/// DDP protocol version negotiated in `connect`.
pub const PROTOCOL_VERSION: &str = "1";
