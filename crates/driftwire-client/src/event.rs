//! Events in, actions out.
//!
//! The connection state machine consumes [`SocketEvent`]s and returns
//! [`Action`]s for the driver to execute. Everything user-visible —
//! notices, subscription callbacks, method results, observer
//! notifications — travels in the action list and is dispatched *after*
//! the state machine returns, so application handlers can never reenter
//! the frame parser and never run under the session lock.

use std::sync::Arc;

use driftwire_core::Dispatch;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::DdpError;

/// Transport-level events fed into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket finished its handshake.
    Opened,
    /// The socket closed, for any reason.
    Closed,
    /// The socket reported an error. `message` is already sanitized —
    /// no raw handle or native event object crosses this boundary.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// A text frame arrived.
    Frame(String),
}

/// Public events, delivered to notice listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Session established. `session_reused` is true when the server
    /// echoed the previously remembered session id.
    Connected {
        /// Whether client-held state remains authoritative.
        session_reused: bool,
    },
    /// The socket dropped.
    Disconnected,
    /// Transport error, sanitized.
    SocketError {
        /// Description.
        message: String,
    },
    /// Protocol-level problem: unknown message tag, version rejection.
    ProtocolError {
        /// Description.
        message: String,
    },
    /// A document arrived.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A document changed.
    Changed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A document was removed.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A login (password or resume) succeeded.
    Login {
        /// The logged-in user id.
        user_id: String,
    },
    /// A login attempt failed.
    LoginFailure(DdpError),
    /// The user logged out.
    Logout,
}

/// Method result callback: `Ok(result)` or `Err(normalized)`.
pub type ResultCallback = Box<dyn FnOnce(Result<Value, DdpError>) + Send>;

/// Subscription ready callback.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Subscription error callback.
pub type ErrorCallback = Box<dyn FnOnce(DdpError) + Send>;

/// Subscription stop callback; carries the error when the server
/// killed the subscription.
pub type StopCallback = Box<dyn FnOnce(Option<DdpError>) + Send>;

/// Vent listener, shared so deliveries can be deferred out of the
/// session lock.
pub type VentListener = Arc<Mutex<Box<dyn FnMut(Value) + Send>>>;

/// Work for the driver.
pub enum Action {
    /// Open the WebSocket.
    OpenSocket,
    /// Close the WebSocket.
    CloseSocket,
    /// Write a text frame.
    Send(String),
    /// Deliver a notice to listeners.
    Emit(Notice),
    /// Run a store observer notification.
    Notify(Dispatch),
    /// Deliver a method result.
    InvokeResult {
        /// The caller's callback.
        callback: ResultCallback,
        /// Outcome.
        result: Result<Value, DdpError>,
    },
    /// Fire a subscription's ready callback.
    InvokeReady {
        /// The callback.
        callback: ReadyCallback,
    },
    /// Fire a subscription's error callback.
    InvokeSubError {
        /// The callback.
        callback: ErrorCallback,
        /// The normalized error.
        error: DdpError,
    },
    /// Fire a subscription's stop callback.
    InvokeSubStop {
        /// The callback.
        callback: StopCallback,
        /// The error, when stopped by the server.
        error: Option<DdpError>,
    },
    /// Deliver a vent event.
    InvokeVent {
        /// The registered listener.
        listener: VentListener,
        /// Event payload.
        event: Value,
    },
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenSocket => write!(f, "OpenSocket"),
            Self::CloseSocket => write!(f, "CloseSocket"),
            Self::Send(frame) => f.debug_tuple("Send").field(frame).finish(),
            Self::Emit(notice) => f.debug_tuple("Emit").field(notice).finish(),
            Self::Notify(_) => write!(f, "Notify(..)"),
            Self::InvokeResult { result, .. } => {
                f.debug_struct("InvokeResult").field("result", result).finish_non_exhaustive()
            },
            Self::InvokeReady { .. } => write!(f, "InvokeReady"),
            Self::InvokeSubError { error, .. } => {
                f.debug_struct("InvokeSubError").field("error", error).finish_non_exhaustive()
            },
            Self::InvokeSubStop { error, .. } => {
                f.debug_struct("InvokeSubStop").field("error", error).finish_non_exhaustive()
            },
            Self::InvokeVent { event, .. } => {
                f.debug_struct("InvokeVent").field("event", event).finish_non_exhaustive()
            },
        }
    }
}
