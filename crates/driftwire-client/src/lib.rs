//! Reactive, fault-tolerant DDP client runtime.
//!
//! driftwire keeps a live DDP session over a persistent WebSocket,
//! mirrors server collections into a reactive in-memory store, manages
//! subscription and method lifecycles across reconnects, and resumes
//! token-based logins with exponential backoff.
//!
//! # Architecture
//!
//! The protocol core is a sans-IO state machine ([`conn::DdpConn`]):
//! socket events and frames go in, actions come out, and the driver
//! executes them. [`Client`] is the public façade that owns the session
//! and runs every application callback outside its locks; with the
//! `transport` feature (default) the [`runtime`] module drives it over
//! a tokio-tungstenite WebSocket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use driftwire_client::{Client, ClientConfig, MemoryKeyStorage};
//!
//! # fn main() -> Result<(), driftwire_client::ClientError> {
//! let client = Client::new(
//!     ClientConfig::new("wss://app.example.com/websocket"),
//!     Arc::new(MemoryKeyStorage::new()),
//! )?;
//! let _runtime = driftwire_client::runtime::start(client.clone());
//!
//! let todos = client.collection("todos")?;
//! let sub = client.subscribe("todos.mine", vec![]);
//! let _watch = client.watch(
//!     move || todos.find(None, &Default::default()).count(),
//!     |count| println!("{count} todos"),
//! );
//! # let _ = sub;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod auth;
mod call;
mod client;
mod config;
pub mod conn;
mod error;
pub mod event;
mod queue;
mod storage;
mod subscription;
mod vent;

#[cfg(feature = "transport")]
pub mod runtime;
#[cfg(feature = "transport")]
pub mod transport;

pub use auth::UserSelector;
pub use client::{
    Client, Connectivity, StatusInfo, SubscriptionHandle, VentHandle, WatchHandle, WireCommand,
};
pub use config::ClientConfig;
pub use error::{ClientError, DdpError};
pub use event::{Notice, SocketEvent};
pub use queue::MessageQueue;
pub use storage::{
    KeyStorage, MemoryKeyStorage, StorageError, TOKEN_EXPIRES_KEY, TOKEN_KEY, USER_ID_KEY,
};
pub use subscription::SubCallbacks;
