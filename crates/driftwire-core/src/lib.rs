//! Reactive substrate for the DDP client.
//!
//! This crate owns everything below the protocol layer: the
//! invalidation-driven dependency graph ([`tracker`]), the in-memory
//! document store with live queries ([`store`]), the reactive
//! dictionary ([`dict`]), and the [`env::Environment`] seam that
//! injects time and randomness so every state machine above it can be
//! tested deterministically.
//!
//! # Architecture
//!
//! All shared state lives behind cheap-to-clone handles. Application
//! closures (computations, observer callbacks) always execute with no
//! internal lock held, so they can freely call back into the store, the
//! tracker, or the client.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod dict;
pub mod env;
mod error;
pub mod guard;
pub mod store;
pub mod tracker;

pub use dict::ReactiveDict;
pub use env::{Environment, SystemEnv};
pub use error::StoreError;
pub use store::{
    Collection, CollectionStore, Cursor, Dispatch, Document, FindOptions, ObserveCallbacks,
    ObserverHandle, SortOrder,
};
pub use tracker::{Computation, ComputationId, Dependency, Tracker};
