//! Store error types.

use thiserror::Error;

/// Errors raised by the collection store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The collection name collides with a reserved identifier.
    ///
    /// Names like `__proto__` or `constructor` shadow object-prototype
    /// members in the ecosystems this protocol interoperates with, so
    /// they are rejected outright rather than risking confusion at the
    /// boundary.
    #[error("'{0}' is a reserved name and cannot be used as a collection name")]
    ReservedName(String),
}
