//! Key storage seam.
//!
//! Auth tokens survive restarts through an injected [`KeyStorage`]
//! implementation. Storage is best-effort everywhere it is used: read
//! and write failures are logged and ignored, never allowed to break a
//! login flow.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Storage key for the resume token.
pub const TOKEN_KEY: &str = "Meteor.loginToken";

/// Storage key for the token expiry (ISO-8601 string).
pub const TOKEN_EXPIRES_KEY: &str = "Meteor.loginTokenExpires";

/// Storage key for the logged-in user id.
pub const USER_ID_KEY: &str = "Meteor.userId";

/// A storage backend failure. Carried for logging only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("key storage error: {0}")]
pub struct StorageError(pub String);

/// Persistent string key-value storage.
///
/// Implementations must tolerate concurrent reads and writes; beyond
/// that, anything goes — the client treats every call as fallible and
/// never depends on a write having stuck.
pub trait KeyStorage: Send + Sync + 'static {
    /// Read a key.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a key.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a key.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default, Clone)]
pub struct MemoryKeyStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Best-effort read; failures are logged and read as absent.
pub(crate) fn read_key(storage: &dyn KeyStorage, key: &str) -> Option<String> {
    match storage.get_item(key) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key, %err, "key storage read failed");
            None
        },
    }
}

/// Best-effort write; failures are logged and swallowed.
pub(crate) fn write_key(storage: &dyn KeyStorage, key: &str, value: Option<&str>) {
    let result = match value {
        Some(value) => storage.set_item(key, value),
        None => storage.remove_item(key),
    };
    if let Err(err) = result {
        tracing::warn!(key, %err, "key storage write failed");
    }
}
