//! Side-channel event routing.
//!
//! Vent rides on top of `changed` frames: a frame carrying the
//! `__vent` sentinel is not a document update but an event delivery,
//! routed to the listener registered under the frame's id. Listeners
//! are keyed by the local subscription id the application passed as the
//! first subscribe parameter.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::event::VentListener;

/// Registered vent listeners. Cheap to clone; clones share state.
#[derive(Default, Clone)]
pub(crate) struct VentRegistry {
    listeners: Arc<Mutex<BTreeMap<String, VentListener>>>,
}

impl VentRegistry {
    pub fn register(&self, id: String, listener: impl FnMut(Value) + Send + 'static) {
        self.listeners.lock().insert(id, Arc::new(Mutex::new(Box::new(listener))));
    }

    pub fn unregister(&self, id: &str) {
        self.listeners.lock().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<VentListener> {
        self.listeners.lock().get(id).cloned()
    }

    /// Drop every listener.
    pub fn reset(&self) {
        self.listeners.lock().clear();
    }
}
