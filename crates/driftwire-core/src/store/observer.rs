//! Change observers.
//!
//! Two observer kinds hang off the store: cursor observers carry
//! explicit callbacks registered through [`super::Cursor::observe`],
//! and computation observers invalidate tracker computations that ran
//! `find` while active. Notifications are materialized as [`Dispatch`]
//! values under the store lock and executed afterwards, so application
//! callbacks never run with a lock held.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::Document;
use crate::guard;
use crate::tracker::ComputationId;

/// Callback for a document entering the observed set.
pub type AddedFn = Box<dyn FnMut(&Document) + Send>;
/// Callback for a changed document: `(new, old)`.
pub type ChangedFn = Box<dyn FnMut(&Document, &Document) + Send>;
/// Callback for a removed document: `(id, old)`.
pub type RemovedFn = Box<dyn FnMut(&str, &Document) + Send>;

/// Callbacks attached to a cursor observer. All optional.
#[derive(Default)]
pub struct ObserveCallbacks {
    added: Option<AddedFn>,
    changed: Option<ChangedFn>,
    removed: Option<RemovedFn>,
}

impl ObserveCallbacks {
    /// Empty callback set; chain the `on_*` builders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the added callback.
    #[must_use]
    pub fn on_added(mut self, f: impl FnMut(&Document) + Send + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    /// Set the changed callback.
    #[must_use]
    pub fn on_changed(mut self, f: impl FnMut(&Document, &Document) + Send + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    /// Set the removed callback.
    #[must_use]
    pub fn on_removed(mut self, f: impl FnMut(&str, &Document) + Send + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }
}

pub(crate) struct CursorObserver {
    pub collection: String,
    pub selector: Option<Value>,
    pub callbacks: Arc<Mutex<ObserveCallbacks>>,
}

pub(crate) struct ComputationObserver {
    /// `None` widens to match-all; set when one computation issues
    /// several finds with different selectors against one collection.
    pub selector: Option<Value>,
}

#[derive(Default)]
pub(crate) struct ObserverState {
    pub next_id: u64,
    pub cursors: BTreeMap<u64, CursorObserver>,
    pub computations: BTreeMap<(String, ComputationId), ComputationObserver>,
}

/// Handle to a registered cursor observer; `stop()` detaches it.
pub struct ObserverHandle {
    state: Arc<Mutex<ObserverState>>,
    id: u64,
}

impl ObserverHandle {
    pub(crate) fn new(state: Arc<Mutex<ObserverState>>, id: u64) -> Self {
        Self { state, id }
    }

    /// Detach the observer. Further changes are not delivered.
    pub fn stop(&self) {
        self.state.lock().cursors.remove(&self.id);
    }
}

enum DispatchKind {
    Added(Document),
    Changed { new: Document, old: Document },
    Removed { id: String, old: Document },
}

/// A pending observer notification.
///
/// Produced under the store lock, executed by [`Dispatch::run`] with no
/// lock held. The protocol layer carries these in its action stream so
/// nothing user-visible runs under the session lock either.
pub struct Dispatch {
    callbacks: Arc<Mutex<ObserveCallbacks>>,
    kind: DispatchKind,
}

impl Dispatch {
    pub(crate) fn added(callbacks: &Arc<Mutex<ObserveCallbacks>>, doc: Document) -> Self {
        Self { callbacks: Arc::clone(callbacks), kind: DispatchKind::Added(doc) }
    }

    pub(crate) fn changed(
        callbacks: &Arc<Mutex<ObserveCallbacks>>,
        new: Document,
        old: Document,
    ) -> Self {
        Self { callbacks: Arc::clone(callbacks), kind: DispatchKind::Changed { new, old } }
    }

    pub(crate) fn removed(
        callbacks: &Arc<Mutex<ObserveCallbacks>>,
        id: String,
        old: Document,
    ) -> Self {
        Self { callbacks: Arc::clone(callbacks), kind: DispatchKind::Removed { id, old } }
    }

    /// Invoke the matching callback.
    ///
    /// The callback is taken out of its slot for the duration of the
    /// call, so a callback that mutates the store (re-entering dispatch)
    /// cannot deadlock on its own slot.
    pub fn run(self) {
        match self.kind {
            DispatchKind::Added(doc) => {
                let taken = self.callbacks.lock().added.take();
                if let Some(mut cb) = taken {
                    guard::protect("observe.added", || cb(&doc));
                    let mut slot = self.callbacks.lock();
                    if slot.added.is_none() {
                        slot.added = Some(cb);
                    }
                }
            },
            DispatchKind::Changed { new, old } => {
                let taken = self.callbacks.lock().changed.take();
                if let Some(mut cb) = taken {
                    guard::protect("observe.changed", || cb(&new, &old));
                    let mut slot = self.callbacks.lock();
                    if slot.changed.is_none() {
                        slot.changed = Some(cb);
                    }
                }
            },
            DispatchKind::Removed { id, old } => {
                let taken = self.callbacks.lock().removed.take();
                if let Some(mut cb) = taken {
                    guard::protect("observe.removed", || cb(&id, &old));
                    let mut slot = self.callbacks.lock();
                    if slot.removed.is_none() {
                        slot.removed = Some(cb);
                    }
                }
            },
        }
    }
}

/// Run a batch of dispatches in order.
pub fn dispatch_all(dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        dispatch.run();
    }
}
