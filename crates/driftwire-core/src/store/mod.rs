//! In-memory document store.
//!
//! Named collections of `_id`-keyed documents, fed by server data
//! frames and queried through [`Cursor`] snapshots. Queries made inside
//! a running computation register computation observers, so the
//! reactive graph reruns consumers when matching documents change.
//!
//! Server-frame application (`apply_*`) returns its observer
//! notifications as [`Dispatch`] values instead of invoking them, so
//! the protocol layer can defer them out of its own lock. The local
//! mutation API on [`Collection`] dispatches inline.

mod cursor;
mod matcher;
mod observer;

use std::collections::BTreeMap;
use std::sync::Arc;

use driftwire_proto::ejson;
use parking_lot::Mutex;
use serde_json::{Map, Value};

pub use cursor::{Cursor, FindOptions, SortOrder};
pub use matcher::{DefaultMatcher, Matcher};
pub use observer::{Dispatch, ObserveCallbacks, ObserverHandle, dispatch_all};

use self::observer::{ComputationObserver, CursorObserver, ObserverState};
use crate::error::StoreError;
use crate::tracker::{ComputationId, Tracker};

/// A stored document: `_id` plus fields.
pub type Document = Map<String, Value>;

/// Collection names that shadow object-prototype members in
/// interoperating ecosystems.
const RESERVED_NAMES: &[&str] =
    &["__proto__", "constructor", "prototype", "hasOwnProperty", "toString", "valueOf"];

struct CollectionData {
    docs: BTreeMap<String, Document>,
    local: bool,
}

#[derive(Default)]
struct StoreState {
    collections: BTreeMap<String, CollectionData>,
}

/// The document store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CollectionStore {
    tracker: Tracker,
    matcher: Arc<dyn Matcher>,
    state: Arc<Mutex<StoreState>>,
    observers: Arc<Mutex<ObserverState>>,
}

impl CollectionStore {
    /// Create an empty store bound to `tracker`, with the built-in
    /// matcher.
    #[must_use]
    pub fn new(tracker: &Tracker) -> Self {
        Self::with_matcher(tracker, DefaultMatcher)
    }

    /// Create an empty store with a custom selector engine.
    #[must_use]
    pub fn with_matcher(tracker: &Tracker, matcher: impl Matcher) -> Self {
        Self {
            tracker: tracker.clone(),
            matcher: Arc::new(matcher),
            state: Arc::default(),
            observers: Arc::default(),
        }
    }

    /// Handle to a named collection, creating it if absent.
    pub fn collection(&self, name: &str) -> Result<Collection, StoreError> {
        self.make_collection(name, false)
    }

    /// Handle to a named *local* collection: never cleared on
    /// reconnect, never written by server frames.
    pub fn local_collection(&self, name: &str) -> Result<Collection, StoreError> {
        self.make_collection(name, true)
    }

    fn make_collection(&self, name: &str, local: bool) -> Result<Collection, StoreError> {
        if RESERVED_NAMES.contains(&name) {
            return Err(StoreError::ReservedName(name.to_string()));
        }
        let mut state = self.state.lock();
        state
            .collections
            .entry(name.to_string())
            .or_insert_with(|| CollectionData { docs: BTreeMap::new(), local });
        Ok(Collection { store: self.clone(), name: name.to_string() })
    }

    /// Apply a server `added` frame. No-op for local collections.
    #[must_use]
    pub fn apply_added(
        &self,
        collection: &str,
        id: &str,
        fields: Option<Map<String, Value>>,
    ) -> Vec<Dispatch> {
        if self.is_local_or_reserved(collection) {
            return Vec::new();
        }
        self.do_added(collection, id, fields)
    }

    /// Apply a server `changed` frame. No-op for local collections.
    #[must_use]
    pub fn apply_changed(
        &self,
        collection: &str,
        id: &str,
        fields: Option<Map<String, Value>>,
        cleared: Option<Vec<String>>,
    ) -> Vec<Dispatch> {
        if self.is_local_or_reserved(collection) {
            return Vec::new();
        }
        self.do_changed(collection, id, fields, cleared)
    }

    /// Apply a server `removed` frame. No-op for local collections.
    #[must_use]
    pub fn apply_removed(&self, collection: &str, id: &str) -> Vec<Dispatch> {
        if self.is_local_or_reserved(collection) {
            return Vec::new();
        }
        self.do_removed(collection, id)
    }

    /// Empty every non-local collection (cold session start). Emits
    /// `removed` notifications for every dropped document.
    #[must_use]
    pub fn clear_remote(&self) -> Vec<Dispatch> {
        let drained: Vec<(String, BTreeMap<String, Document>)> = {
            let mut state = self.state.lock();
            state
                .collections
                .iter_mut()
                .filter(|(_, data)| !data.local)
                .map(|(name, data)| (name.clone(), std::mem::take(&mut data.docs)))
                .collect()
        };

        let mut dispatches = Vec::new();
        for (name, docs) in drained {
            for (id, old) in docs {
                let (batch, invalidated) =
                    self.collect(&name, &ChangeEvent::Removed { id: &id, old: &old });
                dispatches.extend(batch);
                for comp in invalidated {
                    self.tracker.invalidate(comp);
                }
            }
        }
        dispatches
    }

    /// Snapshot query against a collection.
    #[must_use]
    pub fn find(&self, collection: &str, selector: Option<Value>, options: &FindOptions) -> Cursor {
        if let Some(comp) = self.tracker.current() {
            self.register_computation_observer(collection, comp, selector.clone());
        }

        let docs: Vec<Document> = {
            let state = self.state.lock();
            state.collections.get(collection).map_or_else(Vec::new, |data| {
                data.docs
                    .values()
                    .filter(|doc| {
                        selector
                            .as_ref()
                            .is_none_or(|sel| self.matcher.matches(sel, doc))
                    })
                    .cloned()
                    .collect()
            })
        };

        Cursor {
            store: self.clone(),
            collection: collection.to_string(),
            selector,
            docs: options.apply(docs),
        }
    }

    /// First match for a selector, if any.
    #[must_use]
    pub fn find_one(&self, collection: &str, selector: Option<Value>) -> Option<Document> {
        self.find(collection, selector, &FindOptions { limit: Some(1), ..Default::default() })
            .fetch()
            .pop()
    }

    fn is_local_or_reserved(&self, collection: &str) -> bool {
        if RESERVED_NAMES.contains(&collection) {
            tracing::warn!(collection, "ignoring server frame for reserved collection name");
            return true;
        }
        self.state.lock().collections.get(collection).is_some_and(|data| data.local)
    }

    fn do_added(
        &self,
        collection: &str,
        id: &str,
        fields: Option<Map<String, Value>>,
    ) -> Vec<Dispatch> {
        let new = {
            let mut state = self.state.lock();
            let data = state
                .collections
                .entry(collection.to_string())
                .or_insert_with(|| CollectionData { docs: BTreeMap::new(), local: false });
            let mut doc = fields.unwrap_or_default();
            doc.insert("_id".to_string(), Value::from(id));
            data.docs.insert(id.to_string(), doc.clone());
            doc
        };

        let (dispatches, invalidated) = self.collect(collection, &ChangeEvent::Added(&new));
        for comp in invalidated {
            self.tracker.invalidate(comp);
        }
        dispatches
    }

    fn do_changed(
        &self,
        collection: &str,
        id: &str,
        fields: Option<Map<String, Value>>,
        cleared: Option<Vec<String>>,
    ) -> Vec<Dispatch> {
        let (old, new) = {
            let mut state = self.state.lock();
            let data = state
                .collections
                .entry(collection.to_string())
                .or_insert_with(|| CollectionData { docs: BTreeMap::new(), local: false });
            let old = data.docs.get(id).cloned().unwrap_or_else(|| {
                let mut doc = Document::new();
                doc.insert("_id".to_string(), Value::from(id));
                doc
            });
            let mut new = old.clone();
            for (key, value) in fields.unwrap_or_default() {
                new.insert(key, value);
            }
            for key in cleared.unwrap_or_default() {
                new.insert(key, Value::Null);
            }
            data.docs.insert(id.to_string(), new.clone());
            (old, new)
        };

        let (dispatches, invalidated) =
            self.collect(collection, &ChangeEvent::Changed { new: &new, old: &old });
        for comp in invalidated {
            self.tracker.invalidate(comp);
        }
        dispatches
    }

    fn do_removed(&self, collection: &str, id: &str) -> Vec<Dispatch> {
        let old = {
            let mut state = self.state.lock();
            state.collections.get_mut(collection).and_then(|data| data.docs.remove(id))
        };
        let Some(old) = old else {
            tracing::debug!(collection, id, "removed frame for unknown document");
            return Vec::new();
        };

        let (dispatches, invalidated) =
            self.collect(collection, &ChangeEvent::Removed { id, old: &old });
        for comp in invalidated {
            self.tracker.invalidate(comp);
        }
        dispatches
    }

    /// Gather observer notifications for one change. Returns the
    /// cursor-observer dispatches and the computations to invalidate;
    /// the caller invalidates after every lock is released.
    fn collect(
        &self,
        collection: &str,
        event: &ChangeEvent<'_>,
    ) -> (Vec<Dispatch>, Vec<ComputationId>) {
        let observers = self.observers.lock();

        let mut dispatches = Vec::new();
        for cursor in observers.cursors.values().filter(|o| o.collection == collection) {
            match event {
                ChangeEvent::Added(new) => {
                    if self.post_image_matches(cursor.selector.as_ref(), new) {
                        dispatches.push(Dispatch::added(&cursor.callbacks, (*new).clone()));
                    }
                },
                ChangeEvent::Changed { new, old } => {
                    if self.post_image_matches(cursor.selector.as_ref(), new) {
                        dispatches.push(Dispatch::changed(
                            &cursor.callbacks,
                            (*new).clone(),
                            (*old).clone(),
                        ));
                    }
                },
                ChangeEvent::Removed { id, old } => {
                    dispatches.push(Dispatch::removed(
                        &cursor.callbacks,
                        (*id).to_string(),
                        (*old).clone(),
                    ));
                },
            }
        }

        let invalidated = observers
            .computations
            .iter()
            .filter(|((name, _), _)| name == collection)
            .filter(|(_, observer)| self.concerns(observer, event))
            .map(|((_, comp), _)| *comp)
            .collect();

        (dispatches, invalidated)
    }

    fn concerns(&self, observer: &ComputationObserver, event: &ChangeEvent<'_>) -> bool {
        let matches = |doc: &Document| {
            observer.selector.as_ref().is_none_or(|sel| self.matcher.matches(sel, doc))
        };
        match event {
            ChangeEvent::Added(new) => matches(new),
            ChangeEvent::Changed { new, old } => {
                if equal_docs(new, old) {
                    return false;
                }
                matches(new) || matches(old)
            },
            ChangeEvent::Removed { old, .. } => matches(old),
        }
    }

    fn post_image_matches(&self, selector: Option<&Value>, doc: &Document) -> bool {
        selector.is_none_or(|sel| self.matcher.matches(sel, doc))
    }

    pub(crate) fn register_cursor_observer(
        &self,
        collection: &str,
        selector: Option<Value>,
        callbacks: ObserveCallbacks,
    ) -> ObserverHandle {
        let mut observers = self.observers.lock();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.cursors.insert(id, CursorObserver {
            collection: collection.to_string(),
            selector,
            callbacks: Arc::new(Mutex::new(callbacks)),
        });
        ObserverHandle::new(Arc::clone(&self.observers), id)
    }

    fn register_computation_observer(
        &self,
        collection: &str,
        comp: ComputationId,
        selector: Option<Value>,
    ) {
        let key = (collection.to_string(), comp);
        let mut observers = self.observers.lock();
        match observers.computations.get_mut(&key) {
            Some(existing) => {
                // A second find with a different selector widens the
                // observer to the whole collection.
                let same = match (&existing.selector, &selector) {
                    (None, None) => true,
                    (Some(a), Some(b)) => ejson::equals(a, b),
                    _ => false,
                };
                if !same {
                    existing.selector = None;
                }
            },
            None => {
                observers.computations.insert(key.clone(), ComputationObserver { selector });
                drop(observers);
                let registry = Arc::clone(&self.observers);
                self.tracker.on_invalidate(comp, move || {
                    registry.lock().computations.remove(&key);
                });
            },
        }
    }
}

fn equal_docs(a: &Document, b: &Document) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| ejson::equals(v, w)))
}

enum ChangeEvent<'a> {
    Added(&'a Document),
    Changed { new: &'a Document, old: &'a Document },
    Removed { id: &'a str, old: &'a Document },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn store() -> (Tracker, CollectionStore) {
        let tracker = Tracker::new();
        let store = CollectionStore::new(&tracker);
        (tracker, store)
    }

    #[test]
    fn added_then_find() {
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("things", "a", Some(fields(json!({"n": 1})))));

        let doc = store.find_one("things", None).unwrap();
        assert_eq!(doc["_id"], "a");
        assert_eq!(doc["n"], 1);
    }

    #[test]
    fn changed_merges_and_clears() {
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("things", "a", Some(fields(json!({"n": 1, "x": 2})))));
        dispatch_all(store.apply_changed(
            "things",
            "a",
            Some(fields(json!({"n": 5}))),
            Some(vec!["x".to_string()]),
        ));

        let doc = store.find_one("things", None).unwrap();
        assert_eq!(doc["n"], 5);
        assert_eq!(doc["x"], Value::Null);
    }

    #[test]
    fn removed_deletes() {
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("things", "a", None));
        dispatch_all(store.apply_removed("things", "a"));
        assert!(store.find_one("things", None).is_none());
    }

    #[test]
    fn reserved_collection_name_is_rejected() {
        let (_tracker, store) = store();
        assert_eq!(
            store.collection("__proto__").err(),
            Some(StoreError::ReservedName("__proto__".to_string()))
        );
        assert_eq!(
            store.local_collection("hasOwnProperty").err(),
            Some(StoreError::ReservedName("hasOwnProperty".to_string()))
        );
        assert!(store.collection("things").is_ok());
    }

    #[test]
    fn local_collections_ignore_server_frames() {
        let (_tracker, store) = store();
        let local = store.local_collection("drafts").unwrap();
        local.insert_with_id("d1", fields(json!({"text": "hi"})));

        let dispatches = store.apply_added("drafts", "d2", None);
        assert!(dispatches.is_empty());
        assert!(store.find_one("drafts", Some(json!({"_id": "d2"}))).is_none());
        assert!(local.find_one(Some(json!({"_id": "d1"}))).is_some());
    }

    #[test]
    fn clear_remote_preserves_local_collections() {
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("things", "a", None));
        let local = store.local_collection("drafts").unwrap();
        local.insert_with_id("d1", Map::new());

        dispatch_all(store.clear_remote());

        assert!(store.find_one("things", None).is_none());
        assert!(local.find_one(None).is_some());
    }

    #[test]
    fn find_in_computation_reruns_on_matching_change() {
        let (tracker, store) = store();
        dispatch_all(store.apply_added("items", "x", Some(fields(json!({"color": "red"})))));

        let runs = Arc::new(AtomicUsize::new(0));
        let (store2, runs2) = (store.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = store2.find("items", Some(json!({"color": "red"})), &FindOptions::default());
            runs2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        dispatch_all(store.apply_changed(
            "items",
            "x",
            Some(fields(json!({"color": "blue"}))),
            None,
        ));
        tracker.flush();
        // Pre-image matched the selector, so the transition out reruns.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_rewrite_does_not_invalidate() {
        let (tracker, store) = store();
        dispatch_all(store.apply_added("items", "x", Some(fields(json!({"n": 1})))));

        let runs = Arc::new(AtomicUsize::new(0));
        let (store2, runs2) = (store.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = store2.find("items", None, &FindOptions::default());
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dispatch_all(store.apply_changed("items", "x", Some(fields(json!({"n": 1.0}))), None));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unrelated_change_does_not_invalidate_selector_observer() {
        let (tracker, store) = store();
        dispatch_all(store.apply_added("items", "x", Some(fields(json!({"color": "red"})))));
        dispatch_all(store.apply_added("items", "y", Some(fields(json!({"color": "green"})))));

        let runs = Arc::new(AtomicUsize::new(0));
        let (store2, runs2) = (store.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = store2.find("items", Some(json!({"color": "red"})), &FindOptions::default());
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dispatch_all(store.apply_changed(
            "items",
            "y",
            Some(fields(json!({"color": "yellow"}))),
            None,
        ));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cursor_observer_filters_changed_on_post_image() {
        // A red->blue transition must NOT fire `changed` on a red
        // cursor: the post-image no longer matches.
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("items", "x", Some(fields(json!({"color": "red"})))));

        let cursor = store.find("items", Some(json!({"color": "red"})), &FindOptions::default());
        let changed = Arc::new(AtomicUsize::new(0));
        let changed2 = Arc::clone(&changed);
        let _handle = cursor.observe(ObserveCallbacks::new().on_changed(move |_, _| {
            changed2.fetch_add(1, Ordering::SeqCst);
        }));

        dispatch_all(store.apply_changed(
            "items",
            "x",
            Some(fields(json!({"color": "blue"}))),
            None,
        ));
        assert_eq!(changed.load(Ordering::SeqCst), 0);

        // Blue -> red transitions back in; post-image matches now.
        dispatch_all(store.apply_changed(
            "items",
            "x",
            Some(fields(json!({"color": "red"}))),
            None,
        ));
        assert_eq!(changed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cursor_observer_removed_always_fires() {
        let (_tracker, store) = store();
        dispatch_all(store.apply_added("items", "x", Some(fields(json!({"color": "blue"})))));

        let cursor = store.find("items", Some(json!({"color": "red"})), &FindOptions::default());
        let removed = Arc::new(AtomicUsize::new(0));
        let removed2 = Arc::clone(&removed);
        let _handle = cursor.observe(ObserveCallbacks::new().on_removed(move |id, old| {
            assert_eq!(id, "x");
            assert_eq!(old["color"], "blue");
            removed2.fetch_add(1, Ordering::SeqCst);
        }));

        dispatch_all(store.apply_removed("items", "x"));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_observer_is_silent() {
        let (_tracker, store) = store();
        let cursor = store.find("items", None, &FindOptions::default());
        let added = Arc::new(AtomicUsize::new(0));
        let added2 = Arc::clone(&added);
        let handle = cursor.observe(ObserveCallbacks::new().on_added(move |_| {
            added2.fetch_add(1, Ordering::SeqCst);
        }));
        handle.stop();

        dispatch_all(store.apply_added("items", "x", None));
        assert_eq!(added.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn computation_observer_unregisters_on_stop() {
        let (tracker, store) = store();
        let runs = Arc::new(AtomicUsize::new(0));
        let (store2, runs2) = (store.clone(), Arc::clone(&runs));
        let comp = tracker.autorun(move || {
            let _ = store2.find("items", None, &FindOptions::default());
            runs2.fetch_add(1, Ordering::SeqCst);
        });
        comp.stop();

        dispatch_all(store.apply_added("items", "x", None));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_with_selector() {
        let (_tracker, store) = store();
        let coll = store.collection("items").unwrap();
        coll.insert_with_id("a", fields(json!({"color": "red"})));
        coll.insert_with_id("b", fields(json!({"color": "blue"})));
        coll.insert_with_id("c", fields(json!({"color": "red"})));

        assert_eq!(coll.remove(Some(&json!({"color": "red"}))), 2);
        assert_eq!(coll.find(None, &FindOptions::default()).count(), 1);
        assert_eq!(coll.remove(None), 1);
        assert_eq!(coll.find(None, &FindOptions::default()).count(), 0);
    }
}

/// Handle to a named collection.
#[derive(Clone)]
pub struct Collection {
    store: CollectionStore,
    name: String,
}

impl Collection {
    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot query.
    #[must_use]
    pub fn find(&self, selector: Option<Value>, options: &FindOptions) -> Cursor {
        self.store.find(&self.name, selector, options)
    }

    /// First match, if any.
    #[must_use]
    pub fn find_one(&self, selector: Option<Value>) -> Option<Document> {
        self.store.find_one(&self.name, selector)
    }

    /// Insert (or replace) a document under `id`. Observer
    /// notifications fire before this returns.
    pub fn insert_with_id(&self, id: &str, fields: Map<String, Value>) {
        dispatch_all(self.store.do_added(&self.name, id, Some(fields)));
    }

    /// Merge fields into the document under `id`, creating it if
    /// needed.
    pub fn upsert(&self, id: &str, fields: Map<String, Value>) {
        dispatch_all(self.store.do_changed(&self.name, id, Some(fields), None));
    }

    /// Remove the document under `id`. Returns whether it existed.
    pub fn remove_id(&self, id: &str) -> bool {
        let existed = {
            let state = self.store.state.lock();
            state.collections.get(&self.name).is_some_and(|data| data.docs.contains_key(id))
        };
        if existed {
            dispatch_all(self.store.do_removed(&self.name, id));
        }
        existed
    }

    /// Remove every document matching `selector` (all documents when
    /// `None`). Returns how many were removed.
    pub fn remove(&self, selector: Option<&Value>) -> usize {
        let ids: Vec<String> = {
            let state = self.store.state.lock();
            state.collections.get(&self.name).map_or_else(Vec::new, |data| {
                data.docs
                    .iter()
                    .filter(|(_, doc)| {
                        selector.is_none_or(|sel| self.store.matcher.matches(sel, doc))
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
        };
        let count = ids.len();
        for id in ids {
            dispatch_all(self.store.do_removed(&self.name, &id));
        }
        count
    }
}
