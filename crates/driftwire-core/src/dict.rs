//! Reactive key-value dictionary.
//!
//! A string-keyed EJSON map with one [`Dependency`] per key: reading a
//! key inside a computation subscribes that computation to the key, and
//! writes invalidate only the computations that read it. Writing a
//! value deep-equal to the current one is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use driftwire_proto::ejson;
use parking_lot::Mutex;
use serde_json::Value;

use crate::tracker::{Dependency, Tracker};

struct DictState {
    values: HashMap<String, Value>,
    deps: HashMap<String, Dependency>,
}

/// Reactive dictionary. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReactiveDict {
    tracker: Tracker,
    state: Arc<Mutex<DictState>>,
}

impl ReactiveDict {
    /// Create an empty dictionary bound to `tracker`.
    #[must_use]
    pub fn new(tracker: &Tracker) -> Self {
        Self {
            tracker: tracker.clone(),
            state: Arc::new(Mutex::new(DictState {
                values: HashMap::new(),
                deps: HashMap::new(),
            })),
        }
    }

    /// Read a key, subscribing the current computation to it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let dep = self.dep_for(key);
        dep.depend();
        self.state.lock().values.get(key).cloned()
    }

    /// Read a key as a string, subscribing the current computation.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Read a key without subscribing.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.state.lock().values.get(key).cloned()
    }

    /// Write a key, invalidating its readers unless the new value is
    /// EJSON-equal to the old one.
    pub fn set(&self, key: &str, value: Value) {
        let changed = {
            let mut state = self.state.lock();
            let unchanged =
                state.values.get(key).is_some_and(|current| ejson::equals(current, &value));
            if unchanged {
                false
            } else {
                state.values.insert(key.to_string(), value);
                true
            }
        };
        if changed {
            self.dep_for(key).changed();
        }
    }

    /// Remove a key, invalidating its readers if it was present.
    pub fn delete(&self, key: &str) {
        let removed = self.state.lock().values.remove(key).is_some();
        if removed {
            self.dep_for(key).changed();
        }
    }

    fn dep_for(&self, key: &str) -> Dependency {
        let mut state = self.state.lock();
        state
            .deps
            .entry(key.to_string())
            .or_insert_with(|| Dependency::new(&self.tracker))
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn get_inside_computation_subscribes() {
        let tracker = Tracker::new();
        let dict = ReactiveDict::new(&tracker);
        dict.set("userId", json!("u1"));

        let runs = Arc::new(AtomicUsize::new(0));
        let (dict2, runs2) = (dict.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = dict2.get("userId");
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dict.set("userId", json!("u2"));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_write_does_not_invalidate() {
        let tracker = Tracker::new();
        let dict = ReactiveDict::new(&tracker);
        dict.set("n", json!(1));

        let runs = Arc::new(AtomicUsize::new(0));
        let (dict2, runs2) = (dict.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = dict2.get("n");
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dict.set("n", json!(1.0));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_to_other_keys_do_not_invalidate() {
        let tracker = Tracker::new();
        let dict = ReactiveDict::new(&tracker);

        let runs = Arc::new(AtomicUsize::new(0));
        let (dict2, runs2) = (dict.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = dict2.get("a");
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dict.set("b", json!(5));
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_invalidates_readers() {
        let tracker = Tracker::new();
        let dict = ReactiveDict::new(&tracker);
        dict.set("token", json!("t"));

        let runs = Arc::new(AtomicUsize::new(0));
        let (dict2, runs2) = (dict.clone(), Arc::clone(&runs));
        let _comp = tracker.autorun(move || {
            let _ = dict2.get("token");
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        dict.delete("token");
        tracker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(dict.peek("token"), None);
    }
}
