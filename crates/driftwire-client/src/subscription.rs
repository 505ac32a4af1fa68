//! Subscription records.
//!
//! A subscription has two identities: `local_id` names the handle the
//! application holds and stays stable across inactive-reuse, while
//! `remote_id` is whatever id was last put on the wire and changes if
//! the subscription is ever re-issued. Records live in send order so
//! reconnect replay re-subscribes in the order the application
//! subscribed.

use std::collections::BTreeSet;

use driftwire_core::Dependency;
use driftwire_proto::ejson;
use serde_json::Value;

use crate::event::{ErrorCallback, ReadyCallback, StopCallback};

/// Callbacks attached to a subscription activation. All optional; each
/// fires at most once per activation.
#[derive(Default)]
pub struct SubCallbacks {
    pub(crate) on_ready: Option<ReadyCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_stop: Option<StopCallback>,
}

impl SubCallbacks {
    /// Empty callback set; chain the `on_*` builders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the server marks the subscription ready.
    #[must_use]
    pub fn on_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(f));
        self
    }

    /// Called when the server rejects or kills the subscription.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(crate::DdpError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called when the subscription stops, with the error if the stop
    /// came from the server.
    #[must_use]
    pub fn on_stop(mut self, f: impl FnOnce(Option<crate::DdpError>) + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

pub(crate) struct SubRecord {
    pub local_id: String,
    pub remote_id: String,
    pub name: String,
    pub params: Vec<Value>,
    /// The `sub` frame as sent, kept for reconnect replay.
    pub frame: String,
    /// Whether the frame ever reached the socket. Unsent subscriptions
    /// stay in the ordinary queue and are not replayed.
    pub sent: bool,
    /// Marked by a computation rerun; a still-inactive record after the
    /// flush is torn down for real.
    pub inactive: bool,
    pub ready: bool,
    pub ready_dep: Dependency,
    pub callbacks: SubCallbacks,
}

/// All live subscriptions, in subscribe order, plus the set of wire ids
/// whose `nosub` echo must be swallowed.
#[derive(Default)]
pub(crate) struct SubRegistry {
    subs: Vec<SubRecord>,
    self_initiated: BTreeSet<String>,
}

impl SubRegistry {
    pub fn insert(&mut self, record: SubRecord) {
        self.subs.push(record);
    }

    pub fn by_local(&mut self, local_id: &str) -> Option<&mut SubRecord> {
        self.subs.iter_mut().find(|s| s.local_id == local_id)
    }

    pub fn by_remote(&mut self, remote_id: &str) -> Option<&mut SubRecord> {
        self.subs.iter_mut().find(|s| s.remote_id == remote_id)
    }

    pub fn remove_local(&mut self, local_id: &str) -> Option<SubRecord> {
        let index = self.subs.iter().position(|s| s.local_id == local_id)?;
        Some(self.subs.remove(index))
    }

    pub fn remove_remote(&mut self, remote_id: &str) -> Option<SubRecord> {
        let index = self.subs.iter().position(|s| s.remote_id == remote_id)?;
        Some(self.subs.remove(index))
    }

    /// An inactive record with the same name and EJSON-equal params,
    /// eligible for reuse by a rerunning computation.
    pub fn reusable(&mut self, name: &str, params: &[Value]) -> Option<&mut SubRecord> {
        self.subs
            .iter_mut()
            .find(|s| s.inactive && s.name == name && params_equal(&s.params, params))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubRecord> {
        self.subs.iter()
    }

    /// Flag the subscriptions whose frames just went out.
    pub fn mark_sent(&mut self, frames: &[String]) {
        for record in &mut self.subs {
            if !record.sent && frames.iter().any(|f| f == &record.frame) {
                record.sent = true;
            }
        }
    }

    /// Record that we sent `unsub` for this wire id ourselves.
    pub fn mark_self_initiated(&mut self, remote_id: String) {
        self.self_initiated.insert(remote_id);
    }

    /// Swallow-check for an incoming `nosub`: true exactly once per
    /// self-initiated unsub.
    pub fn consume_self_initiated(&mut self, remote_id: &str) -> bool {
        self.self_initiated.remove(remote_id)
    }
}

fn params_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| ejson::equals(x, y))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use driftwire_core::Tracker;
    use serde_json::json;

    use super::*;

    fn record(local: &str, name: &str, params: Vec<Value>, inactive: bool) -> SubRecord {
        let tracker = Tracker::new();
        SubRecord {
            local_id: local.to_string(),
            remote_id: local.to_string(),
            name: name.to_string(),
            params,
            frame: format!("frame-{local}"),
            sent: true,
            inactive,
            ready: false,
            ready_dep: Dependency::new(&tracker),
            callbacks: SubCallbacks::new(),
        }
    }

    #[test]
    fn reuse_requires_inactive_and_equal_params() {
        let mut registry = SubRegistry::default();
        registry.insert(record("s1", "feed", vec![json!({"n": 1})], false));
        registry.insert(record("s2", "feed", vec![json!({"n": 1})], true));
        registry.insert(record("s3", "feed", vec![json!({"n": 2})], true));

        let found = registry.reusable("feed", &[json!({"n": 1.0})]).unwrap();
        assert_eq!(found.local_id, "s2");
        assert!(registry.reusable("feed", &[json!({"n": 3})]).is_none());
        assert!(registry.reusable("other", &[json!({"n": 1})]).is_none());
    }

    #[test]
    fn self_initiated_unsub_consumed_once() {
        let mut registry = SubRegistry::default();
        registry.mark_self_initiated("r1".to_string());
        assert!(registry.consume_self_initiated("r1"));
        assert!(!registry.consume_self_initiated("r1"));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut registry = SubRegistry::default();
        registry.insert(record("b", "feed", vec![], false));
        registry.insert(record("a", "feed", vec![], false));
        let order: Vec<&str> = registry.iter().map(|s| s.local_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }
}
