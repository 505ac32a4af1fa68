//! Method call bookkeeping.
//!
//! A method stays pending from send until its `result` arrives; its id
//! also sits in the write barrier until `updated` clears it. The two
//! are independent — `result` may come before or after `updated`, and
//! no joint ordering is promised to callers. Pending entries retain
//! their serialized frame so reconnects can replay them verbatim.

use std::collections::BTreeSet;

use crate::event::ResultCallback;

/// What kind of method a pending entry is, for result routing and
/// replay priority.
pub(crate) enum MethodKind {
    /// Ordinary application method.
    Plain,
    /// `login`. `resume_token` is set for token resumes, absent for
    /// password logins.
    Login {
        /// Token used for the resume attempt.
        resume_token: Option<String>,
    },
    /// `logout`.
    Logout,
    /// `logoutOtherClients`.
    LogoutOthers,
}

impl MethodKind {
    pub(crate) fn is_login(&self) -> bool {
        matches!(self, Self::Login { .. })
    }
}

/// A method awaiting its `result`.
pub(crate) struct PendingMethod {
    pub id: String,
    /// Serialized frame, kept for in-flight replay.
    pub frame: String,
    /// Whether the frame ever reached the socket. Unsent methods stay
    /// in the ordinary queue and are not replayed (no double-send).
    pub sent: bool,
    pub kind: MethodKind,
    pub callback: Option<ResultCallback>,
}

/// Pending methods in send order, plus the write barrier.
#[derive(Default)]
pub(crate) struct CallRegistry {
    /// Insertion-ordered: replay preserves the original relative order.
    pending: Vec<PendingMethod>,
    write_barrier: BTreeSet<String>,
}

impl CallRegistry {
    pub fn register(&mut self, method: PendingMethod) {
        self.write_barrier.insert(method.id.clone());
        self.pending.push(method);
    }

    /// Remove and return the entry for a `result` frame.
    pub fn take(&mut self, id: &str) -> Option<PendingMethod> {
        let index = self.pending.iter().position(|m| m.id == id)?;
        Some(self.pending.remove(index))
    }

    /// Clear write-barrier entries for an `updated` frame.
    pub fn clear_barrier(&mut self, ids: &[String]) {
        for id in ids {
            self.write_barrier.remove(id);
        }
    }

    /// Flag the pending methods whose frames just went out.
    pub fn mark_sent(&mut self, frames: &[String]) {
        for method in &mut self.pending {
            if !method.sent && frames.iter().any(|f| f == &method.frame) {
                method.sent = true;
            }
        }
    }

    /// In-flight frames to replay on reconnect: login methods first,
    /// then the rest, each group in original send order.
    pub fn replay_frames(&self) -> Vec<String> {
        let logins = self.pending.iter().filter(|m| m.sent && m.kind.is_login());
        let others = self.pending.iter().filter(|m| m.sent && !m.kind.is_login());
        logins.chain(others).map(|m| m.frame.clone()).collect()
    }

    #[cfg(test)]
    pub fn barrier_contains(&self, id: &str) -> bool {
        self.write_barrier.contains(id)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn method(id: &str, kind: MethodKind) -> PendingMethod {
        PendingMethod {
            id: id.to_string(),
            frame: format!("frame-{id}"),
            sent: true,
            kind,
            callback: None,
        }
    }

    #[test]
    fn take_removes_exactly_one() {
        let mut calls = CallRegistry::default();
        calls.register(method("m1", MethodKind::Plain));
        calls.register(method("m2", MethodKind::Plain));

        assert!(calls.take("m1").is_some());
        assert!(calls.take("m1").is_none());
        assert_eq!(calls.pending_len(), 1);
    }

    #[test]
    fn updated_clears_barrier_independently_of_result() {
        let mut calls = CallRegistry::default();
        calls.register(method("m1", MethodKind::Plain));
        assert!(calls.barrier_contains("m1"));

        calls.clear_barrier(&["m1".to_string()]);
        assert!(!calls.barrier_contains("m1"));
        // Still pending: result has not arrived.
        assert_eq!(calls.pending_len(), 1);
    }

    #[test]
    fn replay_puts_login_first_keeping_relative_order() {
        let mut calls = CallRegistry::default();
        calls.register(method("m1", MethodKind::Plain));
        calls.register(method("m2", MethodKind::Login { resume_token: Some("t".to_string()) }));
        calls.register(method("m3", MethodKind::Plain));

        assert_eq!(calls.replay_frames(), vec!["frame-m2", "frame-m1", "frame-m3"]);
    }

    #[test]
    fn unsent_methods_are_not_replayed() {
        let mut calls = CallRegistry::default();
        let mut queued = method("m1", MethodKind::Plain);
        queued.sent = false;
        calls.register(queued);
        calls.register(method("m2", MethodKind::Plain));

        assert_eq!(calls.replay_frames(), vec!["frame-m2"]);

        calls.mark_sent(&["frame-m1".to_string()]);
        assert_eq!(calls.replay_frames(), vec!["frame-m1", "frame-m2"]);
    }
}
