//! Reactive dependency graph.
//!
//! A [`Computation`] is a rerunnable closure; a [`Dependency`] is a set
//! of computations to invalidate when a data source changes. Reruns are
//! batched: any number of `changed()` calls within one tick collapse
//! into a single flush cycle with one rerun per computation.
//!
//! Computations live in an ordered map keyed by numeric id, and
//! dependency membership is tracked by id lookup, so teardown never has
//! to chase pointer cycles. Closures always execute with no registry
//! lock held; application code inside a computation can freely call
//! back into the tracker, the store, or the client.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::guard;

/// Identifier of a computation in the graph.
pub type ComputationId = u64;

type DependentSet = Arc<Mutex<BTreeSet<ComputationId>>>;

struct ComputationRecord {
    /// Taken out of the record while running, which doubles as a
    /// re-entrancy guard.
    func: Option<Box<dyn FnMut() + Send>>,
    invalidated: bool,
    stopped: bool,
    on_invalidate: Vec<Box<dyn FnOnce() + Send>>,
    /// Dependency sets this computation is a member of; cleared (and
    /// membership revoked) on every invalidation, rebuilt on rerun.
    memberships: Vec<DependentSet>,
}

#[derive(Default)]
struct TrackerState {
    next_id: ComputationId,
    computations: BTreeMap<ComputationId, ComputationRecord>,
    current: Option<ComputationId>,
    pending: VecDeque<ComputationId>,
    after_flush: VecDeque<Box<dyn FnOnce() + Send>>,
    in_flush: bool,
    notifier: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// The reactive graph. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Tracker {
    state: Arc<Mutex<TrackerState>>,
}

impl Tracker {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the scheduler callback invoked whenever a flush becomes
    /// required. The driver is expected to call [`Tracker::flush`] soon
    /// after. Without a notifier, flushes are manual.
    pub fn set_flush_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) {
        self.state.lock().notifier = Some(Arc::new(notifier));
    }

    /// Id of the computation currently running, if any.
    #[must_use]
    pub fn current(&self) -> Option<ComputationId> {
        self.state.lock().current
    }

    /// Whether a computation is currently running.
    #[must_use]
    pub fn active(&self) -> bool {
        self.current().is_some()
    }

    /// Create a computation from `func`, run it once, and rerun it in a
    /// batched flush after every invalidation until stopped.
    pub fn autorun(&self, func: impl FnMut() + Send + 'static) -> Computation {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.computations.insert(id, ComputationRecord {
                func: Some(Box::new(func)),
                invalidated: false,
                stopped: false,
                on_invalidate: Vec::new(),
                memberships: Vec::new(),
            });
            id
        };
        self.run_computation(id);
        Computation { tracker: self.clone(), id }
    }

    /// Run `func` with no current computation, so reads inside it do
    /// not establish dependencies.
    pub fn nonreactive<R>(&self, func: impl FnOnce() -> R) -> R {
        let previous = self.state.lock().current.take();
        let result = func();
        self.state.lock().current = previous;
        result
    }

    /// Register `hook` to fire on the next invalidation (or stop) of
    /// computation `id`. Hooks fire once and are re-registered by the
    /// computation's next run if needed.
    pub fn on_invalidate(&self, id: ComputationId, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if let Some(record) = state.computations.get_mut(&id) {
            if record.stopped {
                drop(state);
                guard::protect("on_invalidate", hook);
            } else {
                record.on_invalidate.push(Box::new(hook));
            }
        }
    }

    /// Queue `func` to run at the end of the current flush cycle (or of
    /// the next one, if no flush is in progress).
    pub fn after_flush(&self, func: impl FnOnce() + Send + 'static) {
        let needs_schedule = {
            let mut state = self.state.lock();
            state.after_flush.push_back(Box::new(func));
            !state.in_flush
        };
        if needs_schedule {
            self.request_flush();
        }
    }

    /// Rerun every invalidated computation, then drain the after-flush
    /// queue. Invalidations caused by the reruns themselves are
    /// processed in the same cycle; a nested `flush()` call is a no-op.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            if state.in_flush {
                return;
            }
            state.in_flush = true;
        }

        loop {
            let next = self.state.lock().pending.pop_front();
            if let Some(id) = next {
                let runnable = self
                    .state
                    .lock()
                    .computations
                    .get(&id)
                    .is_some_and(|r| r.invalidated && !r.stopped);
                if runnable {
                    self.run_computation(id);
                }
                continue;
            }

            let hook = self.state.lock().after_flush.pop_front();
            match hook {
                Some(hook) => guard::protect("after_flush", hook),
                None => break,
            }
        }

        self.state.lock().in_flush = false;
    }

    /// Mark computation `id` invalidated: revoke its dependency
    /// membership, fire its invalidation hooks, and schedule a flush.
    pub fn invalidate(&self, id: ComputationId) {
        let (hooks, memberships, schedule) = {
            let mut state = self.state.lock();
            let Some(record) = state.computations.get_mut(&id) else {
                return;
            };
            if record.invalidated {
                return;
            }
            record.invalidated = true;
            let hooks = std::mem::take(&mut record.on_invalidate);
            let memberships = std::mem::take(&mut record.memberships);
            let schedule = !record.stopped;
            if schedule {
                state.pending.push_back(id);
            }
            (hooks, memberships, schedule)
        };

        for set in memberships {
            set.lock().remove(&id);
        }
        for hook in hooks {
            guard::protect("on_invalidate", hook);
        }
        if schedule {
            self.request_flush();
        }
    }

    /// Stop computation `id`: fire pending invalidation hooks, revoke
    /// dependency membership, and drop the record. Stopped computations
    /// never rerun.
    pub fn stop(&self, id: ComputationId) {
        let (hooks, memberships) = {
            let mut state = self.state.lock();
            let Some(record) = state.computations.get_mut(&id) else {
                return;
            };
            record.stopped = true;
            let already_invalidated = record.invalidated;
            record.invalidated = true;
            let hooks = if already_invalidated {
                Vec::new()
            } else {
                std::mem::take(&mut record.on_invalidate)
            };
            let memberships = std::mem::take(&mut record.memberships);
            (hooks, memberships)
        };

        for set in memberships {
            set.lock().remove(&id);
        }
        for hook in hooks {
            guard::protect("on_invalidate", hook);
        }

        // Record removal waits until hooks ran: a hook may query the
        // tracker about this computation.
        self.state.lock().computations.remove(&id);
    }

    fn request_flush(&self) {
        let notifier = {
            let state = self.state.lock();
            if state.in_flush { None } else { state.notifier.clone() }
        };
        if let Some(notifier) = notifier {
            notifier();
        }
    }

    fn run_computation(&self, id: ComputationId) {
        let (mut func, previous) = {
            let mut state = self.state.lock();
            let Some(record) = state.computations.get_mut(&id) else {
                return;
            };
            if record.stopped {
                return;
            }
            record.invalidated = false;
            let Some(func) = record.func.take() else {
                return;
            };
            (func, std::mem::replace(&mut state.current, Some(id)))
        };

        let panicked =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func())).is_err();

        let mut state = self.state.lock();
        state.current = previous;
        if let Some(record) = state.computations.get_mut(&id) {
            record.func = Some(func);
        }
        drop(state);

        if panicked {
            tracing::error!(computation = id, "computation panicked; stopping it");
            self.stop(id);
        }
    }

    fn record_membership(&self, id: ComputationId, set: &DependentSet) {
        let mut state = self.state.lock();
        if let Some(record) = state.computations.get_mut(&id) {
            record.memberships.push(Arc::clone(set));
        }
    }
}

/// Handle to a computation in the graph.
#[derive(Clone)]
pub struct Computation {
    tracker: Tracker,
    id: ComputationId,
}

impl Computation {
    /// Graph id of this computation.
    #[must_use]
    pub fn id(&self) -> ComputationId {
        self.id
    }

    /// Schedule a rerun.
    pub fn invalidate(&self) {
        self.tracker.invalidate(self.id);
    }

    /// Detach from every dependency and prevent further runs.
    pub fn stop(&self) {
        self.tracker.stop(self.id);
    }

    /// Register a one-shot invalidation hook.
    pub fn on_invalidate(&self, hook: impl FnOnce() + Send + 'static) {
        self.tracker.on_invalidate(self.id, hook);
    }
}

/// A set of computations to invalidate when the underlying data source
/// changes.
#[derive(Clone)]
pub struct Dependency {
    tracker: Tracker,
    dependents: DependentSet,
}

impl Dependency {
    /// Create a dependency bound to `tracker`.
    #[must_use]
    pub fn new(tracker: &Tracker) -> Self {
        Self { tracker: tracker.clone(), dependents: Arc::default() }
    }

    /// Subscribe the current computation, if one is running. Returns
    /// whether a new edge was recorded.
    pub fn depend(&self) -> bool {
        let Some(id) = self.tracker.current() else {
            return false;
        };
        let inserted = self.dependents.lock().insert(id);
        if inserted {
            self.tracker.record_membership(id, &self.dependents);
        }
        inserted
    }

    /// Invalidate every dependent computation and schedule a flush.
    pub fn changed(&self) {
        let ids: Vec<ComputationId> = self.dependents.lock().iter().copied().collect();
        for id in ids {
            self.tracker.invalidate(id);
        }
    }

    /// Whether any computation currently depends on this source.
    #[must_use]
    pub fn has_dependents(&self) -> bool {
        !self.dependents.lock().is_empty()
    }
}
