//! Shared derived-flow runtime.
//!
//! [`Core`] owns everything the synchronous and asynchronous derived flows
//! have in common: the cached and active computation records, the dirty
//! latch, the listener set and the subscribe/unsubscribe lifecycle. How a new
//! record is produced is left to a [`Strategy`].

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::computation::Computation;
use crate::flow::{FlowKey, FlowValue, Listener, Subscription};
use crate::listeners::ListenerSet;
use crate::tracer::{SharedTracer, Tracer};
use crate::FlowError;

// Thread-local evaluation stack for cycle detection.
thread_local! {
    static EVAL_STACK: RefCell<Vec<FlowKey>> = const { RefCell::new(Vec::new()) };
}

/// Marks a flow as being evaluated on this thread until dropped.
struct EvalGuard;

impl EvalGuard {
    fn enter(key: &FlowKey, tracer: &dyn Tracer) -> Result<Self, FlowError> {
        let cycle = EVAL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|k| k.id == key.id) {
                let mut path = stack.clone();
                path.push(key.clone());
                Some(path)
            } else {
                stack.push(key.clone());
                None
            }
        });

        match cycle {
            Some(path) => {
                tracer.on_cycle_detected(&path);
                Err(FlowError::Cycle {
                    path: path.iter().map(ToString::to_string).collect(),
                })
            }
            None => Ok(EvalGuard),
        }
    }
}

impl Drop for EvalGuard {
    fn drop(&mut self) {
        EVAL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// How a derived flow produces a new computation record.
pub(crate) trait Strategy: Send + Sync + Sized + 'static {
    type Output: FlowValue;
    type Record: AsRef<Computation<Self::Output>> + Send + Sync + 'static;

    /// Start a new computation.
    ///
    /// Implementations must install the returned record with
    /// [`Core::install`] (or [`Core::stage`] and [`Core::commit`]) before
    /// returning.
    fn compute(&self, core: &Arc<Core<Self>>) -> Arc<Self::Record>;
}

// ============================================================================
// Core
// ============================================================================

struct State<R> {
    /// Answers `snapshot()`; may be stale while unwatched.
    cached: Option<Arc<R>>,
    /// Subscribed to its dependencies. Present only while listeners exist.
    active: Option<Arc<R>>,
    dirty: bool,
}

/// A record swapped in as cached whose side effects are still outstanding.
#[must_use]
pub(crate) struct Staged<R> {
    record: Arc<R>,
    retired: Option<Arc<R>>,
    activate: bool,
}

/// Runtime state shared by all clones of a derived flow.
pub(crate) struct Core<S: Strategy> {
    key: FlowKey,
    strategy: S,
    state: Mutex<State<S::Record>>,
    listeners: ListenerSet,
    tracer: SharedTracer,
    /// Subscribed to the dependencies of the active record.
    handler: Listener,
}

impl<S: Strategy> Core<S> {
    pub fn new(key: FlowKey, strategy: S, tracer: SharedTracer) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let handler: Listener = Arc::new(move || match weak.upgrade() {
                Some(core) => core.on_source_change(),
                None => Ok(()),
            });
            Self {
                key,
                strategy,
                state: Mutex::new(State {
                    cached: None,
                    active: None,
                    dirty: false,
                }),
                listeners: ListenerSet::new(),
                tracer,
                handler,
            }
        })
    }

    fn computation(record: &S::Record) -> &Computation<S::Output> {
        <S::Record as AsRef<Computation<S::Output>>>::as_ref(record)
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn tracer(&self) -> &dyn Tracer {
        &*self.tracer
    }

    pub fn shared_tracer(&self) -> &SharedTracer {
        &self.tracer
    }

    pub fn cached(&self) -> Option<Arc<S::Record>> {
        self.state.lock().cached.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Read the current value, recomputing if the cache cannot be trusted.
    pub fn snapshot(self: &Arc<Self>) -> Result<S::Output, FlowError> {
        let record = self.current()?;
        Self::computation(&record).value()
    }

    /// The record answering `snapshot()`, validated or recomputed.
    ///
    /// A watched, clean record is reused as is. Otherwise the record is reused
    /// only if none of its dependencies changed since they were read.
    pub fn current(self: &Arc<Self>) -> Result<Arc<S::Record>, FlowError> {
        let _guard = EvalGuard::enter(&self.key, self.tracer())?;

        let (cached, check) = {
            let mut state = self.state.lock();
            let check = state.active.is_none() || state.dirty;
            state.dirty = false;
            (state.cached.clone(), check)
        };

        let record = match cached {
            Some(record) if !check => record,
            Some(record) => {
                let changed = Self::computation(&record).sources_changed();
                self.tracer.on_cache_check(&self.key, !changed);
                if changed {
                    self.strategy.compute(self)
                } else {
                    record
                }
            }
            None => self.strategy.compute(self),
        };
        Ok(record)
    }

    /// Make `record` the cached record, and the active one while watched.
    ///
    /// Only swaps state; the previous active record is disposed and the new
    /// one subscribed by [`commit`](Self::commit), which must be called
    /// without any lock held.
    pub fn stage(&self, record: &Arc<S::Record>) -> Staged<S::Record> {
        let mut state = self.state.lock();
        state.cached = Some(record.clone());
        if self.listeners.is_empty() {
            return Staged {
                record: record.clone(),
                retired: None,
                activate: false,
            };
        }
        let retired = state
            .active
            .replace(record.clone())
            .filter(|previous| !Arc::ptr_eq(previous, record));
        Staged {
            record: record.clone(),
            retired,
            activate: true,
        }
    }

    pub fn commit(&self, staged: Staged<S::Record>) {
        if let Some(retired) = staged.retired {
            Self::computation(&retired).dispose();
        }
        if staged.activate && self.is_active(&staged.record) {
            Self::computation(&staged.record).subscribe_to_sources(self.handler.clone());
        }
    }

    pub fn install(&self, record: &Arc<S::Record>) {
        let staged = self.stage(record);
        self.commit(staged);
    }

    fn is_active(&self, record: &Arc<S::Record>) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, record))
    }

    /// Register a listener.
    ///
    /// The first listener forces one evaluation so the dependency set is
    /// known; its error is swallowed and re-raised by the next `snapshot()`.
    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        if self.listeners.is_empty() {
            let _ = self.current();
        }

        let (slot, first) = self.listeners.insert(listener);
        if first {
            self.activate();
        }

        let core = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(core) = core.upgrade() {
                core.unsubscribe(slot);
            }
        })
    }

    fn activate(&self) {
        let record = {
            let mut state = self.state.lock();
            if state.active.is_some() {
                return;
            }
            let Some(record) = state.cached.clone() else {
                return;
            };
            state.active = Some(record.clone());
            record
        };
        Self::computation(&record).subscribe_to_sources(self.handler.clone());
    }

    fn unsubscribe(&self, slot: usize) {
        if !self.listeners.remove(slot) {
            return;
        }
        let retired = {
            let mut state = self.state.lock();
            if self.listeners.is_empty() {
                state.active.take()
            } else {
                None
            }
        };
        if let Some(retired) = retired {
            Self::computation(&retired).dispose();
        }
    }

    /// Dirty latch: only the first change after a `snapshot()` notifies.
    fn on_source_change(&self) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock();
            if state.dirty {
                return Ok(());
            }
            state.dirty = true;
        }
        self.tracer.on_dirty(&self.key);
        self.notify()
    }

    /// Call every listener, aggregating failures.
    pub fn notify(&self) -> Result<(), FlowError> {
        match self.listeners.notify() {
            Ok(count) => {
                self.tracer.on_notify(&self.key, count, false);
                Ok(())
            }
            Err(error) => {
                self.tracer
                    .on_notify(&self.key, self.listeners.len(), true);
                Err(error)
            }
        }
    }
}
