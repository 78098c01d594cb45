//! Asynchronous derived flows.
//!
//! Every recomputation of an [`AsyncDerived`] is an asynchronous computation
//! tagged with an [`Epoch`]. Computations may settle in any order; epoch
//! arbitration makes the last started one win:
//!
//! - Starting a computation raises the arbitration floor to its epoch and
//!   cancels the tokens of all computations still in flight. They keep
//!   running until their derivation observes the token or finishes.
//! - A completion below the floor is outdated. An outdated success only
//!   refreshes the `data` previewed by the pending state; everything else
//!   about it is dropped.
//! - A completion at or above the floor settles the flow. Pending and error
//!   states carry the data of the last finished computation.
//! - A winning computation that was skipped or cancelled reverts, most
//!   recent first, to a computation still in flight, to the last finished
//!   state, to the configured initial state, or surfaces the cancellation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::computation::{AsyncComputation, Epoch, FlowFuture};
use crate::flow::{AsyncFlow, Flow, FlowKey, FlowValue, Subscription};
use crate::runtime::{Core, Strategy};
use crate::spawn::{Spawner, TokioSpawner};
use crate::state::AsyncState;
use crate::tracer::{self, ComputeResult, RevertTarget, SharedTracer, Tracer};
use crate::FlowError;

/// Function type deciding whether two payloads are equivalent.
///
/// Used by [`AsyncDerivedBuilder::equals`] to suppress notifications.
pub type EqualsFn<T> = fn(&T, &T) -> bool;

type AsyncDeriveFn<T> =
    Box<dyn Fn(AsyncContext<T>) -> BoxFuture<'static, Result<T, FlowError>> + Send + Sync>;

// ============================================================================
// Context
// ============================================================================

/// Context passed to an asynchronous derivation.
///
/// The context is owned and cheap to clone, so it can be moved into the
/// derivation's future.
pub struct AsyncContext<T> {
    record: Arc<AsyncComputation<T>>,
    owner: FlowKey,
    tracer: SharedTracer,
}

impl<T> Clone for AsyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            owner: self.owner.clone(),
            tracer: self.tracer.clone(),
        }
    }
}

impl<T: FlowValue> AsyncContext<T> {
    /// Read `flow` and record it as a dependency.
    ///
    /// # Errors
    ///
    /// Re-raises the error `flow` is in.
    pub fn get<F: Flow>(&self, flow: &F) -> Result<F::Output, FlowError> {
        self.record.add_source(flow);
        self.tracer.on_dependency_registered(&self.owner, &flow.key());
        let outcome = flow.snapshot();
        self.record.set_source_snapshot(flow, outcome.clone());
        outcome
    }

    /// Record `flow` as a dependency and wait for its current computation.
    ///
    /// # Errors
    ///
    /// Returns the error the awaited computation settled with.
    pub async fn get_async<F: AsyncFlow>(&self, flow: &F) -> Result<F::Data, FlowError> {
        self.record.add_source(flow);
        self.tracer.on_dependency_registered(&self.owner, &flow.key());
        let outcome = flow.settled().await;
        self.record.set_source_snapshot(flow, flow.snapshot());
        outcome
    }

    /// Abandon this computation and fall back to an earlier state.
    ///
    /// Always returns `Err(FlowError::Cancelled)`; return it from the
    /// derivation right away.
    pub fn skip<R>(&self) -> Result<R, FlowError> {
        Err(FlowError::Cancelled)
    }

    /// Token cancelled as soon as a newer computation starts.
    pub fn signal(&self) -> &CancellationToken {
        self.record.token()
    }

    /// Fail with `FlowError::Cancelled` if a newer computation has started.
    pub fn check_cancelled(&self) -> Result<(), FlowError> {
        if self.record.token().is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Epoch of the running computation.
    pub fn epoch(&self) -> Epoch {
        self.record.epoch()
    }
}

// ============================================================================
// Arbitration
// ============================================================================

struct Book<T> {
    /// Epoch of the most recently started computation.
    current: Epoch,
    /// Lowest epoch whose completion may settle the flow.
    floor: Epoch,
    /// Epoch of the freshest data shown so far.
    preview: Epoch,
    in_flight: BTreeMap<Epoch, Arc<AsyncComputation<T>>>,
    last_finished: Option<(Epoch, AsyncState<T>)>,
}

impl<T: Clone> Book<T> {
    fn last_data(&self) -> Option<T> {
        self.last_finished
            .as_ref()
            .and_then(|(_, state)| state.data().cloned())
    }
}

/// Arbitration decision reported to the tracer.
enum Decision {
    Applied,
    Preview,
    Discarded { floor: Epoch },
    Reverted(RevertTarget),
}

/// Work left after the book is released.
struct Settlement<T> {
    decision: Decision,
    resolve: Option<(Arc<AsyncComputation<T>>, Result<T, FlowError>)>,
    dispose: Option<Arc<AsyncComputation<T>>>,
    notify: bool,
}

pub(crate) struct AsyncStrategy<T> {
    derive: AsyncDeriveFn<T>,
    book: Mutex<Book<T>>,
    initial: Option<AsyncState<T>>,
    equals: Option<EqualsFn<T>>,
    spawner: Arc<dyn Spawner>,
}

impl<T: FlowValue> Strategy for AsyncStrategy<T> {
    type Output = AsyncState<T>;
    type Record = AsyncComputation<T>;

    fn compute(&self, core: &Arc<Core<Self>>) -> Arc<AsyncComputation<T>> {
        let (record, superseded, staged) = {
            let mut book = self.book.lock();
            let epoch = book.current.next();
            book.current = epoch;
            book.floor = epoch;

            let record = Arc::new(AsyncComputation::new(
                epoch,
                AsyncState::Pending {
                    data: book.last_data(),
                },
            ));
            let superseded: Vec<_> = book.in_flight.values().cloned().collect();
            for previous in &superseded {
                previous.forward_waiters(&record);
            }
            book.in_flight.insert(epoch, record.clone());
            let staged = core.stage(&record);
            (record, superseded, staged)
        };

        for previous in superseded {
            previous.token().cancel();
        }
        core.commit(staged);
        core.tracer().on_compute_start(core.key(), Some(record.epoch()));

        let future = (self.derive)(AsyncContext {
            record: record.clone(),
            owner: core.key().clone(),
            tracer: core.shared_tracer().clone(),
        });
        let weak = Arc::downgrade(core);
        let task = {
            let record = record.clone();
            async move {
                let outcome = future.await;
                if let Some(core) = weak.upgrade() {
                    core.strategy().settle(&core, &record, outcome);
                }
            }
        };
        if let Err(error) = self.spawner.spawn(task.boxed()) {
            // Still inside `snapshot()`; listeners hear about it on their next read.
            self.finish(core, &record, Err(error));
        }
        record
    }
}

impl<T: FlowValue> AsyncStrategy<T> {
    fn settle(
        &self,
        core: &Arc<Core<Self>>,
        record: &Arc<AsyncComputation<T>>,
        outcome: Result<T, FlowError>,
    ) {
        if self.finish(core, record, outcome) {
            // Failures belong to whoever triggers a change; nobody does here.
            let _ = core.notify();
        }
    }

    /// Arbitrate a completed computation. Returns whether listeners should
    /// be notified.
    fn finish(
        &self,
        core: &Core<Self>,
        record: &Arc<AsyncComputation<T>>,
        outcome: Result<T, FlowError>,
    ) -> bool {
        let epoch = record.epoch();
        core.tracer()
            .on_compute_end(core.key(), Some(epoch), ComputeResult::of(&outcome));
        record.finalize();

        let settlement = {
            let mut book = self.book.lock();
            book.in_flight.remove(&epoch);
            let cached = core.cached();
            let shown = cached.as_ref().map(|cached| cached.state());
            let finished = book.last_finished.as_ref().map(|(_, state)| state.clone());

            let mut settlement = if epoch < book.floor {
                Self::discard(&mut book, cached.as_ref(), record, outcome)
            } else {
                self.apply(&mut book, cached.as_ref(), record, outcome)
            };

            // A settled state is compared with the last settled one, not with
            // the pending state seeded in between.
            let before = match settlement.decision {
                Decision::Applied => finished,
                _ => shown,
            };
            if settlement.notify {
                if let (Some(equals), Some(before), Some(cached)) = (self.equals, before, &cached) {
                    settlement.notify = !before.equivalent(&cached.state(), equals);
                }
            }
            settlement
        };

        let (key, tracer) = (core.key(), core.tracer());
        match settlement.decision {
            Decision::Applied => {}
            Decision::Preview => tracer.on_preview(key, epoch),
            Decision::Discarded { floor } => tracer.on_epoch_discarded(key, epoch, floor),
            Decision::Reverted(target) => tracer.on_revert(key, epoch, target),
        }
        if let Some((record, outcome)) = settlement.resolve {
            record.resolve(outcome);
        }
        if let Some(record) = settlement.dispose {
            record.dispose();
        }
        settlement.notify
    }

    /// Handle an outdated completion.
    fn discard(
        book: &mut Book<T>,
        cached: Option<&Arc<AsyncComputation<T>>>,
        record: &Arc<AsyncComputation<T>>,
        outcome: Result<T, FlowError>,
    ) -> Settlement<T> {
        let epoch = record.epoch();
        let mut settlement = Settlement {
            decision: Decision::Discarded { floor: book.floor },
            resolve: None,
            dispose: Some(record.clone()),
            notify: false,
        };

        let preview = match (outcome, cached) {
            (Ok(data), Some(cached)) if cached.state().is_pending() && epoch > book.preview => {
                Some((data, cached))
            }
            _ => None,
        };
        if let Some((data, cached)) = preview {
            book.preview = epoch;
            cached.set_value(AsyncState::Pending { data: Some(data) });
            settlement.decision = Decision::Preview;
            settlement.notify = true;
        }
        settlement
    }

    /// Handle a completion at or above the arbitration floor.
    fn apply(
        &self,
        book: &mut Book<T>,
        cached: Option<&Arc<AsyncComputation<T>>>,
        record: &Arc<AsyncComputation<T>>,
        outcome: Result<T, FlowError>,
    ) -> Settlement<T> {
        let epoch = record.epoch();
        let is_cached = cached.is_some_and(|cached| Arc::ptr_eq(cached, record));
        let show = |state: &AsyncState<T>| {
            record.set_value(state.clone());
            if let Some(cached) = cached {
                if !is_cached {
                    cached.set_value(state.clone());
                }
            }
        };
        let mut settlement = Settlement {
            decision: Decision::Applied,
            resolve: None,
            dispose: (!is_cached).then(|| record.clone()),
            notify: true,
        };

        match outcome {
            Err(FlowError::Cancelled) => {
                let pending = book
                    .in_flight
                    .iter()
                    .next_back()
                    .map(|(epoch, pending)| (*epoch, pending.clone()));
                if let Some((pending_epoch, pending)) = pending {
                    book.floor = pending_epoch;
                    record.forward_waiters(&pending);
                    let data = cached
                        .and_then(|cached| cached.state().data().cloned())
                        .or_else(|| pending.state().data().cloned());
                    show(&AsyncState::Pending { data });
                    settlement.decision = Decision::Reverted(RevertTarget::Pending(pending_epoch));
                } else if let Some((finished_epoch, state)) = book.last_finished.clone() {
                    show(&state);
                    settlement.resolve = Some((record.clone(), Self::result_of(state)));
                    settlement.decision =
                        Decision::Reverted(RevertTarget::Finished(finished_epoch));
                } else if let Some(initial) = self.initial.clone() {
                    show(&initial);
                    settlement.resolve = Some((record.clone(), Self::result_of(initial)));
                    settlement.decision = Decision::Reverted(RevertTarget::Initial);
                } else {
                    show(&AsyncState::Error {
                        error: FlowError::Cancelled,
                        data: None,
                    });
                    settlement.resolve = Some((record.clone(), Err(FlowError::Cancelled)));
                    settlement.decision = Decision::Reverted(RevertTarget::Surfaced);
                }
            }
            Ok(data) => {
                let state = AsyncState::Success { data: data.clone() };
                show(&state);
                book.last_finished = Some((epoch, state));
                book.preview = book.preview.max(epoch);
                settlement.resolve = Some((record.clone(), Ok(data)));
            }
            Err(error) => {
                let state = AsyncState::Error {
                    error: error.clone(),
                    data: book.last_data(),
                };
                show(&state);
                book.last_finished = Some((epoch, state));
                book.preview = book.preview.max(epoch);
                settlement.resolve = Some((record.clone(), Err(error)));
            }
        }
        settlement
    }

    fn result_of(state: AsyncState<T>) -> Result<T, FlowError> {
        state.into_result().unwrap_or(Err(FlowError::Cancelled))
    }
}

// ============================================================================
// Flow
// ============================================================================

/// A flow computed from other flows by an asynchronous function.
///
/// Its value is an [`AsyncState`]. Reading a stale flow starts a new
/// computation in the background and returns its pending state right away;
/// listeners are notified when it settles.
///
/// This is cheap to clone - all clones share the same computations and
/// listeners.
///
/// # Example
///
/// ```
/// use reflow::{AsyncDerived, AsyncFlow, AsyncState, Flow, FlowError, Source};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let id = Source::new(7);
/// let user = AsyncDerived::new({
///     let id = id.clone();
///     move |ctx| {
///         let id = ctx.get(&id);
///         async move { Ok::<_, FlowError>(format!("user-{}", id?)) }
///     }
/// });
///
/// assert_eq!(user.snapshot().unwrap(), AsyncState::Pending { data: None });
/// assert_eq!(user.settled().await.unwrap(), "user-7");
/// assert_eq!(user.snapshot().unwrap(), AsyncState::success("user-7".to_string()));
/// # }
/// ```
pub struct AsyncDerived<T: FlowValue> {
    core: Arc<Core<AsyncStrategy<T>>>,
}

impl<T: FlowValue> Clone for AsyncDerived<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: FlowValue> AsyncDerived<T> {
    /// Create an asynchronous derived flow with default settings.
    pub fn new<F, Fut>(derive: F) -> Self
    where
        F: Fn(AsyncContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FlowError>> + Send + 'static,
    {
        Self::builder(derive).build()
    }

    /// Create a builder to customize the flow.
    pub fn builder<F, Fut>(derive: F) -> AsyncDerivedBuilder<T>
    where
        F: Fn(AsyncContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FlowError>> + Send + 'static,
    {
        AsyncDerivedBuilder {
            derive: Box::new(move |ctx| derive(ctx).boxed()),
            initial: None,
            equals: None,
            spawner: Arc::new(TokioSpawner),
            label: None,
            tracer: tracer::noop(),
        }
    }

    /// Handle to the outcome of the current computation.
    ///
    /// Forces a `snapshot()` first. Repeated calls return the same handle as
    /// long as no new computation was started. If the computation is
    /// superseded, the handle follows its successor.
    pub fn as_future(&self) -> FlowFuture<T> {
        match self.core.current() {
            Ok(record) => record.handle(),
            Err(error) => futures::future::ready(Err(error)).boxed().shared(),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.core.listener_count()
    }

    /// Whether a dependency changed since the value was last read.
    pub fn is_dirty(&self) -> bool {
        self.core.is_dirty()
    }

    /// Epoch of the most recently started computation.
    pub fn current_epoch(&self) -> Epoch {
        self.core.strategy().book.lock().current
    }

    /// Number of computations that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.core.strategy().book.lock().in_flight.len()
    }
}

impl<T: FlowValue> Flow for AsyncDerived<T> {
    type Output = AsyncState<T>;

    fn key(&self) -> FlowKey {
        self.core.key().clone()
    }

    fn snapshot(&self) -> Result<AsyncState<T>, FlowError> {
        self.core.snapshot()
    }

    fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn() -> Result<(), FlowError> + Send + Sync + 'static,
    {
        self.core.subscribe(Arc::new(listener))
    }
}

#[async_trait::async_trait]
impl<T: FlowValue> AsyncFlow for AsyncDerived<T> {
    type Data = T;

    async fn settled(&self) -> Result<T, FlowError> {
        self.as_future().await
    }
}

impl<T: FlowValue> std::fmt::Debug for AsyncDerived<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDerived")
            .field("key", self.core.key())
            .field("epoch", &self.current_epoch())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Builder for [`AsyncDerived`].
pub struct AsyncDerivedBuilder<T> {
    derive: AsyncDeriveFn<T>,
    initial: Option<AsyncState<T>>,
    equals: Option<EqualsFn<T>>,
    spawner: Arc<dyn Spawner>,
    label: Option<Arc<str>>,
    tracer: SharedTracer,
}

impl<T: FlowValue> AsyncDerivedBuilder<T> {
    /// State shown when a computation is skipped or cancelled and there is
    /// neither a computation in flight nor a finished one to fall back to.
    pub fn initial_value(mut self, state: AsyncState<T>) -> Self {
        self.initial = Some(state);
        self
    }

    /// Suppress notifications when a settled computation leaves the visible
    /// state equivalent to what it was.
    ///
    /// States are equivalent if their status matches, their payloads are
    /// equal according to `equals`, and errors are identical. Recomputation
    /// is never suppressed.
    ///
    /// # Example
    ///
    /// ```
    /// use reflow::AsyncDerived;
    ///
    /// let rounded = AsyncDerived::builder(|_ctx| async { Ok(1.04_f64) })
    ///     .equals(|a, b| (a - b).abs() < 0.1)
    ///     .build();
    /// # let _ = rounded;
    /// ```
    pub fn equals(mut self, equals: EqualsFn<T>) -> Self {
        self.equals = Some(equals);
        self
    }

    /// Set the executor running the derivations. Defaults to [`TokioSpawner`].
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Set a label shown in cycle paths and tracer events.
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the tracer receiving this flow's events.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the flow.
    pub fn build(self) -> AsyncDerived<T> {
        let strategy = AsyncStrategy {
            derive: self.derive,
            book: Mutex::new(Book {
                current: Epoch::default(),
                floor: Epoch::default(),
                preview: Epoch::default(),
                in_flight: BTreeMap::new(),
                last_finished: None,
            }),
            initial: self.initial,
            equals: self.equals,
            spawner: self.spawner,
        };
        AsyncDerived {
            core: Core::new(FlowKey::new(self.label), strategy, self.tracer),
        }
    }
}
