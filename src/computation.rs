//! Computation records.
//!
//! A record is one execution attempt of a derivation. It collects the
//! dependencies touched while the derivation runs together with the outcome
//! observed for each of them, and holds the result. Once finalized the
//! dependency set is frozen; the cached outcomes stay around so an unwatched
//! flow can later tell whether anything it read has changed.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::flow::{Flow, FlowId, FlowKey, Listener, Subscription};
use crate::state::AsyncState;
use crate::FlowError;

/// A dependency with the outcome observed when it was read.
trait TrackedSource: Send + Sync {
    fn key(&self) -> FlowKey;

    fn subscribe(&self, handler: Listener) -> Subscription;

    /// Returns `true` if the current snapshot differs from the observed one.
    ///
    /// A dependency registered but not read yet counts as unchanged.
    fn changed(&self) -> bool;
}

struct Tracked<F: Flow> {
    flow: F,
    observed: Option<Result<F::Output, FlowError>>,
}

impl<F: Flow> TrackedSource for Tracked<F> {
    fn key(&self) -> FlowKey {
        self.flow.key()
    }

    fn subscribe(&self, handler: Listener) -> Subscription {
        self.flow.subscribe(move || handler())
    }

    fn changed(&self) -> bool {
        match &self.observed {
            Some(observed) => &self.flow.snapshot() != observed,
            None => false,
        }
    }
}

type SourceMap = HashMap<FlowId, Arc<dyn TrackedSource>, ahash::RandomState>;

/// One execution attempt of a derivation.
pub(crate) struct Computation<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    sources: SourceMap,
    result: Option<Result<T, FlowError>>,
    finalized: bool,
    /// Present while the record is the active one of its flow.
    handler: Option<Listener>,
    subscriptions: Vec<Subscription>,
}

impl<T: Clone> Computation<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sources: SourceMap::default(),
                result: None,
                finalized: false,
                handler: None,
                subscriptions: Vec::new(),
            }),
        }
    }

    /// Register a dependency. No-op once finalized.
    ///
    /// If the record is already active, the dependency is subscribed
    /// immediately.
    pub fn add_source<F: Flow>(&self, flow: &F) {
        let id = flow.key().id;
        let (source, handler) = {
            let mut inner = self.inner.lock();
            if inner.finalized || inner.sources.contains_key(&id) {
                return;
            }
            let source: Arc<dyn TrackedSource> = Arc::new(Tracked {
                flow: flow.clone(),
                observed: None,
            });
            inner.sources.insert(id, source.clone());
            (source, inner.handler.clone())
        };
        if let Some(handler) = handler {
            let subscription = source.subscribe(handler);
            self.keep_subscriptions(vec![subscription]);
        }
    }

    /// Cache the outcome observed for a dependency. No-op once finalized.
    pub fn set_source_snapshot<F: Flow>(&self, flow: &F, outcome: Result<F::Output, FlowError>) {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }
        inner.sources.insert(
            flow.key().id,
            Arc::new(Tracked {
                flow: flow.clone(),
                observed: Some(outcome),
            }),
        );
    }

    pub fn set_value(&self, value: T) {
        self.inner.lock().result = Some(Ok(value));
    }

    pub fn set_error(&self, error: FlowError) {
        self.inner.lock().result = Some(Err(error));
    }

    /// The value, or the cached error.
    pub fn value(&self) -> Result<T, FlowError> {
        self.inner
            .lock()
            .result
            .clone()
            .unwrap_or(Err(FlowError::Cancelled))
    }

    pub fn finalize(&self) {
        self.inner.lock().finalized = true;
    }

    /// Subscribe `handler` to every touched dependency and mark the record
    /// active. Replaces any previous subscriptions.
    pub fn subscribe_to_sources(&self, handler: Listener) {
        let (sources, previous) = {
            let mut inner = self.inner.lock();
            inner.handler = Some(handler.clone());
            let sources: Vec<_> = inner.sources.values().cloned().collect();
            (sources, std::mem::take(&mut inner.subscriptions))
        };
        drop(previous);

        let subscriptions = sources
            .iter()
            .map(|source| source.subscribe(handler.clone()))
            .collect();
        self.keep_subscriptions(subscriptions);
    }

    fn keep_subscriptions(&self, subscriptions: Vec<Subscription>) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.handler.is_some() {
                inner.subscriptions.extend(subscriptions);
                None
            } else {
                Some(subscriptions)
            }
        };
        // Disposed in the meantime; release outside the lock.
        drop(rejected);
    }

    /// Returns `true` as soon as one dependency's current snapshot differs
    /// from the one observed during the computation.
    pub fn sources_changed(&self) -> bool {
        let sources: Vec<_> = self.inner.lock().sources.values().cloned().collect();
        sources.iter().any(|source| source.changed())
    }

    /// Release all dependency subscriptions.
    ///
    /// The result and the observed outcomes are kept for later staleness
    /// checks. A record still running keeps recording the dependencies it
    /// touches; it stops only when finalized.
    pub fn dispose(&self) {
        let subscriptions = {
            let mut inner = self.inner.lock();
            inner.handler = None;
            std::mem::take(&mut inner.subscriptions)
        };
        drop(subscriptions);
    }
}

impl<T> AsRef<Computation<T>> for Computation<T> {
    fn as_ref(&self) -> &Computation<T> {
        self
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Computation")
            .field(
                "sources",
                &inner.sources.values().map(|s| s.key()).collect::<Vec<_>>(),
            )
            .field("finalized", &inner.finalized)
            .field("active", &inner.handler.is_some())
            .finish()
    }
}

/// Per-flow sequence number assigned when an asynchronous computation starts.
///
/// Epochs order starts, not completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub(crate) fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

/// Shared handle to the eventual outcome of an asynchronous computation.
pub type FlowFuture<T> = Shared<BoxFuture<'static, Result<T, FlowError>>>;

/// An asynchronous computation record: a [`Computation`] over
/// [`AsyncState`] tagged with its epoch and cancellation token.
pub(crate) struct AsyncComputation<T> {
    computation: Computation<AsyncState<T>>,
    epoch: Epoch,
    token: CancellationToken,
    handle: FlowFuture<T>,
    waiters: Mutex<Vec<oneshot::Sender<Result<T, FlowError>>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncComputation<T> {
    /// Create a record seeded with `state`.
    pub fn new(epoch: Epoch, state: AsyncState<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let handle = rx
            .map(|outcome| outcome.unwrap_or(Err(FlowError::Cancelled)))
            .boxed()
            .shared();
        let computation = Computation::new();
        computation.set_value(state);
        Self {
            computation,
            epoch,
            token: CancellationToken::new(),
            handle,
            waiters: Mutex::new(vec![tx]),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The visible state of this record.
    pub fn state(&self) -> AsyncState<T> {
        self.computation
            .value()
            .unwrap_or_else(|error| AsyncState::Error { error, data: None })
    }

    pub fn handle(&self) -> FlowFuture<T> {
        self.handle.clone()
    }

    /// Complete every handle waiting on this record.
    pub fn resolve(&self, outcome: Result<T, FlowError>) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Hand the handles still waiting on this record over to `successor`.
    pub fn forward_waiters(&self, successor: &AsyncComputation<T>) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        successor.waiters.lock().extend(waiters);
    }
}

impl<T> Deref for AsyncComputation<T> {
    type Target = Computation<AsyncState<T>>;

    fn deref(&self) -> &Self::Target {
        &self.computation
    }
}

impl<T> AsRef<Computation<AsyncState<T>>> for AsyncComputation<T> {
    fn as_ref(&self) -> &Computation<AsyncState<T>> {
        &self.computation
    }
}
