//! Synchronous derived flows.

use std::sync::Arc;

use crate::computation::Computation;
use crate::flow::{Flow, FlowKey, FlowValue, Subscription};
use crate::runtime::{Core, Strategy};
use crate::tracer::{self, ComputeResult, SharedTracer, Tracer};
use crate::FlowError;

type DeriveFn<T> = Box<dyn Fn(&FlowContext<'_, T>) -> Result<T, FlowError> + Send + Sync>;

/// Context passed to a synchronous derivation.
///
/// Every flow read through the context becomes a dependency of the running
/// computation.
pub struct FlowContext<'a, T> {
    computation: &'a Computation<T>,
    owner: &'a FlowKey,
    tracer: &'a dyn Tracer,
}

impl<'a, T: Clone> FlowContext<'a, T> {
    pub(crate) fn new(
        computation: &'a Computation<T>,
        owner: &'a FlowKey,
        tracer: &'a dyn Tracer,
    ) -> Self {
        Self {
            computation,
            owner,
            tracer,
        }
    }

    /// Read `flow` and record it as a dependency.
    ///
    /// # Errors
    ///
    /// Re-raises the error `flow` is in, so it can be propagated with `?`.
    pub fn get<F: Flow>(&self, flow: &F) -> Result<F::Output, FlowError> {
        self.computation.add_source(flow);
        self.tracer.on_dependency_registered(self.owner, &flow.key());
        let outcome = flow.snapshot();
        self.computation.set_source_snapshot(flow, outcome.clone());
        outcome
    }

    /// Abandon this computation and keep the previous value.
    ///
    /// Always returns `Err(FlowError::Cancelled)`; return it from the
    /// derivation right away. If there is no previous value the cancellation
    /// becomes the flow's error.
    pub fn skip<R>(&self) -> Result<R, FlowError> {
        Err(FlowError::Cancelled)
    }
}

pub(crate) struct SyncStrategy<T> {
    derive: DeriveFn<T>,
}

impl<T: FlowValue> Strategy for SyncStrategy<T> {
    type Output = T;
    type Record = Computation<T>;

    fn compute(&self, core: &Arc<Core<Self>>) -> Arc<Computation<T>> {
        let record = Arc::new(Computation::new());
        core.tracer().on_compute_start(core.key(), None);

        let outcome = (self.derive)(&FlowContext::new(&record, core.key(), core.tracer()));
        core.tracer()
            .on_compute_end(core.key(), None, ComputeResult::of(&outcome));

        let outcome = match outcome {
            Err(FlowError::Cancelled) => match core.cached() {
                Some(previous) => previous.value(),
                None => Err(FlowError::Cancelled),
            },
            other => other,
        };
        match outcome {
            Ok(value) => record.set_value(value),
            Err(error) => record.set_error(error),
        }
        record.finalize();
        core.install(&record);
        record
    }
}

/// A flow computed from other flows by a synchronous function.
///
/// The derivation runs lazily: on the first [`snapshot`](Flow::snapshot), and
/// afterwards only when a dependency actually changed. While the flow has
/// listeners it stays subscribed to exactly the dependencies its last
/// computation read, and a dependency change notifies the listeners once
/// until the value is read again.
///
/// This is cheap to clone - all clones share the same cache and listeners.
///
/// # Example
///
/// ```
/// use reflow::{Derived, Flow, Source};
///
/// let width = Source::new(3);
/// let height = Source::new(4);
/// let area = Derived::new({
///     let (width, height) = (width.clone(), height.clone());
///     move |ctx| Ok(ctx.get(&width)? * ctx.get(&height)?)
/// });
///
/// assert_eq!(area.snapshot().unwrap(), 12);
/// width.emit(5).unwrap();
/// assert_eq!(area.snapshot().unwrap(), 20);
/// ```
pub struct Derived<T: FlowValue> {
    core: Arc<Core<SyncStrategy<T>>>,
}

impl<T: FlowValue> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: FlowValue> Derived<T> {
    /// Create a derived flow with default settings.
    pub fn new<F>(derive: F) -> Self
    where
        F: Fn(&FlowContext<'_, T>) -> Result<T, FlowError> + Send + Sync + 'static,
    {
        Self::builder(derive).build()
    }

    /// Create a builder to customize the flow.
    pub fn builder<F>(derive: F) -> DerivedBuilder<T>
    where
        F: Fn(&FlowContext<'_, T>) -> Result<T, FlowError> + Send + Sync + 'static,
    {
        DerivedBuilder {
            derive: Box::new(derive),
            label: None,
            tracer: tracer::noop(),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.core.listener_count()
    }

    /// Whether a dependency changed since the value was last read.
    ///
    /// Only tracked while the flow has listeners.
    pub fn is_dirty(&self) -> bool {
        self.core.is_dirty()
    }
}

impl<T: FlowValue> Flow for Derived<T> {
    type Output = T;

    fn key(&self) -> FlowKey {
        self.core.key().clone()
    }

    fn snapshot(&self) -> Result<T, FlowError> {
        self.core.snapshot()
    }

    fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn() -> Result<(), FlowError> + Send + Sync + 'static,
    {
        self.core.subscribe(Arc::new(listener))
    }
}

impl<T: FlowValue> std::fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("key", self.core.key())
            .field("listeners", &self.core.listener_count())
            .finish()
    }
}

/// Builder for [`Derived`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use reflow::{Derived, Flow, NoopTracer, Source};
///
/// let name = Source::new("ada".to_string());
/// let upper = Derived::builder({
///     let name = name.clone();
///     move |ctx| Ok(ctx.get(&name)?.to_uppercase())
/// })
/// .label("upper")
/// .tracer(Arc::new(NoopTracer))
/// .build();
///
/// assert!(upper.key().to_string().starts_with("upper#"));
/// ```
pub struct DerivedBuilder<T> {
    derive: DeriveFn<T>,
    label: Option<Arc<str>>,
    tracer: SharedTracer,
}

impl<T: FlowValue> DerivedBuilder<T> {
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
    pub fn build(self) -> Derived<T> {
        let strategy = SyncStrategy {
            derive: self.derive,
        };
        Derived {
            core: Core::new(FlowKey::new(self.label), strategy, self.tracer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Source;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_only_touched_sources_are_subscribed() {
        let use_left = Source::new(true);
        let left = Source::new(1);
        let right = Source::new(2);
        let picked = Derived::new({
            let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
            move |ctx| {
                if ctx.get(&use_left)? {
                    ctx.get(&left)
                } else {
                    ctx.get(&right)
                }
            }
        });

        let _sub = picked.subscribe(|| Ok(()));
        assert_eq!(left.listener_count(), 1);
        assert_eq!(right.listener_count(), 0);

        use_left.emit(false).unwrap();
        assert_eq!(picked.snapshot().unwrap(), 2);
        assert_eq!(left.listener_count(), 0);
        assert_eq!(right.listener_count(), 1);
    }

    #[test]
    fn test_skip_keeps_previous_value_and_new_dependencies() {
        let runs = Arc::new(AtomicUsize::new(0));
        let source = Source::new(1);
        let odd = Derived::new({
            let (source, runs) = (source.clone(), runs.clone());
            move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                let value = ctx.get(&source)?;
                if value % 2 == 0 {
                    return ctx.skip();
                }
                Ok(value)
            }
        });

        assert_eq!(odd.snapshot().unwrap(), 1);
        source.emit(2).unwrap();
        assert_eq!(odd.snapshot().unwrap(), 1);
        assert_eq!(odd.snapshot().unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        source.emit(3).unwrap();
        assert_eq!(odd.snapshot().unwrap(), 3);
    }

    #[test]
    fn test_skip_without_previous_value_is_cancelled() {
        let source = Source::new(2);
        let odd = Derived::new({
            let source = source.clone();
            move |ctx| {
                let value = ctx.get(&source)?;
                if value % 2 == 0 {
                    ctx.skip()
                } else {
                    Ok(value)
                }
            }
        });

        assert!(odd.snapshot().unwrap_err().is_cancelled());
    }
}
