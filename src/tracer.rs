//! Tracer trait for observing flow evaluation.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! recomputation, invalidation and epoch arbitration. The default
//! [`NoopTracer`] costs nothing when tracing is not needed.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use reflow::{ComputeResult, Derived, Epoch, Flow, FlowKey, Source, Tracer};
//!
//! #[derive(Default)]
//! struct CountingTracer {
//!     computes: AtomicUsize,
//! }
//!
//! impl Tracer for CountingTracer {
//!     fn on_compute_end(&self, _flow: &FlowKey, _epoch: Option<Epoch>, _result: ComputeResult) {
//!         self.computes.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let tracer = Arc::new(CountingTracer::default());
//! let source = Source::new(2);
//! let doubled = Derived::builder({
//!     let source = source.clone();
//!     move |ctx| Ok(ctx.get(&source)? * 2)
//! })
//! .tracer(tracer.clone())
//! .build();
//!
//! assert_eq!(doubled.snapshot().unwrap(), 4);
//! assert_eq!(tracer.computes.load(Ordering::Relaxed), 1);
//! ```

use std::sync::Arc;

use crate::computation::Epoch;
use crate::flow::FlowKey;
use crate::FlowError;

/// Outcome classification of a finished computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeResult {
    /// The derivation produced a value.
    Value,
    /// The derivation failed.
    Error { message: String },
    /// The derivation skipped or observed its cancellation.
    Cancelled,
}

impl ComputeResult {
    pub(crate) fn of<T>(outcome: &Result<T, FlowError>) -> Self {
        match outcome {
            Ok(_) => ComputeResult::Value,
            Err(FlowError::Cancelled) => ComputeResult::Cancelled,
            Err(error) => ComputeResult::Error {
                message: error.to_string(),
            },
        }
    }
}

/// Fallback chosen when the winning asynchronous computation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertTarget {
    /// A still-pending earlier computation.
    Pending(Epoch),
    /// The state of the last finished computation.
    Finished(Epoch),
    /// The configured initial state.
    Initial,
    /// No fallback existed; the cancellation is surfaced as an error.
    Surfaced,
}

/// Tracer trait for observing flow evaluation.
///
/// Implementations can collect events for testing, forward to the `tracing`
/// crate, or provide custom observability.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer is shared by every
/// clone of a flow and called from whichever task settles a computation.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a derivation starts. `epoch` is set for asynchronous flows.
    #[inline]
    fn on_compute_start(&self, _flow: &FlowKey, _epoch: Option<Epoch>) {}

    /// Called when a derivation finishes, before arbitration.
    #[inline]
    fn on_compute_end(&self, _flow: &FlowKey, _epoch: Option<Epoch>, _result: ComputeResult) {}

    /// Called when a cached computation is validated. `valid` is `false` when
    /// it has to be recomputed.
    #[inline]
    fn on_cache_check(&self, _flow: &FlowKey, _valid: bool) {}

    /// Called when a derivation reads a dependency.
    #[inline]
    fn on_dependency_registered(&self, _flow: &FlowKey, _dependency: &FlowKey) {}

    /// Called when a dependency change latches the flow dirty.
    #[inline]
    fn on_dirty(&self, _flow: &FlowKey) {}

    /// Called after listeners were notified.
    #[inline]
    fn on_notify(&self, _flow: &FlowKey, _listeners: usize, _failed: bool) {}

    /// Called when an outdated completion is dropped by epoch arbitration.
    #[inline]
    fn on_epoch_discarded(&self, _flow: &FlowKey, _epoch: Epoch, _floor: Epoch) {}

    /// Called when an outdated success is shown as pending preview data.
    #[inline]
    fn on_preview(&self, _flow: &FlowKey, _epoch: Epoch) {}

    /// Called when a cancelled winning computation falls back.
    #[inline]
    fn on_revert(&self, _flow: &FlowKey, _epoch: Epoch, _target: RevertTarget) {}

    /// Called when a dependency cycle is detected.
    #[inline]
    fn on_cycle_detected(&self, _path: &[FlowKey]) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for every flow builder.
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Shared tracer handle stored by flows.
pub(crate) type SharedTracer = Arc<dyn Tracer>;

pub(crate) fn noop() -> SharedTracer {
    Arc::new(NoopTracer)
}

/// Tracer forwarding events to the `tracing` crate.
///
/// Recomputations and arbitration decisions are logged at `debug`, cache
/// checks and dependency reads at `trace`.
#[cfg(feature = "tracing")]
pub struct TracingTracer;

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn on_compute_start(&self, flow: &FlowKey, epoch: Option<Epoch>) {
        tracing::debug!(flow = %flow, epoch = ?epoch.map(|e| e.0), "compute start");
    }

    fn on_compute_end(&self, flow: &FlowKey, epoch: Option<Epoch>, result: ComputeResult) {
        tracing::debug!(flow = %flow, epoch = ?epoch.map(|e| e.0), result = ?result, "compute end");
    }

    fn on_cache_check(&self, flow: &FlowKey, valid: bool) {
        tracing::trace!(flow = %flow, valid, "cache check");
    }

    fn on_dependency_registered(&self, flow: &FlowKey, dependency: &FlowKey) {
        tracing::trace!(flow = %flow, dependency = %dependency, "dependency registered");
    }

    fn on_dirty(&self, flow: &FlowKey) {
        tracing::trace!(flow = %flow, "dirty");
    }

    fn on_notify(&self, flow: &FlowKey, listeners: usize, failed: bool) {
        if failed {
            tracing::warn!(flow = %flow, listeners, "listener failed during notification");
        } else {
            tracing::trace!(flow = %flow, listeners, "notified");
        }
    }

    fn on_epoch_discarded(&self, flow: &FlowKey, epoch: Epoch, floor: Epoch) {
        tracing::debug!(flow = %flow, epoch = epoch.0, floor = floor.0, "outdated completion discarded");
    }

    fn on_preview(&self, flow: &FlowKey, epoch: Epoch) {
        tracing::debug!(flow = %flow, epoch = epoch.0, "pending preview updated");
    }

    fn on_revert(&self, flow: &FlowKey, epoch: Epoch, target: RevertTarget) {
        tracing::debug!(flow = %flow, epoch = epoch.0, target = ?target, "cancelled computation reverted");
    }

    fn on_cycle_detected(&self, path: &[FlowKey]) {
        let path: Vec<String> = path.iter().map(ToString::to_string).collect();
        tracing::warn!(path = ?path, "dependency cycle detected");
    }
}
