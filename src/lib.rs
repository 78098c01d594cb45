//! Reflow: lazily derived reactive flows.
//!
//! A flow is an observable value: it can be read with [`Flow::snapshot`] and
//! watched with [`Flow::subscribe`]. Derived flows compute their value from
//! other flows and track exactly the dependencies they read.
//!
//! # Key Features
//!
//! - **Lazy**: derivations run when a value is requested, never on change
//! - **Minimal recomputation**: a cached value is reused unless a dependency actually changed
//! - **Notify once**: listeners hear about the first change until the value is read again
//! - **Race-free async**: the last started computation wins, whatever order computations settle in
//! - **Stale data**: pending and error states keep the last known payload
//! - **Cycle detection**: re-entrant evaluation fails fast with [`FlowError::Cycle`]
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use reflow::{Derived, Flow, Source};
//!
//! let price = Source::new(10);
//! let quantity = Source::new(3);
//! let total = Derived::new({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move |ctx| Ok(ctx.get(&price)? * ctx.get(&quantity)?)
//! });
//!
//! let changes = Arc::new(AtomicUsize::new(0));
//! let _sub = total.subscribe({
//!     let changes = changes.clone();
//!     move || {
//!         changes.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//! });
//!
//! price.emit(12).unwrap();
//! quantity.emit(4).unwrap();
//! assert_eq!(changes.load(Ordering::SeqCst), 1);
//! assert_eq!(total.snapshot().unwrap(), 48);
//! ```
//!
//! Asynchronous derivations are covered by [`AsyncDerived`].

mod computation;
mod derived;
mod derived_async;
mod error;
mod flow;
mod listeners;
mod ops;
mod runtime;
mod source;
mod spawn;
mod state;
pub mod tracer;

pub use computation::{Epoch, FlowFuture};
pub use derived::{Derived, DerivedBuilder, FlowContext};
pub use derived_async::{AsyncContext, AsyncDerived, AsyncDerivedBuilder, EqualsFn};
pub use error::{FlowError, ListenerErrors};
pub use flow::{AsyncFlow, Flow, FlowId, FlowKey, FlowValue, Listener, Subscription};
pub use ops::FlowExt;
pub use source::Source;
pub use spawn::{Spawner, TokioSpawner};
pub use state::{AsyncState, Status};
#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
pub use tracer::{ComputeResult, NoopTracer, RevertTarget, Tracer};
