//! Executors for asynchronous derivations.

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::FlowError;

/// Runs the background task of an asynchronous computation.
///
/// Closures taking a `BoxFuture<'static, ()>` implement this trait, so any
/// executor can be plugged in:
///
/// ```
/// use std::sync::Arc;
/// use futures::future::BoxFuture;
/// use reflow::{AsyncDerived, Spawner};
///
/// let spawner: Arc<dyn Spawner> = Arc::new(|task: BoxFuture<'static, ()>| {
///     std::thread::spawn(move || futures::executor::block_on(task));
/// });
/// let answer = AsyncDerived::builder(|_ctx| async { Ok(42) })
///     .spawner(spawner)
///     .build();
/// # let _ = answer;
/// ```
pub trait Spawner: Send + Sync + 'static {
    /// Start `task` in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the task could not be started. The computation
    /// then settles with that error.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), FlowError>;
}

impl<F> Spawner for F
where
    F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
{
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), FlowError> {
        self(task);
        Ok(())
    }
}

/// Spawns onto the ambient tokio runtime.
///
/// This is the default spawner. Outside a tokio runtime the computation
/// settles with an error instead of running.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), FlowError> {
        Handle::try_current()?.spawn(task);
        Ok(())
    }
}
