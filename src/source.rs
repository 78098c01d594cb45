//! Primitive mutable flow.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::flow::{Flow, FlowKey, FlowValue, Subscription};
use crate::listeners::ListenerSet;
use crate::FlowError;

/// A flow holding a value that changes only through [`emit`](Source::emit).
///
/// This is cheap to clone - all clones share the same value and listeners.
///
/// # Example
///
/// ```
/// use reflow::{Flow, Source};
///
/// let count = Source::new(1);
/// count.emit(2).unwrap();
/// assert_eq!(count.snapshot().unwrap(), 2);
/// ```
pub struct Source<T> {
    inner: Arc<SourceInner<T>>,
}

struct SourceInner<T> {
    key: FlowKey,
    value: Mutex<T>,
    listeners: ListenerSet,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: FlowValue> Source<T> {
    /// Create a source holding `value`.
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    /// Create a source with a label used in cycle paths and tracer events.
    pub fn labelled(value: T, label: impl Into<Arc<str>>) -> Self {
        Self::build(value, Some(label.into()))
    }

    fn build(value: T, label: Option<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                key: FlowKey::new(label),
                value: Mutex::new(value),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Replace the value and notify every listener.
    ///
    /// Listeners are notified even if the new value equals the old one.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::Listeners` if any listener (including derived flows
    /// forwarding to their own listeners) failed. The value is updated anyway.
    pub fn emit(&self, value: T) -> Result<(), FlowError> {
        *self.inner.value.lock() = value;
        self.inner.listeners.notify().map(|_| ())
    }

    /// Update the value in place and notify every listener.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> Result<(), FlowError> {
        f(&mut self.inner.value.lock());
        self.inner.listeners.notify().map(|_| ())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl<T: FlowValue> Flow for Source<T> {
    type Output = T;

    fn key(&self) -> FlowKey {
        self.inner.key.clone()
    }

    fn snapshot(&self) -> Result<T, FlowError> {
        Ok(self.inner.value.lock().clone())
    }

    fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn() -> Result<(), FlowError> + Send + Sync + 'static,
    {
        let (slot, _) = self.inner.listeners.insert(Arc::new(listener));
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.remove(slot);
            }
        })
    }
}
