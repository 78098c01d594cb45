//! The flow capability and its subscription handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::FlowError;

/// Global counter for flow identities.
static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u64);

impl FlowId {
    pub(crate) fn next() -> Self {
        FlowId(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a flow plus an optional human readable label.
///
/// Used for dependency bookkeeping, cycle paths and tracer events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Unique identity.
    pub id: FlowId,
    /// Label given through a builder, if any.
    pub label: Option<Arc<str>>,
}

impl FlowKey {
    pub(crate) fn new(label: Option<Arc<str>>) -> Self {
        Self {
            id: FlowId::next(),
            label,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}#{}", label, self.id.0),
            None => write!(f, "flow#{}", self.id.0),
        }
    }
}

/// Convenience trait for flow value types.
///
/// `PartialEq` is what the dependency tracker uses to decide whether a source
/// changed since it was last read.
pub trait FlowValue: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> FlowValue for T {}

/// Change callback registered with [`Flow::subscribe`].
///
/// A failing listener does not stop delivery to the others; failures are
/// aggregated and returned to whoever triggered the change.
pub type Listener = Arc<dyn Fn() -> Result<(), FlowError> + Send + Sync>;

/// An observable value: a current snapshot plus change notifications.
///
/// Handles are cheap to clone and all clones refer to the same flow.
pub trait Flow: Clone + Send + Sync + 'static {
    /// The value type produced by [`snapshot`](Flow::snapshot).
    type Output: FlowValue;

    /// Identity of this flow.
    fn key(&self) -> FlowKey;

    /// Read the current value, re-raising the flow's error if it has one.
    fn snapshot(&self) -> Result<Self::Output, FlowError>;

    /// Register a change listener.
    ///
    /// The listener is removed when the returned [`Subscription`] is
    /// unsubscribed or dropped.
    fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn() -> Result<(), FlowError> + Send + Sync + 'static;
}

/// A flow whose value is an [`AsyncState`](crate::AsyncState) that eventually settles.
///
/// Implementors use `AsyncState<Self::Data>` as their [`Flow::Output`].
#[async_trait::async_trait]
pub trait AsyncFlow: Flow {
    /// The payload carried by the asynchronous state.
    type Data: FlowValue;

    /// Wait until the current computation settles and return its outcome.
    async fn settled(&self) -> Result<Self::Data, FlowError>;
}

/// Handle to a registered listener.
///
/// Unsubscribing is idempotent; dropping the handle unsubscribes as well.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Remove the listener. Calling this more than once has no effect.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    /// Returns `true` until the subscription has been released.
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_flow_ids_are_unique() {
        let a = FlowId::next();
        let b = FlowId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_display() {
        let labelled = FlowKey::new(Some("total".into()));
        assert!(labelled.to_string().starts_with("total#"));
        let anonymous = FlowKey::new(None);
        assert!(anonymous.to_string().starts_with("flow#"));
    }
}
