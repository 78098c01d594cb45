//! Listener registry shared by sources and derived flows.

use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::error::ListenerErrors;
use crate::flow::Listener;
use crate::FlowError;

/// Slab of listeners keyed by subscription slot.
#[derive(Default)]
pub(crate) struct ListenerSet {
    slots: Mutex<Slab<Listener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning its slot and whether it is the first one.
    pub fn insert(&self, listener: Listener) -> (usize, bool) {
        let mut slots = self.slots.lock();
        let first = slots.is_empty();
        (slots.insert(listener), first)
    }

    /// Remove a listener, returning `true` if the set became empty.
    ///
    /// Removing an unknown slot is a no-op and reports `false`.
    pub fn remove(&self, slot: usize) -> bool {
        let mut slots = self.slots.lock();
        if slots.try_remove(slot).is_some() {
            slots.is_empty()
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Call every listener registered at the time of the call.
    ///
    /// Works on a copy of the set, so listeners may subscribe or unsubscribe
    /// without affecting this pass. All listeners run even if some fail.
    pub fn notify(&self) -> Result<usize, FlowError> {
        let frozen: Vec<Listener> = self
            .slots
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let failures: Vec<FlowError> = frozen
            .iter()
            .filter_map(|listener| listener().err())
            .collect();

        if failures.is_empty() {
            Ok(frozen.len())
        } else {
            Err(FlowError::Listeners(ListenerErrors::new(failures)))
        }
    }
}
