//! Tests for listener notification: the dirty latch, failure aggregation and
//! re-entrant listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reflow::{Derived, Flow, FlowError, FlowExt, Source, Subscription};

fn counting(count: &Arc<AtomicUsize>) -> impl Fn() -> Result<(), FlowError> + Send + Sync + 'static {
    let count = count.clone();
    move || {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Dirty latch
// =============================================================================

#[test]
fn test_notify_once_per_dirty_window() {
    let source = Source::new(0);
    let doubled = source.map(|n| n * 2);
    let count = Arc::new(AtomicUsize::new(0));
    let _sub = doubled.subscribe(counting(&count));

    for n in 1..=5 {
        source.emit(n).unwrap();
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert_eq!(doubled.snapshot().unwrap(), 10);
    source.emit(6).unwrap();
    source.emit(7).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_latch_propagates_through_chain_once() {
    let source = Source::new(1);
    let a = source.map(|n| n + 1);
    let b = a.map(|n| n + 1);
    let count = Arc::new(AtomicUsize::new(0));
    let _sub = b.subscribe(counting(&count));

    source.emit(2).unwrap();
    source.emit(3).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(b.snapshot().unwrap(), 5);
}

// =============================================================================
// Failure aggregation
// =============================================================================

#[test]
fn test_all_listeners_run_and_failures_are_aggregated() {
    let source = Source::new(1);
    let flow = source.map(|n| n);
    let count = Arc::new(AtomicUsize::new(0));

    let _failing_a = flow.subscribe(|| Err(anyhow::anyhow!("listener a").into()));
    let _ok = flow.subscribe(counting(&count));
    let _failing_b = flow.subscribe(|| Err(anyhow::anyhow!("listener b").into()));

    match source.emit(2) {
        Err(FlowError::Listeners(errors)) => {
            assert_eq!(errors.len(), 2);
            let messages: Vec<String> = errors.errors().iter().map(ToString::to_string).collect();
            assert!(messages.iter().any(|m| m.contains("listener a")));
            assert!(messages.iter().any(|m| m.contains("listener b")));
        }
        other => panic!("Expected Listeners, got {:?}", other),
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(flow.snapshot().unwrap(), 2);
}

#[test]
fn test_failures_from_several_flows_are_flattened() {
    let source = Source::new(1);
    let left = source.map(|n| n + 1);
    let right = source.map(|n| n - 1);
    let _l = left.subscribe(|| Err(anyhow::anyhow!("left").into()));
    let _r = right.subscribe(|| Err(anyhow::anyhow!("right").into()));

    let err = source.emit(5).unwrap_err();
    match err {
        FlowError::Listeners(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .errors()
                .iter()
                .all(|e| matches!(e, FlowError::User(_))));
        }
        other => panic!("Expected Listeners, got {:?}", other),
    }
}

// =============================================================================
// Re-entrancy
// =============================================================================

#[test]
fn test_listener_may_unsubscribe_another_during_delivery() {
    let source = Source::new(0);
    let flow = source.map(|n| n);
    let count = Arc::new(AtomicUsize::new(0));
    let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let _killer = flow.subscribe({
        let victim = victim.clone();
        move || {
            if let Some(sub) = victim.lock().take() {
                sub.unsubscribe();
            }
            Ok(())
        }
    });
    *victim.lock() = Some(flow.subscribe(counting(&count)));

    // The pass in progress still reaches the removed listener.
    source.emit(1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(flow.listener_count(), 1);

    let _ = flow.snapshot().unwrap();
    source.emit(2).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_listener_added_during_delivery_waits_for_next_pass() {
    let source = Source::new(0);
    let flow = source.map(|n| n);
    let count = Arc::new(AtomicUsize::new(0));
    let added: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

    let _adder = flow.subscribe({
        let (flow, count, added) = (flow.clone(), count.clone(), added.clone());
        move || {
            let sub = flow.subscribe(counting(&count));
            added.lock().push(sub);
            Ok(())
        }
    });

    source.emit(1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(flow.listener_count(), 2);

    let _ = flow.snapshot().unwrap();
    source.emit(2).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_listener_may_read_the_flow() {
    let source = Source::new(1);
    let flow = Derived::new({
        let source = source.clone();
        move |ctx| Ok(ctx.get(&source)? * 10)
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = flow.subscribe({
        let (flow, seen) = (flow.clone(), seen.clone());
        move || {
            seen.lock().push(flow.snapshot()?);
            Ok(())
        }
    });

    source.emit(2).unwrap();
    source.emit(3).unwrap();
    assert_eq!(*seen.lock(), vec![20, 30]);
}
