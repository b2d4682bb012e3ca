use super::*;
use crate::log::LogSeverity;
use crate::test_support::CaptureLogger;
use std::sync::atomic::{AtomicUsize, Ordering};

fn context() -> WorkerContext {
    WorkerContext {
        worker_index: 0,
        worker_count: 1,
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(&WorkerContext) -> Result<()> + Send + 'static {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Binding
// ============================================================================

#[test]
fn test_new_notifies_signal() {
    let signal = CompletionSignal::new();
    let item = WorkItem::new(|_| Ok(()), &signal);
    assert_eq!(signal.active_waiters(), 1);
    assert!(item.signal().is_some());
}

#[test]
fn test_item_does_not_keep_signal_alive() {
    let signal = CompletionSignal::new();
    let item = WorkItem::new(|_| Ok(()), &signal);
    drop(signal);
    assert!(item.signal().is_none());
    assert!(item.is_ready_to_run());
}

// ============================================================================
// Running
// ============================================================================

#[test]
fn test_run_invokes_closure_and_signals_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let signal = CompletionSignal::new();
    let item = WorkItem::new(counting(&calls), &signal);

    let outcome = item.run(&context(), &LogHandle::silent());

    assert_eq!(outcome, WorkOutcome::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(signal.is_complete());
    assert!(signal.wait().is_ok());
}

#[test]
fn test_run_passes_worker_context() {
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let signal = CompletionSignal::new();
    let slot = seen.clone();
    let item = WorkItem::new(
        move |ctx: &WorkerContext| {
            slot.store(ctx.worker_index, Ordering::SeqCst);
            Ok(())
        },
        &signal,
    );

    item.run(
        &WorkerContext {
            worker_index: 3,
            worker_count: 4,
        },
        &LogHandle::silent(),
    );
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[test]
fn test_detached_item_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let item = WorkItem::detached(counting(&calls));
    assert_eq!(item.run(&context(), &LogHandle::silent()), WorkOutcome::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancelled_item_is_skipped_but_signals() {
    let calls = Arc::new(AtomicUsize::new(0));
    let signal = CompletionSignal::new();
    let item = WorkItem::new(counting(&calls), &signal);
    signal.cancel();

    assert_eq!(item.run(&context(), &LogHandle::silent()), WorkOutcome::Skipped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(signal.is_complete());
    assert!(!signal.is_failed());
}

#[test]
fn test_cancelled_predicate_skips_dependent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = CompletionSignal::new();
    let signal = CompletionSignal::new();
    signal.wait_on(&gate).unwrap();
    gate.cancel();

    let item = WorkItem::new(counting(&calls), &signal);
    assert_eq!(item.run(&context(), &LogHandle::silent()), WorkOutcome::Skipped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(signal.is_complete());
}

#[test]
fn test_closure_error_is_recorded_and_logged() {
    let capture = CaptureLogger::new();
    let signal = CompletionSignal::new();
    let item = WorkItem::new(
        |_| Err(Error::BackendError("queue submit failed".to_string())),
        &signal,
    );

    assert_eq!(item.run(&context(), &capture.handle()), WorkOutcome::Failed);
    assert!(signal.is_complete());
    assert!(matches!(signal.wait(), Err(Error::BackendError(_))));
    assert_eq!(capture.count(LogSeverity::Error), 1);
}

#[test]
fn test_panic_is_caught_and_recorded() {
    let signal = CompletionSignal::new();
    let item = WorkItem::new(|_| panic!("terrain tile exploded"), &signal);

    assert_eq!(item.run(&context(), &LogHandle::silent()), WorkOutcome::Failed);
    match signal.wait() {
        Err(Error::WorkFailed(msg)) => assert!(msg.contains("terrain tile exploded")),
        other => panic!("unexpected wait result: {:?}", other),
    }
}

#[test]
fn test_failed_predicate_skips_and_fails_dependent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let upstream = CompletionSignal::new();
    upstream.fail(Error::OutOfMemory);
    let signal = CompletionSignal::new();
    signal.wait_on(&upstream).unwrap();

    let item = WorkItem::new(counting(&calls), &signal);
    assert_eq!(item.run(&context(), &LogHandle::silent()), WorkOutcome::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(signal.wait(), Err(Error::DependencyFailed(_))));
}

// ============================================================================
// Dropping
// ============================================================================

#[test]
fn test_dropped_item_signals_pool_stopped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let signal = CompletionSignal::new();
    let item = WorkItem::new(counting(&calls), &signal);
    drop(item);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(signal.is_complete());
    assert!(matches!(signal.wait(), Err(Error::PoolStopped)));
}

#[test]
fn test_signal_guard_completes_once() {
    let signal = CompletionSignal::new();
    signal.notify(); // second, unrelated producer
    let guard = SignalGuard::bind(&signal);
    guard.complete(Ok(()));
    assert_eq!(signal.active_waiters(), 1);
}
