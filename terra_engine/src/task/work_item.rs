//! Work items - a unit of work bound to a completion signal

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::log::LogHandle;
use crate::task::signal::CompletionSignal;
use crate::{engine_debug, engine_error, engine_trace};

const SOURCE: &str = "terra::WorkItem";

/// Boxed work closure
pub type WorkFn = Box<dyn FnOnce(&WorkerContext) -> Result<()> + Send>;

/// Identifies the thread a work closure runs on
///
/// Worker indices are assigned when the pool is built (`0..worker_count`).
/// Code that keeps per-thread state (command pools) indexes it with
/// `worker_index` instead of looking up the OS thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    /// Index of the running worker
    pub worker_index: usize,
    /// Total number of workers in the pool
    pub worker_count: usize,
}

/// What happened when a work item was run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The closure ran and returned `Ok`
    Completed,
    /// The closure was not invoked (signal cancelled)
    Skipped,
    /// The closure returned an error, panicked, or a predicate failed
    Failed,
}

/// Weak binding to a signal that is completed exactly once
///
/// `bind` registers a producer on the signal. The producer is released by
/// `complete`, or by `Drop` if the guard is discarded first (the signal then
/// records `Error::PoolStopped`).
pub(crate) struct SignalGuard {
    signal: Option<Weak<CompletionSignal>>,
    completed: bool,
}

impl SignalGuard {
    pub(crate) fn bind(signal: &Arc<CompletionSignal>) -> Self {
        signal.notify();
        Self {
            signal: Some(Arc::downgrade(signal)),
            completed: false,
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            signal: None,
            completed: false,
        }
    }

    /// The bound signal, if its owner still holds it
    pub(crate) fn signal(&self) -> Option<Arc<CompletionSignal>> {
        self.signal.as_ref().and_then(Weak::upgrade)
    }

    /// Record `result` on the signal and release the producer
    pub(crate) fn complete(mut self, result: Result<()>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<()>) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(signal) = self.signal() {
            if let Err(error) = result {
                signal.fail(error);
            }
            signal.signal();
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.finish(Err(Error::PoolStopped));
    }
}

/// A unit of work bound to a `CompletionSignal`
///
/// Creating a work item registers one producer on its signal. Whatever
/// happens to the item afterwards (run, skipped, failed, dropped by a stopped
/// pool) the signal is signaled exactly once.
pub struct WorkItem {
    work: Option<WorkFn>,
    guard: SignalGuard,
}

impl WorkItem {
    /// Bind `work` to `signal` (calls `signal.notify()`)
    pub fn new<F>(work: F, signal: &Arc<CompletionSignal>) -> Self
    where
        F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
    {
        Self {
            work: Some(Box::new(work)),
            guard: SignalGuard::bind(signal),
        }
    }

    /// Work with no completion signal (fire-and-forget)
    pub fn detached<F>(work: F) -> Self
    where
        F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
    {
        Self {
            work: Some(Box::new(work)),
            guard: SignalGuard::detached(),
        }
    }

    /// The bound signal, if still alive
    pub fn signal(&self) -> Option<Arc<CompletionSignal>> {
        self.guard.signal()
    }

    /// Whether every predicate of the bound signal is satisfied
    ///
    /// Items without a live signal have no predicates and are always ready.
    pub fn is_ready_to_run(&self) -> bool {
        self.signal().map_or(true, |signal| signal.is_ready_to_run())
    }

    pub(crate) fn pending_predicates(&self) -> Vec<Arc<CompletionSignal>> {
        self.signal()
            .map(|signal| signal.pending_predicates())
            .unwrap_or_default()
    }

    /// Execute the closure (unless cancelled) and signal completion
    ///
    /// Errors and panics raised by the closure are caught here, logged and
    /// recorded on the bound signal; they never unwind into the worker.
    pub fn run(mut self, context: &WorkerContext, log: &LogHandle) -> WorkOutcome {
        let Some(work) = self.work.take() else {
            self.guard.complete(Ok(()));
            return WorkOutcome::Skipped;
        };

        if let Some(signal) = self.guard.signal() {
            if signal.is_cancelled_transitively() {
                engine_trace!(log, SOURCE, "Skipping cancelled work on worker {}", context.worker_index);
                self.guard.complete(Ok(()));
                return WorkOutcome::Skipped;
            }
            if let Some(error) = signal.predicate_failure() {
                engine_debug!(log, SOURCE, "Skipping work on worker {}: {}", context.worker_index, error);
                self.guard.complete(Err(error));
                return WorkOutcome::Failed;
            }
        }

        let result = execute(work, context);
        let outcome = match &result {
            Ok(()) => WorkOutcome::Completed,
            Err(error) => {
                engine_error!(log, SOURCE, "Work failed on worker {}: {}", context.worker_index, error);
                WorkOutcome::Failed
            }
        };
        self.guard.complete(result);
        outcome
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("pending", &self.work.is_some())
            .field("signal", &self.signal())
            .finish()
    }
}

/// Run a work closure behind a panic boundary
fn execute(work: WorkFn, context: &WorkerContext) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| work(context))) {
        Ok(result) => result,
        Err(payload) => Err(Error::WorkFailed(format!(
            "work panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "work_item_tests.rs"]
mod tests;
