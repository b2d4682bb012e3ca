//! Completion signals - reference-counted, dependency-aware completion gates
//!
//! A `CompletionSignal` behaves like a countdown latch: every producer that
//! intends to complete it calls `notify()` once, then `signal()` once when it
//! is done. Work bound to a signal can additionally wait on other signals
//! (predicates); it only becomes eligible to run once every predicate in the
//! chain has completed.
//!
//! Signals are shared as `Arc<CompletionSignal>`. The scheduler only keeps
//! `Weak` references to them, so a dependent never outlives its owner's need.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};

/// Callback fired once when a signal reaches zero pending producers (or is dropped)
pub(crate) type CompletionListener = Box<dyn FnOnce() + Send>;

struct SignalState {
    /// Producers that still have to call `signal()`
    active_waiters: usize,
    /// Bound work is skipped when set
    cancelled: bool,
    /// Signals that must complete before work bound to this one may run
    predicates: Vec<Weak<CompletionSignal>>,
    /// First failure recorded by bound work
    error: Option<Error>,
    /// Fired (outside the lock) on the next transition to zero
    listeners: Vec<CompletionListener>,
}

/// Dependency-aware completion gate
///
/// # Example
///
/// ```
/// use terra_engine::terra::task::CompletionSignal;
///
/// let upload = CompletionSignal::new();
/// let draw = CompletionSignal::new();
/// draw.wait_on(&upload).unwrap();
///
/// upload.notify();
/// assert!(!draw.is_ready_to_run());
///
/// upload.signal();
/// assert!(draw.is_ready_to_run());
/// ```
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    completed: Condvar,
}

impl CompletionSignal {
    /// Create a new signal with no pending producers and no predicates
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                active_waiters: 0,
                cancelled: false,
                predicates: Vec::new(),
                error: None,
                listeners: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one more producer that will call `signal()`
    pub fn notify(&self) {
        self.lock().active_waiters += 1;
    }

    /// Mark one producer as done
    ///
    /// When the last producer signals, every thread blocked in `wait()` is
    /// woken and completion listeners run on the calling thread.
    ///
    /// Returns `false` (and changes nothing) if no producer was pending.
    pub fn signal(&self) -> bool {
        let listeners = {
            let mut state = self.lock();
            if state.active_waiters == 0 {
                return false;
            }
            state.active_waiters -= 1;
            if state.active_waiters > 0 {
                return true;
            }
            std::mem::take(&mut state.listeners)
        };

        self.completed.notify_all();
        for listener in listeners {
            listener();
        }
        true
    }

    /// Block until no producer is pending
    ///
    /// Returns immediately if nothing is pending. The counter is re-checked
    /// after every wake-up, so a `notify()` racing with a waiter keeps it
    /// blocked until the new producer signals as well.
    ///
    /// # Errors
    ///
    /// Returns the failure recorded by bound work, if any.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        while state.active_waiters > 0 {
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Bounded version of `wait()`
    ///
    /// Returns `Ok(true)` when the signal completed, `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.active_waiters > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .completed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(true),
        }
    }

    /// Make work bound to this signal wait until `other` (and its own
    /// predicates) have completed
    ///
    /// # Errors
    ///
    /// `Error::InvalidResource` if `other` is this signal or already depends
    /// on it (the dependency would never resolve).
    pub fn wait_on(&self, other: &Arc<CompletionSignal>) -> Result<()> {
        let this = self as *const CompletionSignal;
        if std::ptr::eq(this, Arc::as_ptr(other)) {
            return Err(Error::InvalidResource(
                "a signal cannot wait on itself".to_string(),
            ));
        }

        let mut creates_cycle = false;
        other.walk_predicates(|predicate| {
            if std::ptr::eq(Arc::as_ptr(predicate), this) {
                creates_cycle = true;
            }
            !creates_cycle
        });
        if creates_cycle {
            return Err(Error::InvalidResource(
                "signal dependency would form a cycle".to_string(),
            ));
        }

        self.lock().predicates.push(Arc::downgrade(other));
        Ok(())
    }

    /// Skip every work item bound to this signal (and to signals waiting on it)
    ///
    /// Skipped work still signals, so dependents are never deadlocked. Only
    /// takes effect for items that have not started running yet.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
    }

    /// Whether `cancel()` was called on this signal
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Whether this signal or any signal in its predicate chain was cancelled
    pub fn is_cancelled_transitively(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut cancelled = false;
        self.walk_predicates(|predicate| {
            cancelled |= predicate.is_cancelled();
            !cancelled
        });
        cancelled
    }

    /// True when every predicate has completed and is itself ready
    pub fn is_ready_to_run(&self) -> bool {
        let mut ready = true;
        self.walk_predicates(|predicate| {
            ready &= predicate.is_complete();
            ready
        });
        ready
    }

    /// True when no producer is pending
    pub fn is_complete(&self) -> bool {
        self.lock().active_waiters == 0
    }

    /// Number of producers that have not signaled yet
    pub fn active_waiters(&self) -> usize {
        self.lock().active_waiters
    }

    /// Record a failure (only the first one is kept)
    pub fn fail(&self, error: Error) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// Failure recorded by bound work, if any
    pub fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    /// Whether bound work recorded a failure
    pub fn is_failed(&self) -> bool {
        self.lock().error.is_some()
    }

    /// Number of predicates still alive
    pub fn predicate_count(&self) -> usize {
        self.live_predicates().len()
    }

    /// First failure found in the predicate chain, wrapped as `DependencyFailed`
    pub(crate) fn predicate_failure(&self) -> Option<Error> {
        let mut failure = None;
        self.walk_predicates(|predicate| {
            if let Some(error) = predicate.error() {
                failure = Some(Error::DependencyFailed(error.to_string()));
            }
            failure.is_none()
        });
        failure
    }

    /// Predicates (at any depth) that still have pending producers
    pub(crate) fn pending_predicates(&self) -> Vec<Arc<CompletionSignal>> {
        let mut pending = Vec::new();
        self.walk_predicates(|predicate| {
            if !predicate.is_complete() {
                pending.push(predicate.clone());
            }
            true
        });
        pending
    }

    /// Run `listener` when this signal next reaches zero pending producers
    ///
    /// Runs it immediately if nothing is pending. Listeners also fire when the
    /// signal is dropped, since a dropped predicate no longer blocks anything.
    pub(crate) fn on_complete(&self, listener: CompletionListener) {
        {
            let mut state = self.lock();
            if state.active_waiters > 0 {
                state.listeners.push(listener);
                return;
            }
        }
        listener();
    }

    /// Listeners waiting for this signal to complete
    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Upgrade live predicates, pruning the ones whose owner is gone
    fn live_predicates(&self) -> Vec<Arc<CompletionSignal>> {
        let mut state = self.lock();
        state.predicates.retain(|weak| weak.strong_count() > 0);
        state.predicates.iter().filter_map(Weak::upgrade).collect()
    }

    /// Depth-first walk over the transitive predicate set
    ///
    /// Each signal is visited once. `visit` returns `false` to stop the walk.
    /// Only one signal lock is held at a time.
    fn walk_predicates(&self, mut visit: impl FnMut(&Arc<CompletionSignal>) -> bool) {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        visited.insert(self as *const CompletionSignal as usize);

        let mut stack = self.live_predicates();
        while let Some(predicate) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&predicate) as usize) {
                continue;
            }
            if !visit(&predicate) {
                return;
            }
            stack.extend(predicate.live_predicates());
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for listener in std::mem::take(&mut state.listeners) {
            listener();
        }
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CompletionSignal")
            .field("active_waiters", &state.active_waiters)
            .field("cancelled", &state.cancelled)
            .field("predicates", &state.predicates.len())
            .field("error", &state.error)
            .finish()
    }
}

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;
