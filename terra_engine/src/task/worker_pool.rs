//! Worker pool - fixed set of OS threads running dependency-ordered work
//!
//! Scheduling is event driven: an item whose predicates are all satisfied
//! goes straight to the FIFO ready queue; an item that still waits on some
//! signal is parked with a count of its pending predicates, and one
//! completion listener is registered on each of them. Every listener
//! decrements the count; the last one moves the item to the ready queue.
//! Workers never scan or requeue items that cannot run.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use slotmap::{new_key_type, SlotMap};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::log::LogHandle;
use crate::task::signal::CompletionSignal;
use crate::task::work_item::{WorkItem, WorkerContext};
use crate::{engine_debug, engine_error, engine_info, engine_warn};

const SOURCE: &str = "terra::WorkerPool";

new_key_type! {
    /// Key of a parked (not yet runnable) work item
    struct ParkedKey;
}

/// Item waiting for `remaining` predicates
struct ParkedItem {
    item: WorkItem,
    remaining: usize,
}

struct PoolQueue {
    /// Items whose predicates are satisfied, in submission order
    ready: VecDeque<WorkItem>,
    /// Items waiting for a predicate to complete
    parked: SlotMap<ParkedKey, ParkedItem>,
    /// Cleared by `stop()`
    running: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    work_submitted: Condvar,
    log: LogHandle,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of routing one item into the queue
enum Placement {
    Ready,
    Parked,
}

/// Fixed-size pool of worker threads sharing one work queue
///
/// # Example
///
/// ```
/// use terra_engine::terra::SchedulerConfig;
/// use terra_engine::terra::log::LogHandle;
/// use terra_engine::terra::task::{CompletionSignal, WorkerPool};
///
/// let config = SchedulerConfig { worker_count: 2, ..Default::default() };
/// let pool = WorkerPool::new(&config, LogHandle::silent()).unwrap();
///
/// let done = CompletionSignal::new();
/// pool.submit(|_| Ok(()), &done).unwrap();
/// done.wait().unwrap();
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn the worker threads
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` if a thread cannot be spawned. Threads
    /// spawned before the failure are stopped and joined.
    pub fn new(config: &SchedulerConfig, log: LogHandle) -> Result<Self> {
        let worker_count = config.resolved_worker_count();
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                ready: VecDeque::new(),
                parked: SlotMap::with_key(),
                running: true,
            }),
            work_submitted: Condvar::new(),
            log,
        });

        let mut pool = Self {
            shared,
            threads: Vec::with_capacity(worker_count),
            worker_count,
        };

        for worker_index in 0..worker_count {
            let shared = pool.shared.clone();
            let context = WorkerContext {
                worker_index,
                worker_count,
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, worker_index))
                .spawn(move || worker_loop(shared, context))
                .map_err(|e| {
                    engine_error!(pool.shared.log, SOURCE, "Failed to spawn worker {}: {}", worker_index, e);
                    Error::InitializationFailed(format!("Failed to spawn worker thread: {}", e))
                })?;
            pool.threads.push(handle);
        }

        engine_info!(pool.shared.log, SOURCE, "Started {} worker threads", worker_count);
        Ok(pool)
    }

    /// Wrap `work` and `signal` into a `WorkItem` and schedule it
    ///
    /// The signal gets one more pending producer, released when the work has
    /// run (or been skipped). Wakes one idle worker if the item is runnable.
    ///
    /// # Errors
    ///
    /// `Error::PoolStopped` after `stop()`; the signal is still released.
    pub fn submit<F>(&self, work: F, signal: &Arc<CompletionSignal>) -> Result<()>
    where
        F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
    {
        self.submit_item(WorkItem::new(work, signal))
    }

    /// Schedule a prepared work item
    pub fn submit_item(&self, item: WorkItem) -> Result<()> {
        if let Placement::Ready = schedule(&self.shared, item)? {
            self.shared.work_submitted.notify_one();
        }
        Ok(())
    }

    /// Schedule several items at once and wake every idle worker
    ///
    /// All items are routed even if the pool is stopped; in that case every
    /// item is released with `Error::PoolStopped` and the error is returned.
    pub fn submit_items(&self, items: Vec<WorkItem>) -> Result<()> {
        let mut result = Ok(());
        for item in items {
            if let Err(error) = schedule(&self.shared, item) {
                result = Err(error);
            }
        }
        self.shared.work_submitted.notify_all();
        result
    }

    /// Stop the workers
    ///
    /// Workers finish the item they are running and exit. Items still queued
    /// or parked are dropped, which releases their signals with
    /// `Error::PoolStopped`. Idempotent.
    pub fn stop(&self) {
        let dropped: Vec<WorkItem> = {
            let mut queue = self.shared.lock();
            if !queue.running {
                return;
            }
            queue.running = false;
            let mut dropped: Vec<WorkItem> = queue.ready.drain(..).collect();
            dropped.extend(queue.parked.drain().map(|(_, parked)| parked.item));
            dropped
        };
        self.shared.work_submitted.notify_all();

        if !dropped.is_empty() {
            engine_warn!(self.shared.log, SOURCE, "Stopping with {} unfinished work items", dropped.len());
        }
        // Released outside the queue lock: completion listeners may re-enter the pool
        drop(dropped);
        engine_debug!(self.shared.log, SOURCE, "Worker pool stopped");
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Whether `stop()` has not been called yet
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Items ready to run but not yet picked up by a worker
    pub fn queued_count(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// Items waiting for a predicate
    pub fn parked_count(&self) -> usize {
        self.shared.lock().parked.len()
    }

    /// Log handle the pool was built with
    pub fn log(&self) -> &LogHandle {
        &self.shared.log
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // The last reference may be released from inside a work closure
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                engine_error!(self.shared.log, SOURCE, "A worker thread panicked");
            }
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("queued", &self.queued_count())
            .field("parked", &self.parked_count())
            .finish()
    }
}

/// Route an item to the ready queue or park it until its predicates complete
fn schedule(shared: &Arc<PoolShared>, item: WorkItem) -> Result<Placement> {
    let pending = item.pending_predicates();

    let mut queue = shared.lock();
    if !queue.running {
        drop(queue);
        drop(item);
        return Err(Error::PoolStopped);
    }
    if pending.is_empty() {
        queue.ready.push_back(item);
        return Ok(Placement::Ready);
    }
    let key = queue.parked.insert(ParkedItem {
        item,
        remaining: pending.len(),
    });
    drop(queue);

    // Registered after the insert: a listener may fire right away
    for predicate in pending {
        let weak = Arc::downgrade(shared);
        predicate.on_complete(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                predicate_completed(&shared, key);
            }
        }));
    }
    Ok(Placement::Parked)
}

/// Count down one predicate of a parked item; the last one releases it
///
/// The slot is gone if `stop()` already dropped the item.
fn predicate_completed(shared: &Arc<PoolShared>, key: ParkedKey) {
    let item = {
        let mut queue = shared.lock();
        let Some(parked) = queue.parked.get_mut(key) else {
            return;
        };
        parked.remaining -= 1;
        if parked.remaining > 0 {
            return;
        }
        queue.parked.remove(key).map(|parked| parked.item)
    };
    let Some(item) = item else {
        return;
    };
    // Re-checked: predicates may have been added since the item was parked
    if let Ok(Placement::Ready) = schedule(shared, item) {
        shared.work_submitted.notify_one();
    }
}

fn worker_loop(shared: Arc<PoolShared>, context: WorkerContext) {
    loop {
        let item = {
            let mut queue = shared.lock();
            loop {
                if !queue.running {
                    return;
                }
                if let Some(item) = queue.ready.pop_front() {
                    break item;
                }
                queue = shared
                    .work_submitted
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        item.run(&context, &shared.log);
    }
}

#[cfg(test)]
#[path = "worker_pool_tests.rs"]
mod tests;
