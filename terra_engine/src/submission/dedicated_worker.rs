//! DedicatedCommandWorker - one thread that records, submits and retires on
//! its own
//!
//! Meant for long-lived streams (asset uploads, terrain streaming) that
//! should not compete with frame work on the shared pool. The worker owns its
//! command pools and retirement queue outright, so neither is ever touched by
//! another thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::log::LogHandle;
use crate::submission::command_staging::CommandStagingPool;
use crate::submission::device::SubmissionDevice;
use crate::submission::gpu_work::{record_and_submit, GpuWork};
use crate::submission::retirement::RetirementQueue;
use crate::task::signal::CompletionSignal;
use crate::task::work_item::SignalGuard;
use crate::{engine_debug, engine_error, engine_info, engine_warn};

const SOURCE: &str = "terra::DedicatedWorker";

/// The worker's single staging pool
const DEDICATED_SLOT: usize = 0;

struct DedicatedJob {
    work: GpuWork,
    guard: SignalGuard,
}

struct JobQueue {
    jobs: VecDeque<DedicatedJob>,
    running: bool,
}

struct DedicatedShared {
    queue: Mutex<JobQueue>,
    job_submitted: Condvar,
    in_flight: AtomicUsize,
    log: LogHandle,
}

impl DedicatedShared {
    fn lock(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settings copied into the worker thread
struct LoopSettings {
    name: String,
    poll_interval: Duration,
    fence_timeout_ns: u64,
}

/// Single-thread command recorder with private command pools
pub struct DedicatedCommandWorker {
    name: String,
    shared: Arc<DedicatedShared>,
    thread: Option<JoinHandle<()>>,
}

impl DedicatedCommandWorker {
    /// Spawn the worker thread
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` if the thread cannot be spawned.
    pub fn spawn(
        name: &str,
        device: Arc<dyn SubmissionDevice>,
        config: &SchedulerConfig,
        log: LogHandle,
    ) -> Result<Self> {
        let shared = Arc::new(DedicatedShared {
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                running: true,
            }),
            job_submitted: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            log,
        });

        let settings = LoopSettings {
            name: name.to_string(),
            poll_interval: config.dedicated_poll_interval,
            fence_timeout_ns: config.fence_timeout_ns,
        };
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dedicated_loop(thread_shared, device, settings))
            .map_err(|e| {
                engine_error!(shared.log, SOURCE, "Failed to spawn dedicated worker '{}': {}", name, e);
                Error::InitializationFailed(format!("Failed to spawn dedicated worker: {}", e))
            })?;

        engine_info!(shared.log, SOURCE, "Dedicated worker '{}' started", name);
        Ok(Self {
            name: name.to_string(),
            shared,
            thread: Some(thread),
        })
    }

    /// Queue `work` for recording on the worker thread
    ///
    /// `signal` completes once the work is submitted (or failed).
    ///
    /// # Errors
    ///
    /// `Error::PoolStopped` after `stop()`; the signal is still released.
    pub fn submit(&self, work: GpuWork, signal: &Arc<CompletionSignal>) -> Result<()> {
        let job = DedicatedJob {
            work,
            guard: SignalGuard::bind(signal),
        };
        let mut queue = self.shared.lock();
        if !queue.running {
            drop(queue);
            drop(job);
            return Err(Error::PoolStopped);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.job_submitted.notify_one();
        Ok(())
    }

    /// Stop accepting work
    ///
    /// Queued jobs are dropped (their signals fail with `Error::PoolStopped`).
    /// The thread then waits for its in-flight submissions, retires them and
    /// exits. Submissions whose fence never signals are leaked along with the
    /// worker's command pools. Idempotent; `Drop` joins the thread.
    pub fn stop(&self) {
        let dropped: Vec<DedicatedJob> = {
            let mut queue = self.shared.lock();
            if !queue.running {
                return;
            }
            queue.running = false;
            queue.jobs.drain(..).collect()
        };
        self.shared.job_submitted.notify_all();
        if !dropped.is_empty() {
            engine_warn!(
                self.shared.log,
                SOURCE,
                "Dedicated worker '{}' stopping with {} queued jobs",
                self.name,
                dropped.len()
            );
        }
        drop(dropped);
    }

    /// Jobs queued but not yet recorded
    pub fn pending_jobs(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Submissions waiting for their fence
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DedicatedCommandWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                engine_error!(self.shared.log, SOURCE, "Dedicated worker '{}' panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for DedicatedCommandWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedicatedCommandWorker")
            .field("name", &self.name)
            .field("pending_jobs", &self.pending_jobs())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn dedicated_loop(shared: Arc<DedicatedShared>, device: Arc<dyn SubmissionDevice>, settings: LoopSettings) {
    let log = shared.log.clone();
    let mut staging = CommandStagingPool::new(device.clone());
    let mut retirements = RetirementQueue::new();

    loop {
        let jobs: Vec<DedicatedJob> = {
            let mut queue = shared.lock();
            loop {
                if !queue.running || !queue.jobs.is_empty() {
                    break;
                }
                if retirements.is_empty() {
                    queue = shared
                        .job_submitted
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                } else {
                    let (guard, timeout) = shared
                        .job_submitted
                        .wait_timeout(queue, settings.poll_interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    queue = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
            }
            if !queue.running {
                break;
            }
            queue.jobs.drain(..).collect()
        };

        for job in jobs {
            let result = record_and_submit(device.as_ref(), &mut staging, job.work, DEDICATED_SLOT)
                .map(|record| retirements.push(record));
            if let Err(error) = &result {
                engine_error!(log, SOURCE, "'{}' failed to submit work: {}", settings.name, error);
            }
            job.guard.complete(result);
        }

        retire_completed(device.as_ref(), &mut staging, &mut retirements, &log);
        shared.in_flight.store(retirements.len(), Ordering::Release);
    }

    // Shutdown: let the GPU finish what was submitted
    match retirements.wait_all(device.as_ref(), settings.fence_timeout_ns) {
        Ok(records) => {
            for record in records {
                staging.free(record.command_pool, record.command_buffer);
                record.retire(device.as_ref());
            }
        }
        Err(error) => {
            engine_error!(
                log,
                SOURCE,
                "'{}' leaking its command pools and {} unretired submissions: {}",
                settings.name,
                retirements.len(),
                error
            );
            // The GPU may still read the buffers and the owned resources
            std::mem::forget(retirements);
            std::mem::forget(staging);
        }
    }
    shared.in_flight.store(0, Ordering::Release);
    engine_debug!(log, SOURCE, "Dedicated worker '{}' exited", settings.name);
}

fn retire_completed(
    device: &dyn SubmissionDevice,
    staging: &mut CommandStagingPool,
    retirements: &mut RetirementQueue,
    log: &LogHandle,
) {
    match retirements.take_completed(device) {
        Ok(records) => {
            for record in records {
                staging.free(record.command_pool, record.command_buffer);
                record.retire(device);
            }
        }
        Err(error) => engine_error!(log, SOURCE, "Fence query failed: {}", error),
    }
}

#[cfg(test)]
#[path = "dedicated_worker_tests.rs"]
mod tests;
