//! AsyncSubmissionManager - records GPU work on the worker pool and retires it
//! from the frame thread
//!
//! Worker `i` records into staging slot `i`; the caller thread uses the extra
//! slot at the end of the arena. Submitted buffers wait in the retirement
//! queue until `poll_retirements` sees their fence signaled.
//!
//! Nothing the GPU may still read is released before its fence signals. When
//! the device stops answering, the manager leaks its pools and records
//! instead.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::log::LogHandle;
use crate::submission::command_staging::StagingArena;
use crate::submission::device::SubmissionDevice;
use crate::submission::gpu_work::{record_and_submit, GpuWork};
use crate::submission::retirement::{RetirementQueue, RetirementRecord};
use crate::task::signal::CompletionSignal;
use crate::task::worker_pool::WorkerPool;
use crate::{engine_debug, engine_error, engine_trace};

const SOURCE: &str = "terra::AsyncSubmission";

struct SubmissionShared {
    device: Arc<dyn SubmissionDevice>,
    arena: StagingArena,
    retirements: Mutex<RetirementQueue>,
    /// Submissions handed to the pool and not yet recorded (or dropped)
    outstanding: Mutex<usize>,
    drained: Condvar,
    fence_timeout_ns: u64,
    log: LogHandle,
}

impl SubmissionShared {
    fn lock_retirements(&self) -> MutexGuard<'_, RetirementQueue> {
        self.retirements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every pool-queued submission has been recorded or dropped
    ///
    /// Returns the number still outstanding when `timeout` ran out.
    fn wait_outstanding(&self, timeout: Duration) -> usize {
        let outstanding = self.lock_outstanding();
        let (outstanding, _) = self
            .drained
            .wait_timeout_while(outstanding, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *outstanding
    }

    /// Record and submit on the thread that owns `slot`, then queue the record
    fn submit_on_slot(&self, slot: usize, work: GpuWork) -> Result<()> {
        let record = {
            let mut staging = self.arena.slot(slot)?;
            record_and_submit(self.device.as_ref(), &mut staging, work, slot)?
        };
        engine_trace!(
            self.log,
            SOURCE,
            "Submitted {} work from slot {} (fence {:#x})",
            record.queue_class,
            slot,
            record.fence.as_raw()
        );
        self.lock_retirements().push(record);
        Ok(())
    }

    /// Free the buffer into its slot, then retire the record
    ///
    /// The slot lock is released before the finish callback runs, so the
    /// callback may submit more work.
    fn retire(&self, record: RetirementRecord) {
        match self.arena.slot(record.slot) {
            Ok(mut staging) => staging.free(record.command_pool, record.command_buffer),
            Err(error) => engine_error!(self.log, SOURCE, "Cannot free retired command buffer: {}", error),
        }
        record.retire(self.device.as_ref());
    }
}

/// Counts one pool-queued submission until the closure carrying it is gone
///
/// Dropped after the record is queued, or unrun when the pool stops.
struct OutstandingSubmission {
    shared: Arc<SubmissionShared>,
}

impl OutstandingSubmission {
    fn new(shared: &Arc<SubmissionShared>) -> Self {
        *shared.lock_outstanding() += 1;
        Self {
            shared: shared.clone(),
        }
    }

    /// Record on the worker's slot; the count drops once the record is queued
    fn submit_on_slot(self, slot: usize, work: GpuWork) -> Result<()> {
        self.shared.submit_on_slot(slot, work)
    }
}

impl Drop for OutstandingSubmission {
    fn drop(&mut self) {
        let mut outstanding = self.shared.lock_outstanding();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.shared.drained.notify_all();
        }
    }
}

/// Asynchronous command recording and fence-based retirement
///
/// `poll_retirements` is meant to be called once per frame by the thread that
/// drives rendering; it never blocks.
pub struct AsyncSubmissionManager {
    shared: Arc<SubmissionShared>,
    pool: Arc<WorkerPool>,
}

impl AsyncSubmissionManager {
    /// Create one staging slot per worker of `pool` plus the caller slot
    pub fn new(
        device: Arc<dyn SubmissionDevice>,
        pool: Arc<WorkerPool>,
        config: &SchedulerConfig,
        log: LogHandle,
    ) -> Self {
        let arena = StagingArena::new(device.clone(), pool.worker_count());
        engine_debug!(log, SOURCE, "Created {} staging slots", arena.slot_count());
        Self {
            shared: Arc::new(SubmissionShared {
                device,
                arena,
                retirements: Mutex::new(RetirementQueue::new()),
                outstanding: Mutex::new(0),
                drained: Condvar::new(),
                fence_timeout_ns: config.fence_timeout_ns,
                log,
            }),
            pool,
        }
    }

    /// Record and submit `work` on a worker thread
    ///
    /// `signal` completes once the work has been submitted, not when the GPU
    /// is done with it (use `GpuWork::with_flag` or `on_finish` for that).
    /// Recording or submission failures are recorded on `signal`.
    ///
    /// # Errors
    ///
    /// `Error::PoolStopped` if the worker pool no longer accepts work.
    pub fn submit_gpu_work(&self, work: GpuWork, signal: &Arc<CompletionSignal>) -> Result<()> {
        let outstanding = OutstandingSubmission::new(&self.shared);
        self.pool
            .submit(move |ctx| outstanding.submit_on_slot(ctx.worker_index, work), signal)
    }

    /// Record and submit `work` on the calling thread, using the caller slot
    pub fn submit_gpu_work_on_caller(&self, work: GpuWork) -> Result<()> {
        let slot = self.shared.arena.caller_slot_index();
        self.shared.submit_on_slot(slot, work)
    }

    /// Retire every submission whose fence has signaled
    ///
    /// Never blocks on the GPU. Submissions still in flight stay queued in
    /// their original order. Finish callbacks run on the calling thread,
    /// outside the retirement lock.
    ///
    /// Returns the number of retired submissions.
    pub fn poll_retirements(&self) -> Result<usize> {
        let completed = self
            .shared
            .lock_retirements()
            .take_completed(self.shared.device.as_ref())
            .map_err(|error| {
                engine_error!(self.shared.log, SOURCE, "Fence query failed: {}", error);
                error
            })?;

        let count = completed.len();
        for record in completed {
            self.shared.retire(record);
        }
        if count > 0 {
            engine_trace!(self.shared.log, SOURCE, "Retired {} submissions", count);
        }
        Ok(count)
    }

    /// Block until every submission made so far has retired
    ///
    /// # Errors
    ///
    /// `Error::DeviceLost` if a fence does not signal within the configured
    /// timeout. Nothing is retired in that case.
    pub fn wait_idle(&self) -> Result<()> {
        let mut in_flight = std::mem::take(&mut *self.shared.lock_retirements());
        if in_flight.is_empty() {
            return Ok(());
        }

        match in_flight.wait_all(self.shared.device.as_ref(), self.shared.fence_timeout_ns) {
            Ok(records) => {
                for record in records {
                    self.shared.retire(record);
                }
                Ok(())
            }
            Err(error) => {
                engine_error!(self.shared.log, SOURCE, "Waiting for submissions failed: {}", error);
                // Put the records back in front of anything submitted meanwhile
                let mut queue = self.shared.lock_retirements();
                in_flight.append(&mut queue);
                *queue = in_flight;
                Err(error)
            }
        }
    }

    /// Submissions waiting for their fence
    pub fn pending_retirements(&self) -> usize {
        self.shared.lock_retirements().len()
    }

    pub fn staging_arena(&self) -> &StagingArena {
        &self.shared.arena
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

impl Drop for AsyncSubmissionManager {
    fn drop(&mut self) {
        // Work still queued on the pool pushes its record after this point
        let timeout = Duration::from_nanos(self.shared.fence_timeout_ns);
        let outstanding = self.shared.wait_outstanding(timeout);
        let result = if outstanding == 0 {
            self.wait_idle()
        } else {
            Err(Error::DeviceLost(format!(
                "{} submissions still recording after {} ms",
                outstanding,
                timeout.as_millis()
            )))
        };

        if let Err(error) = result {
            engine_error!(
                self.shared.log,
                SOURCE,
                "Leaking staging pools and {} unretired submissions: {}",
                self.pending_retirements(),
                error
            );
            // Pending fences may still guard the pools, buffers and owned resources
            std::mem::forget(Arc::clone(&self.shared));
        }
    }
}

impl fmt::Debug for AsyncSubmissionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSubmissionManager")
            .field("staging_slots", &self.shared.arena.slot_count())
            .field("pending_retirements", &self.pending_retirements())
            .finish()
    }
}

#[cfg(test)]
#[path = "async_submission_tests.rs"]
mod tests;
