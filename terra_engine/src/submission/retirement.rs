//! Retirement queue - submissions waiting for their fence
//!
//! Every submitted command buffer leaves a `RetirementRecord` behind. The
//! record keeps the buffer, the fence and the resources the GPU still reads
//! alive until the fence signals; then the record is retired: the fence is
//! destroyed, the completion flag is set and the finish callback receives the
//! owned resources.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::submission::device::{
    CommandBufferHandle, CommandPoolHandle, FenceHandle, FenceStatus, QueueClass, SubmissionDevice,
};

/// A resource kept alive until the GPU is done with it
pub type OwnedResource = Box<dyn Any + Send>;

/// Called once the fence signals, with the resources the submission owned
pub type FinishCallback = Box<dyn FnOnce(Vec<OwnedResource>) + Send>;

/// Shared boolean set when a submission's fence has resolved
#[derive(Debug, Clone, Default)]
pub struct GpuFlag(Arc<AtomicBool>);

impl GpuFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the GPU finished the submission
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// One in-flight submission
pub struct RetirementRecord {
    /// Staging slot the command buffer was allocated from
    pub slot: usize,
    pub queue_class: QueueClass,
    pub command_pool: CommandPoolHandle,
    pub command_buffer: CommandBufferHandle,
    pub fence: FenceHandle,
    pub(crate) finish: Option<FinishCallback>,
    pub(crate) owned: Vec<OwnedResource>,
    pub(crate) flag: Option<GpuFlag>,
}

impl RetirementRecord {
    /// Destroy the fence, set the flag and hand the owned resources over
    ///
    /// The fence must be signaled. The command buffer is not freed here: it
    /// goes back to its staging pool, which only the pool's owner may touch.
    pub fn retire(mut self, device: &dyn SubmissionDevice) {
        device.destroy_fence(self.fence);
        if let Some(flag) = self.flag.take() {
            flag.set();
        }
        let owned = std::mem::take(&mut self.owned);
        match self.finish.take() {
            Some(finish) => finish(owned),
            None => drop(owned),
        }
    }

    /// Number of resources kept alive by this record
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }
}

impl fmt::Debug for RetirementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetirementRecord")
            .field("slot", &self.slot)
            .field("queue_class", &self.queue_class)
            .field("command_buffer", &self.command_buffer)
            .field("fence", &self.fence)
            .field("owned", &self.owned.len())
            .field("has_finish", &self.finish.is_some())
            .finish()
    }
}

/// FIFO of in-flight submissions
#[derive(Debug, Default)]
pub struct RetirementQueue {
    records: VecDeque<RetirementRecord>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RetirementRecord) {
        self.records.push_back(record);
    }

    /// Move every record of `other` to the back of this queue
    pub fn append(&mut self, other: &mut RetirementQueue) {
        self.records.append(&mut other.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// In-flight records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &RetirementRecord> {
        self.records.iter()
    }

    /// Remove every record whose fence has signaled, without blocking
    ///
    /// Records still pending keep their relative order. On a device error
    /// nothing is removed.
    pub fn take_completed(&mut self, device: &dyn SubmissionDevice) -> Result<Vec<RetirementRecord>> {
        let mut signaled = Vec::with_capacity(self.records.len());
        for record in &self.records {
            signaled.push(device.fence_status(record.fence)? == FenceStatus::Signaled);
        }

        let mut completed = Vec::new();
        let mut pending = VecDeque::with_capacity(self.records.len());
        for (record, done) in self.records.drain(..).zip(signaled) {
            if done {
                completed.push(record);
            } else {
                pending.push_back(record);
            }
        }
        self.records = pending;
        Ok(completed)
    }

    /// Block until every fence signals, then remove all records
    ///
    /// # Errors
    ///
    /// `Error::DeviceLost` if a fence is still pending after `timeout_ns`.
    /// The records stay queued in that case.
    pub fn wait_all(&mut self, device: &dyn SubmissionDevice, timeout_ns: u64) -> Result<Vec<RetirementRecord>> {
        for record in &self.records {
            if device.wait_fence(record.fence, timeout_ns)? == FenceStatus::Pending {
                return Err(Error::DeviceLost(format!(
                    "fence {:#x} not signaled after {} ms",
                    record.fence.as_raw(),
                    timeout_ns / 1_000_000
                )));
            }
        }
        Ok(self.records.drain(..).collect())
    }
}

#[cfg(test)]
#[path = "retirement_tests.rs"]
mod tests;
