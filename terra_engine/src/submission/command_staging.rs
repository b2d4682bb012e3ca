//! Per-thread command pools
//!
//! Command pools are externally synchronized, so every recording thread gets
//! its own set: one `CommandStagingPool` per worker plus one for the thread
//! that drives the frame. The `StagingArena` holds those slots and is indexed
//! with `WorkerContext::worker_index`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::submission::device::{CommandBufferHandle, CommandPoolHandle, QueueClass, SubmissionDevice};

/// Lazily created command pools (one per queue class) for a single thread
pub struct CommandStagingPool {
    device: Arc<dyn SubmissionDevice>,
    pools: [Option<CommandPoolHandle>; 3],
    live_buffers: usize,
}

impl CommandStagingPool {
    pub fn new(device: Arc<dyn SubmissionDevice>) -> Self {
        Self {
            device,
            pools: [None; 3],
            live_buffers: 0,
        }
    }

    /// Pool for `class`, created on first use
    pub fn pool_for(&mut self, class: QueueClass) -> Result<CommandPoolHandle> {
        let slot = &mut self.pools[class.index()];
        if let Some(pool) = *slot {
            return Ok(pool);
        }
        let pool = self.device.create_command_pool(class)?;
        *slot = Some(pool);
        Ok(pool)
    }

    /// Allocate one primary command buffer from the pool of `class`
    pub fn allocate(&mut self, class: QueueClass) -> Result<(CommandPoolHandle, CommandBufferHandle)> {
        let pool = self.pool_for(class)?;
        let command_buffer = self.device.allocate_command_buffer(pool)?;
        self.live_buffers += 1;
        Ok((pool, command_buffer))
    }

    /// Return a buffer allocated by this staging pool
    pub fn free(&mut self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        debug_assert!(self.owns(pool), "command buffer returned to a foreign staging pool");
        self.device.free_command_buffer(pool, command_buffer);
        self.live_buffers = self.live_buffers.saturating_sub(1);
    }

    /// Whether `pool` was created by this staging pool
    pub fn owns(&self, pool: CommandPoolHandle) -> bool {
        self.pools.iter().any(|p| *p == Some(pool))
    }

    /// Buffers allocated and not yet freed
    pub fn live_buffers(&self) -> usize {
        self.live_buffers
    }

    /// Number of pools created so far
    pub fn pool_count(&self) -> usize {
        self.pools.iter().flatten().count()
    }

    pub fn device(&self) -> &Arc<dyn SubmissionDevice> {
        &self.device
    }
}

impl Drop for CommandStagingPool {
    fn drop(&mut self) {
        // Destroying a pool frees every buffer still allocated from it
        for pool in self.pools.iter_mut().filter_map(Option::take) {
            self.device.destroy_command_pool(pool);
        }
    }
}

impl fmt::Debug for CommandStagingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStagingPool")
            .field("pools", &self.pools)
            .field("live_buffers", &self.live_buffers)
            .finish()
    }
}

/// One staging slot per worker plus one for the caller thread
pub struct StagingArena {
    slots: Vec<Mutex<CommandStagingPool>>,
}

impl StagingArena {
    /// Build `worker_count + 1` slots; the last one is the caller slot
    pub fn new(device: Arc<dyn SubmissionDevice>, worker_count: usize) -> Self {
        let slots = (0..=worker_count)
            .map(|_| Mutex::new(CommandStagingPool::new(device.clone())))
            .collect();
        Self { slots }
    }

    /// Lock slot `index`
    ///
    /// Slot `i` is only recorded into from worker `i`, so the lock is
    /// uncontended except when retired buffers are freed back into it.
    pub fn slot(&self, index: usize) -> Result<MutexGuard<'_, CommandStagingPool>> {
        let slot = self.slots.get(index).ok_or_else(|| {
            Error::InvalidResource(format!(
                "staging slot {} out of range ({} slots)",
                index,
                self.slots.len()
            ))
        })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Slot used by the thread that calls the synchronous submission path
    pub fn caller_slot_index(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Buffers allocated and not yet freed, over every slot
    pub fn live_buffers(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).live_buffers())
            .sum()
    }
}

impl fmt::Debug for StagingArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingArena")
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "command_staging_tests.rs"]
mod tests;
