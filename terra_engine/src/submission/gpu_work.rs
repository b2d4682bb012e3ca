//! GpuWork - description of one command-buffer submission

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{Error, Result};
use crate::submission::command_staging::CommandStagingPool;
use crate::submission::device::{
    resolve_class, CommandBufferHandle, QueueClass, SemaphoreHandle, SemaphoreWait, SubmissionDevice,
};
use crate::submission::retirement::{FinishCallback, GpuFlag, OwnedResource, RetirementRecord};
use crate::task::work_item::panic_message;

/// Closure recording commands into a command buffer in the recording state
pub type RecordFn = Box<dyn FnOnce(CommandBufferHandle) -> Result<()> + Send>;

/// Commands to record and submit, plus what to do when the GPU is done
///
/// # Example
///
/// ```
/// use terra_engine::terra::submission::{GpuFlag, GpuWork, QueueClass};
///
/// let uploaded = GpuFlag::new();
/// let work = GpuWork::new(QueueClass::Transfer, |_cmd| Ok(()))
///     .own(vec![0u8; 256])
///     .with_flag(uploaded.clone())
///     .on_finish(|resources| drop(resources));
/// assert_eq!(work.class(), QueueClass::Transfer);
/// ```
pub struct GpuWork {
    class: QueueClass,
    record: RecordFn,
    finish: Option<FinishCallback>,
    wait_semaphores: Vec<SemaphoreWait>,
    signal_semaphores: Vec<SemaphoreHandle>,
    owned: Vec<OwnedResource>,
    flag: Option<GpuFlag>,
}

impl GpuWork {
    pub fn new<F>(class: QueueClass, record: F) -> Self
    where
        F: FnOnce(CommandBufferHandle) -> Result<()> + Send + 'static,
    {
        Self {
            class,
            record: Box::new(record),
            finish: None,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            owned: Vec::new(),
            flag: None,
        }
    }

    /// Callback run on the polling thread once the fence has signaled
    ///
    /// It receives every resource passed to `own`, in order.
    pub fn on_finish<F>(mut self, finish: F) -> Self
    where
        F: FnOnce(Vec<OwnedResource>) + Send + 'static,
    {
        self.finish = Some(Box::new(finish));
        self
    }

    /// Make the submission wait on `semaphore` at `stage_mask`
    pub fn wait_semaphore(mut self, semaphore: SemaphoreHandle, stage_mask: u32) -> Self {
        self.wait_semaphores.push(SemaphoreWait { semaphore, stage_mask });
        self
    }

    /// Signal `semaphore` when the submission completes
    pub fn signal_semaphore(mut self, semaphore: SemaphoreHandle) -> Self {
        self.signal_semaphores.push(semaphore);
        self
    }

    /// Keep `resource` alive until the fence signals
    pub fn own<R: Send + 'static>(mut self, resource: R) -> Self {
        self.owned.push(Box::new(resource));
        self
    }

    /// Set `flag` when the fence resolves
    pub fn with_flag(mut self, flag: GpuFlag) -> Self {
        self.flag = Some(flag);
        self
    }

    /// Requested queue class
    pub fn class(&self) -> QueueClass {
        self.class
    }
}

impl fmt::Debug for GpuWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuWork")
            .field("class", &self.class)
            .field("wait_semaphores", &self.wait_semaphores)
            .field("signal_semaphores", &self.signal_semaphores)
            .field("owned", &self.owned.len())
            .field("has_finish", &self.finish.is_some())
            .finish()
    }
}

/// Record `work` into a fresh buffer from `staging` and submit it
///
/// Must run on the thread that owns `staging`. On success the returned record
/// owns the command buffer, the fence and the work's resources. On failure the
/// buffer is freed, the fence destroyed and the resources dropped; the finish
/// callback never runs.
pub fn record_and_submit(
    device: &dyn SubmissionDevice,
    staging: &mut CommandStagingPool,
    work: GpuWork,
    slot: usize,
) -> Result<RetirementRecord> {
    let GpuWork {
        class,
        record,
        finish,
        wait_semaphores,
        signal_semaphores,
        owned,
        flag,
    } = work;

    let class = resolve_class(device.supported_classes(), class);
    let (command_pool, command_buffer) = staging.allocate(class)?;

    let fence = match record_commands(device, command_buffer, record).and_then(|()| device.create_fence()) {
        Ok(fence) => fence,
        Err(error) => {
            staging.free(command_pool, command_buffer);
            return Err(error);
        }
    };

    if let Err(error) = device.submit(class, command_buffer, &wait_semaphores, &signal_semaphores, fence) {
        device.destroy_fence(fence);
        staging.free(command_pool, command_buffer);
        return Err(error);
    }

    Ok(RetirementRecord {
        slot,
        queue_class: class,
        command_pool,
        command_buffer,
        fence,
        finish,
        owned,
        flag,
    })
}

/// begin / record / end, with the recording closure behind a panic boundary
fn record_commands(device: &dyn SubmissionDevice, command_buffer: CommandBufferHandle, record: RecordFn) -> Result<()> {
    device.begin_command_buffer(command_buffer)?;
    match panic::catch_unwind(AssertUnwindSafe(|| record(command_buffer))) {
        Ok(result) => result?,
        Err(payload) => {
            return Err(Error::WorkFailed(format!(
                "command recording panicked: {}",
                panic_message(payload.as_ref())
            )))
        }
    }
    device.end_command_buffer(command_buffer)
}

#[cfg(test)]
#[path = "gpu_work_tests.rs"]
mod tests;
