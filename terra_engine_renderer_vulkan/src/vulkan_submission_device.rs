/// VulkanSubmissionDevice - ash implementation of SubmissionDevice
///
/// Wraps a logical device and one queue per queue class. Command pools are
/// created TRANSIENT (buffers are recorded once and freed after their fence),
/// buffers are begun with ONE_TIME_SUBMIT. Queue access goes through a mutex
/// per VkQueue since vkQueueSubmit requires external synchronization; classes
/// given the same queue share its mutex.

use ash::vk;
use ash::vk::Handle;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, PoisonError};

use terra_engine::terra::log::LogHandle;
use terra_engine::terra::submission::{
    resolve_class, CommandBufferHandle, CommandPoolHandle, FenceHandle, FenceStatus, QueueClass,
    QueueClassFlags, SemaphoreHandle, SemaphoreWait, SubmissionDevice,
};
use terra_engine::terra::{Error, Result};
use terra_engine::{engine_debug, engine_err, engine_error};

const SOURCE: &str = "terra::vulkan";

/// A device queue and the family it belongs to
pub struct VulkanQueue {
    queue: Mutex<vk::Queue>,
    family_index: u32,
}

impl VulkanQueue {
    pub fn new(queue: vk::Queue, family_index: u32) -> Self {
        Self {
            queue: Mutex::new(queue),
            family_index,
        }
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    fn raw_handle(&self) -> u64 {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).as_raw()
    }
}

/// Give every class naming the same VkQueue one shared `VulkanQueue`
fn share_queue_locks(
    queues: FxHashMap<QueueClass, VulkanQueue>,
) -> Result<FxHashMap<QueueClass, Arc<VulkanQueue>>> {
    let mut by_handle: FxHashMap<u64, Arc<VulkanQueue>> = FxHashMap::default();
    let mut shared = FxHashMap::default();
    for (class, queue) in queues {
        let raw = queue.raw_handle();
        let queue = match by_handle.get(&raw) {
            Some(existing) if existing.family_index != queue.family_index => {
                return Err(Error::InvalidResource(format!(
                    "Queue {:#x} given for families {} and {}",
                    raw, existing.family_index, queue.family_index
                )));
            }
            Some(existing) => existing.clone(),
            None => {
                let queue = Arc::new(queue);
                by_handle.insert(raw, queue.clone());
                queue
            }
        };
        shared.insert(class, queue);
    }
    Ok(shared)
}

/// Vulkan command pools, fences and queues for the submission layer
///
/// The logical device is borrowed, not owned: whoever created it (renderer or
/// `HeadlessContext`) destroys it after this object is gone.
pub struct VulkanSubmissionDevice {
    device: ash::Device,
    queues: FxHashMap<QueueClass, Arc<VulkanQueue>>,
    supported: QueueClassFlags,
    log: LogHandle,
}

impl VulkanSubmissionDevice {
    /// Create the submission device
    ///
    /// # Arguments
    ///
    /// * `device` - Vulkan logical device
    /// * `queues` - One queue per available class; graphics is required. The
    ///   same VkQueue may serve several classes.
    /// * `log` - Log handle for backend errors
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` if no graphics queue is given.
    /// `Error::InvalidResource` if one VkQueue is given with two families.
    pub fn new(device: ash::Device, queues: FxHashMap<QueueClass, VulkanQueue>, log: LogHandle) -> Result<Self> {
        if !queues.contains_key(&QueueClass::Graphics) {
            engine_error!(log, SOURCE, "Submission device created without a graphics queue");
            return Err(Error::InitializationFailed("A graphics queue is required".to_string()));
        }
        let queues = share_queue_locks(queues).map_err(|error| {
            engine_error!(log, SOURCE, "Invalid queue set: {}", error);
            error
        })?;

        let supported = queues
            .keys()
            .fold(QueueClassFlags::empty(), |flags, class| flags | class.flag());
        for (class, queue) in &queues {
            engine_debug!(log, SOURCE, "{} queue on family {}", class, queue.family_index);
        }

        Ok(Self {
            device,
            queues,
            supported,
            log,
        })
    }

    /// Logical device, for recording closures
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Queue family used for work of `class`
    pub fn family_index(&self, class: QueueClass) -> u32 {
        self.queue(class).family_index
    }

    fn queue(&self, class: QueueClass) -> &VulkanQueue {
        let class = resolve_class(self.supported, class);
        // Graphics is always present (checked in new)
        &self.queues[&class]
    }

    /// Turn a Vulkan error code into an engine error, logging it
    fn vk_error(&self, what: &str, result: vk::Result) -> Error {
        match result {
            vk::Result::ERROR_DEVICE_LOST => {
                engine_error!(self.log, SOURCE, "{}: device lost", what);
                Error::DeviceLost(format!("{}: {:?}", what, result))
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                engine_error!(self.log, SOURCE, "{}: out of memory ({:?})", what, result);
                Error::OutOfMemory
            }
            _ => engine_err!(self.log, SOURCE, "{}: {:?}", what, result),
        }
    }
}

// ===== HANDLE CONVERSIONS =====

/// Vulkan command buffer behind a submission handle
pub fn command_buffer(handle: CommandBufferHandle) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(handle.as_raw())
}

/// Submission handle for a Vulkan semaphore
pub fn semaphore_handle(semaphore: vk::Semaphore) -> SemaphoreHandle {
    SemaphoreHandle::from_raw(semaphore.as_raw())
}

fn vk_pool(pool: CommandPoolHandle) -> vk::CommandPool {
    vk::CommandPool::from_raw(pool.as_raw())
}

fn vk_fence(fence: FenceHandle) -> vk::Fence {
    vk::Fence::from_raw(fence.as_raw())
}

fn vk_semaphore(semaphore: SemaphoreHandle) -> vk::Semaphore {
    vk::Semaphore::from_raw(semaphore.as_raw())
}

impl SubmissionDevice for VulkanSubmissionDevice {
    fn supported_classes(&self) -> QueueClassFlags {
        self.supported
    }

    fn create_command_pool(&self, class: QueueClass) -> Result<CommandPoolHandle> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.family_index(class))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(|e| self.vk_error("Failed to create command pool", e))?;
        Ok(CommandPoolHandle::from_raw(pool.as_raw()))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        unsafe {
            self.device.destroy_command_pool(vk_pool(pool), None);
        }
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> Result<CommandBufferHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk_pool(pool))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| self.vk_error("Failed to allocate command buffer", e))?;
        buffers
            .first()
            .map(|cmd| CommandBufferHandle::from_raw(cmd.as_raw()))
            .ok_or_else(|| engine_err!(self.log, SOURCE, "Driver returned no command buffer"))
    }

    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        unsafe {
            self.device
                .free_command_buffers(vk_pool(pool), &[self::command_buffer(command_buffer)]);
        }
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self::command_buffer(command_buffer), &begin_info)
        }
        .map_err(|e| self.vk_error("Failed to begin command buffer", e))
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        unsafe { self.device.end_command_buffer(self::command_buffer(command_buffer)) }
            .map_err(|e| self.vk_error("Failed to end command buffer", e))
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let create_info = vk::FenceCreateInfo::default();
        let fence = unsafe { self.device.create_fence(&create_info, None) }
            .map_err(|e| self.vk_error("Failed to create fence", e))?;
        Ok(FenceHandle::from_raw(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        unsafe {
            self.device.destroy_fence(vk_fence(fence), None);
        }
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        match unsafe { self.device.get_fence_status(vk_fence(fence)) } {
            Ok(true) => Ok(FenceStatus::Signaled),
            Ok(false) => Ok(FenceStatus::Pending),
            Err(e) => Err(self.vk_error("Failed to query fence", e)),
        }
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<FenceStatus> {
        match unsafe { self.device.wait_for_fences(&[vk_fence(fence)], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::Pending),
            Err(e) => Err(self.vk_error("Failed to wait for fence", e)),
        }
    }

    fn submit(
        &self,
        class: QueueClass,
        command_buffer: CommandBufferHandle,
        wait_semaphores: &[SemaphoreWait],
        signal_semaphores: &[SemaphoreHandle],
        fence: FenceHandle,
    ) -> Result<()> {
        let waits: Vec<vk::Semaphore> = wait_semaphores.iter().map(|w| vk_semaphore(w.semaphore)).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = wait_semaphores
            .iter()
            .map(|w| vk::PipelineStageFlags::from_raw(w.stage_mask))
            .collect();
        let signals: Vec<vk::Semaphore> = signal_semaphores.iter().copied().map(vk_semaphore).collect();
        let command_buffers = [self::command_buffer(command_buffer)];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signals);

        let queue = self.queue(class);
        let vk_queue = queue
            .queue
            .lock()
            .map_err(|_| engine_err!(self.log, SOURCE, "{} queue lock poisoned", class))?;
        unsafe { self.device.queue_submit(*vk_queue, &[submit_info], vk_fence(fence)) }
            .map_err(|e| self.vk_error("Failed to submit commands to GPU queue", e))
    }
}

#[cfg(test)]
#[path = "vulkan_submission_device_tests.rs"]
mod tests;
