/// StagingBuffer - host-visible Vulkan buffer for uploads and readbacks

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use std::sync::{Arc, Mutex};

use terra_engine::terra::{Error, Result};

/// Host-visible buffer backed by a gpu-allocator allocation
///
/// Typically handed to `GpuWork::own` so it stays alive until the fence of
/// the command buffer reading or writing it has signaled.
pub struct StagingBuffer {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    buffer: vk::Buffer,
    /// GPU memory allocation (taken on drop)
    allocation: Option<Allocation>,
    size: u64,
}

impl StagingBuffer {
    /// Create a buffer for CPU writes read by the GPU
    pub fn upload(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, allocator, size, usage | vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu)
    }

    /// Create a buffer for GPU writes read back by the CPU
    pub fn readback(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, allocator, size, usage | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu)
    }

    fn new(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidResource("Staging buffer size must be non-zero".to_string()));
        }

        unsafe {
            let buffer_create_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = device
                .create_buffer(&buffer_create_info, None)
                .map_err(|e| Error::BackendError(format!("Failed to create staging buffer: {:?}", e)))?;

            let requirements = device.get_buffer_memory_requirements(buffer);

            let allocation = match allocator.lock() {
                Ok(mut allocator) => allocator
                    .allocate(&AllocationCreateDesc {
                        name: "staging_buffer",
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|_e| Error::OutOfMemory),
                Err(_) => Err(Error::BackendError("Allocator lock poisoned".to_string())),
            };
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(error) => {
                    device.destroy_buffer(buffer, None);
                    return Err(error);
                }
            };

            // From here on, Drop releases both the buffer and the allocation
            let staging = Self {
                device: device.clone(),
                allocator: Arc::clone(allocator),
                buffer,
                allocation: Some(allocation),
                size,
            };

            if let Some(allocation) = &staging.allocation {
                device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                    .map_err(|e| Error::BackendError(format!("Failed to bind buffer memory: {:?}", e)))?;
            }

            Ok(staging)
        }
    }

    /// Copy `data` into the buffer at `offset`
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.checked_range(offset, data.len() as u64)?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| Error::BackendError("Staging buffer is not CPU-accessible".to_string()))?;
        mapped[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the buffer starting at `offset`
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = self.checked_range(offset, len)?;
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .ok_or_else(|| Error::BackendError("Staging buffer is not CPU-accessible".to_string()))?;
        Ok(mapped[range].to_vec())
    }

    fn checked_range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset as usize..end as usize),
            _ => Err(Error::InvalidResource(format!(
                "Range {}+{} out of bounds for staging buffer of {} bytes",
                offset, len, self.size
            ))),
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            // Free GPU memory
            if let Some(allocation) = self.allocation.take() {
                // Don't panic if lock fails - we still need to destroy the buffer
                if let Ok(mut allocator) = self.allocator.lock() {
                    allocator.free(allocation).ok();
                }
            }

            self.device.destroy_buffer(self.buffer, None);
        }
    }
}
