/// HeadlessContext - Vulkan instance and device without a surface
///
/// Contains everything the submission layer needs to run on a real GPU
/// without a window:
/// - Instance and logical device
/// - One queue per queue class (dedicated transfer / compute families when
///   the GPU has them)
/// - GPU memory allocator for staging buffers

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use rustc_hash::FxHashMap;
use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use terra_engine::terra::log::LogHandle;
use terra_engine::terra::submission::QueueClass;
use terra_engine::terra::{Error, Result};
use terra_engine::{engine_err, engine_error, engine_info};

use crate::vulkan_submission_device::{VulkanQueue, VulkanSubmissionDevice};

const SOURCE: &str = "terra::vulkan";

/// Queue family picked for each class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    /// Family with TRANSFER but neither GRAPHICS nor COMPUTE
    pub transfer: Option<u32>,
    /// Family with COMPUTE but not GRAPHICS
    pub compute: Option<u32>,
}

impl QueueFamilies {
    /// Pick families from the properties reported by a physical device
    pub fn select(families: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |wanted: vk::QueueFlags, excluded: vk::QueueFlags| {
            families
                .iter()
                .position(|qf| {
                    qf.queue_count > 0 && qf.queue_flags.contains(wanted) && !qf.queue_flags.intersects(excluded)
                })
                .map(|i| i as u32)
        };

        let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
        Some(Self {
            graphics,
            transfer: find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            compute: find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS),
        })
    }

    /// Family per available class
    pub fn by_class(&self) -> Vec<(QueueClass, u32)> {
        let mut classes = vec![(QueueClass::Graphics, self.graphics)];
        if let Some(family) = self.transfer {
            classes.push((QueueClass::Transfer, family));
        }
        if let Some(family) = self.compute {
            classes.push((QueueClass::Compute, family));
        }
        classes
    }
}

/// Vulkan instance + device for tools and GPU tests
///
/// Owns the instance, the device and the allocator; destroys them on drop.
/// Every `VulkanSubmissionDevice` and `StagingBuffer` created from it must be
/// dropped first.
pub struct HeadlessContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    /// Wrapped in ManuallyDrop to ensure it's dropped BEFORE the device is destroyed
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    log: LogHandle,
}

impl HeadlessContext {
    /// Create an instance and a device on the first GPU with a graphics queue
    pub fn new(app_name: &str, log: LogHandle) -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| {
                engine_error!(log, SOURCE, "Failed to load Vulkan library: {:?}", e);
                Error::InitializationFailed(format!("Failed to load Vulkan library: {:?}", e))
            })?;

            let app_name = CString::new(app_name)
                .map_err(|e| Error::InitializationFailed(format!("Invalid application name: {}", e)))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"Terra")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let layer_names = if cfg!(feature = "vulkan-validation") {
                vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
            } else {
                vec![]
            };

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names);

            let instance = entry.create_instance(&create_info, None).map_err(|e| {
                engine_error!(log, SOURCE, "Failed to create Vulkan instance: {:?}", e);
                Error::InitializationFailed(format!("Failed to create instance: {:?}", e))
            })?;

            match Self::create_device(&instance, &log) {
                Ok((physical_device, device, families)) => {
                    let allocator = Allocator::new(&AllocatorCreateDesc {
                        instance: instance.clone(),
                        device: device.clone(),
                        physical_device,
                        debug_settings: Default::default(),
                        buffer_device_address: false,
                        allocation_sizes: Default::default(),
                    });
                    let allocator = match allocator {
                        Ok(allocator) => allocator,
                        Err(e) => {
                            engine_error!(log, SOURCE, "Failed to create GPU allocator: {:?}", e);
                            device.destroy_device(None);
                            instance.destroy_instance(None);
                            return Err(Error::InitializationFailed(format!("Failed to create allocator: {:?}", e)));
                        }
                    };

                    engine_info!(
                        log,
                        SOURCE,
                        "Headless context ready (graphics family {}, transfer {:?}, compute {:?})",
                        families.graphics,
                        families.transfer,
                        families.compute
                    );

                    Ok(Self {
                        _entry: entry,
                        instance,
                        physical_device,
                        device,
                        families,
                        allocator: ManuallyDrop::new(Arc::new(Mutex::new(allocator))),
                        log,
                    })
                }
                Err(error) => {
                    instance.destroy_instance(None);
                    Err(error)
                }
            }
        }
    }

    unsafe fn create_device(
        instance: &ash::Instance,
        log: &LogHandle,
    ) -> Result<(vk::PhysicalDevice, ash::Device, QueueFamilies)> {
        unsafe {
            let physical_devices = instance.enumerate_physical_devices().map_err(|e| {
                engine_error!(log, SOURCE, "Failed to enumerate physical devices: {:?}", e);
                Error::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
            })?;

            let (physical_device, families) = physical_devices
                .into_iter()
                .find_map(|pd| {
                    let properties = instance.get_physical_device_queue_family_properties(pd);
                    QueueFamilies::select(&properties).map(|families| (pd, families))
                })
                .ok_or_else(|| {
                    engine_error!(log, SOURCE, "No Vulkan-capable GPU with a graphics queue found");
                    Error::InitializationFailed("No Vulkan-capable GPU found".to_string())
                })?;

            let queue_priorities = [1.0];
            let mut unique_families: Vec<u32> = families.by_class().into_iter().map(|(_, f)| f).collect();
            unique_families.sort_unstable();
            unique_families.dedup();
            let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
                .iter()
                .map(|&family| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&queue_priorities)
                })
                .collect();

            let device_create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

            let device = instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| {
                    engine_error!(log, SOURCE, "Failed to create logical device: {:?}", e);
                    Error::InitializationFailed(format!("Failed to create device: {:?}", e))
                })?;

            Ok((physical_device, device, families))
        }
    }

    /// Build a submission device over this context's queues
    pub fn submission_device(&self) -> Result<VulkanSubmissionDevice> {
        let mut queues = FxHashMap::default();
        for (class, family) in self.families.by_class() {
            let queue = unsafe { self.device.get_device_queue(family, 0) };
            queues.insert(class, VulkanQueue::new(queue, family));
        }
        VulkanSubmissionDevice::new(self.device.clone(), queues, self.log.clone())
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    /// Shared GPU memory allocator
    pub fn allocator(&self) -> Arc<Mutex<Allocator>> {
        Arc::clone(&self.allocator)
    }

    /// Binary semaphore for chaining submissions
    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&create_info, None) }
            .map_err(|e| engine_err!(self.log, SOURCE, "Failed to create semaphore: {:?}", e))
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.destroy_semaphore(semaphore, None);
        }
    }
}

impl Drop for HeadlessContext {
    fn drop(&mut self) {
        unsafe {
            // Wait for device to finish
            self.device.device_wait_idle().ok();

            // Free VkDeviceMemory pages BEFORE destroying the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
#[path = "vulkan_context_tests.rs"]
mod tests;
