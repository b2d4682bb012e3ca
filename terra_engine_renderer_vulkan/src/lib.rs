/*!
# Terra Engine - Vulkan Submission Backend

Vulkan implementation of the terra_engine `SubmissionDevice` trait.

This crate uses the Ash library for Vulkan bindings and gpu-allocator for
staging memory. `HeadlessContext` brings up an instance and a device without a
window, for tools and GPU tests.

```no_run
use std::sync::Arc;
use terra_engine::terra::{Engine, SchedulerConfig};
use terra_engine_renderer_vulkan::HeadlessContext;

Engine::initialize(SchedulerConfig::default())?;
let context = HeadlessContext::new("terra-tool", Engine::log_handle())?;
let device = Arc::new(context.submission_device()?);
let manager = Engine::create_submission_manager(device)?;
# Ok::<(), terra_engine::terra::Error>(())
```
*/

mod vulkan_context;
mod vulkan_staging_buffer;
mod vulkan_submission_device;

pub use vulkan_context::{HeadlessContext, QueueFamilies};
pub use vulkan_staging_buffer::StagingBuffer;
pub use vulkan_submission_device::{command_buffer, semaphore_handle, VulkanQueue, VulkanSubmissionDevice};
