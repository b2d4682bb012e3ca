/// SubmissionDevice trait - the command pool / fence / queue primitives the
/// submission layer needs from a graphics backend

use std::fmt;

use bitflags::bitflags;

use crate::error::Result;

// ============================================================================
// Queue classes
// ============================================================================

/// Queue family category with its own command pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Graphics,
    Transfer,
    Compute,
}

impl QueueClass {
    /// All classes, in pool-slot order
    pub const ALL: [QueueClass; 3] = [QueueClass::Graphics, QueueClass::Transfer, QueueClass::Compute];

    /// Stable index used to address per-class storage
    pub fn index(self) -> usize {
        match self {
            QueueClass::Graphics => 0,
            QueueClass::Transfer => 1,
            QueueClass::Compute => 2,
        }
    }

    /// Flag bit for this class
    pub fn flag(self) -> QueueClassFlags {
        match self {
            QueueClass::Graphics => QueueClassFlags::GRAPHICS,
            QueueClass::Transfer => QueueClassFlags::TRANSFER,
            QueueClass::Compute => QueueClassFlags::COMPUTE,
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueClass::Graphics => write!(f, "graphics"),
            QueueClass::Transfer => write!(f, "transfer"),
            QueueClass::Compute => write!(f, "compute"),
        }
    }
}

bitflags! {
    /// Set of queue classes a device exposes dedicated queues for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueClassFlags: u32 {
        const GRAPHICS = 1 << 0;
        const TRANSFER = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// Map a requested class onto one the device supports
///
/// Graphics queues can execute transfer and compute work, so a class without a
/// dedicated queue falls back to graphics.
pub fn resolve_class(supported: QueueClassFlags, requested: QueueClass) -> QueueClass {
    if supported.contains(requested.flag()) {
        requested
    } else {
        QueueClass::Graphics
    }
}

// ============================================================================
// Handles
// ============================================================================

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw backend handle
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw backend handle
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }
    };
}

raw_handle!(
    /// Opaque command pool handle (externally synchronized)
    CommandPoolHandle
);
raw_handle!(
    /// Opaque primary command buffer handle
    CommandBufferHandle
);
raw_handle!(
    /// Opaque fence handle
    FenceHandle
);
raw_handle!(
    /// Opaque semaphore handle, owned by the caller
    SemaphoreHandle
);

/// Pipeline stage mask bits for semaphore waits (same values as Vulkan)
pub mod stage {
    pub const TOP_OF_PIPE: u32 = 0x0000_0001;
    pub const VERTEX_INPUT: u32 = 0x0000_0004;
    pub const FRAGMENT_SHADER: u32 = 0x0000_0080;
    pub const COLOR_ATTACHMENT_OUTPUT: u32 = 0x0000_0400;
    pub const COMPUTE_SHADER: u32 = 0x0000_0800;
    pub const TRANSFER: u32 = 0x0000_1000;
    pub const ALL_COMMANDS: u32 = 0x0001_0000;
}

/// A semaphore the submission waits on, and the stages that wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreHandle,
    pub stage_mask: u32,
}

/// Non-blocking fence query result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Pending,
}

// ============================================================================
// Device trait
// ============================================================================

/// Primitives consumed by the submission layer
///
/// Command pools (and buffers allocated from them) are externally
/// synchronized: callers never use one pool from two threads at once.
/// Queue access is synchronized by the implementation.
pub trait SubmissionDevice: Send + Sync {
    /// Queue classes with a dedicated queue
    fn supported_classes(&self) -> QueueClassFlags;

    /// Create a command pool for one-time-submit buffers of `class`
    fn create_command_pool(&self, class: QueueClass) -> Result<CommandPoolHandle>;

    /// Destroy a pool and every buffer still allocated from it
    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> Result<CommandBufferHandle>;

    /// Return a command buffer to its pool
    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle);

    /// Begin recording with one-time-submit usage
    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;

    /// Finish recording
    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;

    /// Create an unsignaled fence
    fn create_fence(&self) -> Result<FenceHandle>;

    /// Destroy a fence that is not in use by a pending submission
    fn destroy_fence(&self, fence: FenceHandle);

    /// Query a fence without blocking
    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus>;

    /// Block until the fence signals or `timeout_ns` elapses
    ///
    /// Returns `FenceStatus::Pending` on timeout.
    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<FenceStatus>;

    /// Submit one command buffer to the queue of `class`
    fn submit(
        &self,
        class: QueueClass,
        command_buffer: CommandBufferHandle,
        wait_semaphores: &[SemaphoreWait],
        signal_semaphores: &[SemaphoreHandle],
        fence: FenceHandle,
    ) -> Result<()>;
}
