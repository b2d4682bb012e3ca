/// Mock SubmissionDevice for unit tests (no GPU required)
///
/// Hands out fake handles, tracks which objects are alive and lets tests
/// decide when fences signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::submission::device::{
    CommandBufferHandle, CommandPoolHandle, FenceHandle, FenceStatus, QueueClass,
    QueueClassFlags, SemaphoreHandle, SemaphoreWait, SubmissionDevice,
};

#[derive(Debug)]
pub struct MockCommandBuffer {
    pub pool: u64,
    pub recording: bool,
    pub allocated_on: ThreadId,
}

#[derive(Debug, Clone)]
pub struct MockSubmission {
    pub class: QueueClass,
    pub command_buffer: CommandBufferHandle,
    pub fence: FenceHandle,
    pub wait_semaphores: Vec<SemaphoreWait>,
    pub signal_semaphores: Vec<SemaphoreHandle>,
}

#[derive(Default)]
struct MockState {
    pools: FxHashMap<u64, QueueClass>,
    command_buffers: FxHashMap<u64, MockCommandBuffer>,
    fences: FxHashMap<u64, bool>,
    submissions: Vec<MockSubmission>,
    cross_thread_recordings: usize,
    fail_next_submit: bool,
    lose_device: bool,
}

pub struct MockSubmissionDevice {
    state: Mutex<MockState>,
    next_handle: AtomicU64,
    supported: QueueClassFlags,
    auto_signal: bool,
}

impl MockSubmissionDevice {
    /// Device with graphics, transfer and compute queues; fences signal only
    /// when the test says so
    pub fn new() -> Self {
        Self::with_classes(QueueClassFlags::all())
    }

    pub fn with_classes(supported: QueueClassFlags) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_handle: AtomicU64::new(1),
            supported,
            auto_signal: false,
        }
    }

    /// Device whose fences signal as soon as they are submitted
    pub fn auto_signaling() -> Self {
        Self {
            auto_signal: true,
            ..Self::new()
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ===== Test controls =====

    pub fn signal_fence(&self, fence: FenceHandle) {
        if let Some(signaled) = self.state.lock().unwrap().fences.get_mut(&fence.as_raw()) {
            *signaled = true;
        }
    }

    /// Signal every fence that has been submitted
    pub fn signal_all_fences(&self) {
        let mut state = self.state.lock().unwrap();
        let submitted: Vec<u64> = state.submissions.iter().map(|s| s.fence.as_raw()).collect();
        for fence in submitted {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().unwrap().fail_next_submit = true;
    }

    /// Make every fence query report device loss
    pub fn lose_device(&self) {
        self.state.lock().unwrap().lose_device = true;
    }

    // ===== Inspection =====

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn live_pools(&self) -> usize {
        self.state.lock().unwrap().pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().unwrap().command_buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().unwrap().fences.len()
    }

    pub fn pool_class(&self, pool: CommandPoolHandle) -> Option<QueueClass> {
        self.state.lock().unwrap().pools.get(&pool.as_raw()).copied()
    }

    /// Buffers that were begun on a different thread than the one that allocated them
    pub fn cross_thread_recordings(&self) -> usize {
        self.state.lock().unwrap().cross_thread_recordings
    }
}

impl SubmissionDevice for MockSubmissionDevice {
    fn supported_classes(&self) -> QueueClassFlags {
        self.supported
    }

    fn create_command_pool(&self, class: QueueClass) -> Result<CommandPoolHandle> {
        let raw = self.handle();
        self.state.lock().unwrap().pools.insert(raw, class);
        Ok(CommandPoolHandle::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock().unwrap();
        state.pools.remove(&pool.as_raw());
        state.command_buffers.retain(|_, buffer| buffer.pool != pool.as_raw());
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> Result<CommandBufferHandle> {
        let raw = self.handle();
        let mut state = self.state.lock().unwrap();
        if !state.pools.contains_key(&pool.as_raw()) {
            return Err(Error::InvalidResource(format!("unknown command pool {:?}", pool)));
        }
        state.command_buffers.insert(
            raw,
            MockCommandBuffer {
                pool: pool.as_raw(),
                recording: false,
                allocated_on: thread::current().id(),
            },
        );
        Ok(CommandBufferHandle::from_raw(raw))
    }

    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(buffer) = state.command_buffers.get(&command_buffer.as_raw()) {
            assert_eq!(buffer.pool, pool.as_raw(), "command buffer freed into the wrong pool");
        }
        state.command_buffers.remove(&command_buffer.as_raw());
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = thread::current().id();
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or_else(|| Error::InvalidResource("unknown command buffer".to_string()))?;
        buffer.recording = true;
        let cross_thread = buffer.allocated_on != current;
        if cross_thread {
            state.cross_thread_recordings += 1;
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or_else(|| Error::InvalidResource("unknown command buffer".to_string()))?;
        if !buffer.recording {
            return Err(Error::BackendError("command buffer not recording".to_string()));
        }
        buffer.recording = false;
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let raw = self.handle();
        self.state.lock().unwrap().fences.insert(raw, false);
        Ok(FenceHandle::from_raw(raw))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().unwrap().fences.remove(&fence.as_raw());
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        let state = self.state.lock().unwrap();
        if state.lose_device {
            return Err(Error::DeviceLost("mock device lost".to_string()));
        }
        match state.fences.get(&fence.as_raw()) {
            Some(true) => Ok(FenceStatus::Signaled),
            Some(false) => Ok(FenceStatus::Pending),
            None => Err(Error::InvalidResource(format!("unknown fence {:?}", fence))),
        }
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<FenceStatus> {
        let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
        loop {
            if self.fence_status(fence)? == FenceStatus::Signaled {
                return Ok(FenceStatus::Signaled);
            }
            if Instant::now() >= deadline {
                return Ok(FenceStatus::Pending);
            }
            thread::sleep(Duration::from_micros(200));
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
        let mut state = self.state.lock().unwrap();
        if state.fail_next_submit {
            state.fail_next_submit = false;
            return Err(Error::BackendError("mock submit failure".to_string()));
        }
        if let Some(buffer) = state.command_buffers.get(&command_buffer.as_raw()) {
            assert!(!buffer.recording, "submitted a command buffer that is still recording");
        }
        state.submissions.push(MockSubmission {
            class,
            command_buffer,
            fence,
            wait_semaphores: wait_semaphores.to_vec(),
            signal_semaphores: signal_semaphores.to_vec(),
        });
        if self.auto_signal {
            if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
                *signaled = true;
            }
        }
        Ok(())
    }
}
