//! Integration tests for the Vulkan submission backend
//!
//! These tests record real command buffers through AsyncSubmissionManager and
//! DedicatedCommandWorker and check the results the GPU wrote.
//! All tests require a GPU and are marked with #[ignore].
//!
//! Run with: cargo test --test submission_integration_tests -- --ignored


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use serial_test::serial;
use terra_engine::terra::log::LogHandle;
use terra_engine::terra::submission::{
    stage, AsyncSubmissionManager, DedicatedCommandWorker, GpuFlag, GpuWork, QueueClass,
};
use terra_engine::terra::task::CompletionSignal;
use terra_engine_renderer_vulkan::{command_buffer, semaphore_handle, StagingBuffer};

use gpu_test_utils::{create_test_device, create_test_pool, get_test_context, poll_until, test_config};

const MARKER: u32 = 0xC0FF_EE00;
const BUFFER_SIZE: u64 = 256;

/// Make transfer writes visible to host reads once the fence has signaled
unsafe fn transfer_to_host_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Fill `target` with MARKER
fn fill_work(class: QueueClass, target: vk::Buffer) -> GpuWork {
    let device = get_test_context().device().clone();
    GpuWork::new(class, move |cmd| {
        let cmd = command_buffer(cmd);
        unsafe {
            device.cmd_fill_buffer(cmd, target, 0, vk::WHOLE_SIZE, MARKER);
            transfer_to_host_barrier(&device, cmd);
        }
        Ok(())
    })
}

fn readback_buffer() -> StagingBuffer {
    let ctx = get_test_context();
    StagingBuffer::readback(ctx.device(), &ctx.allocator(), BUFFER_SIZE, vk::BufferUsageFlags::empty()).unwrap()
}

fn assert_filled_with_marker(buffer: &StagingBuffer) {
    let bytes = buffer.read(0, BUFFER_SIZE).unwrap();
    for word in bytes.chunks_exact(4) {
        assert_eq!(u32::from_le_bytes([word[0], word[1], word[2], word[3]]), MARKER);
    }
}

// ============================================================================
// ASYNC SUBMISSION MANAGER
// ============================================================================

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_fill_buffer_on_worker_then_poll() {
    let pool = create_test_pool(2);
    let manager = AsyncSubmissionManager::new(create_test_device(), pool.clone(), &test_config(2), LogHandle::console());
    let readback = readback_buffer();
    let done = GpuFlag::new();

    let submitted = CompletionSignal::new();
    manager
        .submit_gpu_work(fill_work(QueueClass::Transfer, readback.buffer()).with_flag(done.clone()), &submitted)
        .unwrap();
    submitted.wait().unwrap();

    assert!(poll_until(Duration::from_secs(5), || {
        manager.poll_retirements().unwrap();
        done.is_set()
    }));
    assert_eq!(manager.pending_retirements(), 0);
    assert_eq!(manager.staging_arena().live_buffers(), 0);
    assert_filled_with_marker(&readback);

    drop(manager);
    pool.stop();
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_upload_copy_keeps_source_alive_until_retired() {
    let ctx = get_test_context();
    let pool = create_test_pool(2);
    let manager = AsyncSubmissionManager::new(create_test_device(), pool.clone(), &test_config(2), LogHandle::console());

    let mut upload =
        StagingBuffer::upload(ctx.device(), &ctx.allocator(), BUFFER_SIZE, vk::BufferUsageFlags::empty()).unwrap();
    let pattern: Vec<u8> = (0..BUFFER_SIZE).map(|i| i as u8).collect();
    upload.write(0, &pattern).unwrap();
    let readback = readback_buffer();

    let (source, target) = (upload.buffer(), readback.buffer());
    let device = ctx.device().clone();
    let finished_resources = Arc::new(AtomicUsize::new(0));
    let finished = finished_resources.clone();
    let work = GpuWork::new(QueueClass::Transfer, move |cmd| {
        let cmd = command_buffer(cmd);
        let region = vk::BufferCopy::default().size(BUFFER_SIZE);
        unsafe {
            device.cmd_copy_buffer(cmd, source, target, &[region]);
            transfer_to_host_barrier(&device, cmd);
        }
        Ok(())
    })
    .own(upload)
    .on_finish(move |resources| {
        finished.store(resources.len(), Ordering::SeqCst);
    });

    let submitted = CompletionSignal::new();
    manager.submit_gpu_work(work, &submitted).unwrap();
    submitted.wait().unwrap();
    manager.wait_idle().unwrap();

    assert_eq!(finished_resources.load(Ordering::SeqCst), 1);
    assert_eq!(readback.read(0, BUFFER_SIZE).unwrap(), pattern);

    drop(manager);
    pool.stop();
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_submit_on_caller_then_wait_idle() {
    let pool = create_test_pool(1);
    let manager = AsyncSubmissionManager::new(create_test_device(), pool.clone(), &test_config(1), LogHandle::console());
    let readback = readback_buffer();
    let done = GpuFlag::new();

    manager
        .submit_gpu_work_on_caller(fill_work(QueueClass::Graphics, readback.buffer()).with_flag(done.clone()))
        .unwrap();
    assert_eq!(manager.pending_retirements(), 1);

    manager.wait_idle().unwrap();

    assert!(done.is_set());
    assert_eq!(manager.pending_retirements(), 0);
    assert_filled_with_marker(&readback);

    drop(manager);
    pool.stop();
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_semaphore_chain_between_dependent_submissions() {
    let ctx = get_test_context();
    let pool = create_test_pool(2);
    let manager = AsyncSubmissionManager::new(create_test_device(), pool.clone(), &test_config(2), LogHandle::console());

    // Filled by the GPU, so it is a transfer destination too
    let mut upload =
        StagingBuffer::upload(ctx.device(), &ctx.allocator(), BUFFER_SIZE, vk::BufferUsageFlags::TRANSFER_DST).unwrap();
    upload.write(0, &[0u8; BUFFER_SIZE as usize]).unwrap();
    let readback = readback_buffer();
    let semaphore = ctx.create_semaphore().unwrap();

    // First submission fills the upload buffer and signals the semaphore
    let device = ctx.device().clone();
    let source = upload.buffer();
    let fill = GpuWork::new(QueueClass::Graphics, move |cmd| {
        unsafe {
            device.cmd_fill_buffer(command_buffer(cmd), source, 0, vk::WHOLE_SIZE, MARKER);
        }
        Ok(())
    })
    .signal_semaphore(semaphore_handle(semaphore));

    // Second submission waits on it, then copies into the readback buffer
    let device = ctx.device().clone();
    let target = readback.buffer();
    let done = GpuFlag::new();
    let copy = GpuWork::new(QueueClass::Graphics, move |cmd| {
        let cmd = command_buffer(cmd);
        let region = vk::BufferCopy::default().size(BUFFER_SIZE);
        unsafe {
            device.cmd_copy_buffer(cmd, source, target, &[region]);
            transfer_to_host_barrier(&device, cmd);
        }
        Ok(())
    })
    .wait_semaphore(semaphore_handle(semaphore), stage::TRANSFER)
    .own(upload)
    .with_flag(done.clone());

    // The waiting submission must reach the queue after the signaling one
    let fill_submitted = CompletionSignal::new();
    let copy_submitted = CompletionSignal::new();
    manager.submit_gpu_work(fill, &fill_submitted).unwrap();
    copy_submitted.wait_on(&fill_submitted).unwrap();
    manager.submit_gpu_work(copy, &copy_submitted).unwrap();
    copy_submitted.wait().unwrap();

    manager.wait_idle().unwrap();
    assert!(done.is_set());
    assert_filled_with_marker(&readback);

    ctx.destroy_semaphore(semaphore);
    drop(manager);
    pool.stop();
}

// ============================================================================
// DEDICATED COMMAND WORKER
// ============================================================================

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_dedicated_worker_retires_its_own_submissions() {
    let worker =
        DedicatedCommandWorker::spawn("terra-gpu-stream", create_test_device(), &test_config(1), LogHandle::console())
            .unwrap();
    let readback = readback_buffer();
    let done = GpuFlag::new();

    let submitted = CompletionSignal::new();
    worker
        .submit(fill_work(QueueClass::Compute, readback.buffer()).with_flag(done.clone()), &submitted)
        .unwrap();
    submitted.wait().unwrap();

    assert!(poll_until(Duration::from_secs(5), || done.is_set()));
    assert!(poll_until(Duration::from_secs(1), || worker.in_flight() == 0));
    assert_filled_with_marker(&readback);
}
