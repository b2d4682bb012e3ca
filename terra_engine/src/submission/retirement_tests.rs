use super::*;
use crate::submission::mock_device::MockSubmissionDevice;
use std::sync::Mutex;

fn record(device: &MockSubmissionDevice, slot: usize) -> RetirementRecord {
    let pool = device.create_command_pool(QueueClass::Graphics).unwrap();
    let command_buffer = device.allocate_command_buffer(pool).unwrap();
    let fence = device.create_fence().unwrap();
    RetirementRecord {
        slot,
        queue_class: QueueClass::Graphics,
        command_pool: pool,
        command_buffer,
        fence,
        finish: None,
        owned: Vec::new(),
        flag: None,
    }
}

// ============================================================================
// GpuFlag
// ============================================================================

#[test]
fn test_flag_starts_clear_and_is_shared() {
    let flag = GpuFlag::new();
    let observer = flag.clone();
    assert!(!observer.is_set());
    flag.set();
    assert!(observer.is_set());
}

// ============================================================================
// RetirementRecord
// ============================================================================

#[test]
fn test_retire_destroys_fence_sets_flag_and_calls_finish() {
    let device = MockSubmissionDevice::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let flag = GpuFlag::new();

    let mut rec = record(&device, 0);
    let sink = received.clone();
    rec.finish = Some(Box::new(move |owned: Vec<OwnedResource>| {
        for resource in owned {
            if let Ok(value) = resource.downcast::<u32>() {
                sink.lock().unwrap().push(*value);
            }
        }
    }));
    rec.owned.push(Box::new(7u32));
    rec.owned.push(Box::new(9u32));
    rec.flag = Some(flag.clone());
    assert_eq!(rec.owned_count(), 2);

    let fences_before = device.live_fences();
    rec.retire(&device);

    assert_eq!(device.live_fences(), fences_before - 1);
    assert!(flag.is_set());
    assert_eq!(*received.lock().unwrap(), vec![7, 9]);
}

#[test]
fn test_retire_without_finish_drops_owned_resources() {
    let device = MockSubmissionDevice::new();
    let tracker = Arc::new(());
    let mut rec = record(&device, 0);
    rec.owned.push(Box::new(tracker.clone()));
    assert_eq!(Arc::strong_count(&tracker), 2);

    rec.retire(&device);
    assert_eq!(Arc::strong_count(&tracker), 1);
}

// ============================================================================
// RetirementQueue
// ============================================================================

#[test]
fn test_take_completed_only_returns_signaled_records() {
    let device = MockSubmissionDevice::new();
    let mut queue = RetirementQueue::new();
    let first = record(&device, 0);
    let second = record(&device, 1);
    let third = record(&device, 2);
    let (f1, f3) = (first.fence, third.fence);
    queue.push(first);
    queue.push(second);
    queue.push(third);

    assert!(queue.take_completed(&device).unwrap().is_empty());
    assert_eq!(queue.len(), 3);

    device.signal_fence(f1);
    device.signal_fence(f3);
    let done = queue.take_completed(&device).unwrap();
    let slots: Vec<usize> = done.iter().map(|r| r.slot).collect();
    assert_eq!(slots, vec![0, 2]);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_take_completed_keeps_pending_order() {
    let device = MockSubmissionDevice::new();
    let mut queue = RetirementQueue::new();
    let records: Vec<RetirementRecord> = (0..4).map(|slot| record(&device, slot)).collect();
    let middle = records[1].fence;
    for rec in records {
        queue.push(rec);
    }

    device.signal_fence(middle);
    queue.take_completed(&device).unwrap();

    let remaining: Vec<usize> = queue.iter().map(|r| r.slot).collect();
    assert_eq!(remaining, vec![0, 2, 3]);
}

#[test]
fn test_take_completed_on_device_loss_keeps_records() {
    let device = MockSubmissionDevice::new();
    let mut queue = RetirementQueue::new();
    queue.push(record(&device, 0));
    device.lose_device();

    assert!(matches!(queue.take_completed(&device), Err(Error::DeviceLost(_))));
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_wait_all_drains_signaled_queue() {
    let device = MockSubmissionDevice::new();
    let mut queue = RetirementQueue::new();
    queue.push(record(&device, 0));
    queue.push(record(&device, 0));
    let fences: Vec<FenceHandle> = queue.iter().map(|r| r.fence).collect();
    for fence in fences {
        device.signal_fence(fence);
    }

    let done = queue.wait_all(&device, 1_000_000_000).unwrap();
    assert_eq!(done.len(), 2);
    assert!(queue.is_empty());
}

#[test]
fn test_wait_all_times_out_as_device_lost() {
    let device = MockSubmissionDevice::new();
    let mut queue = RetirementQueue::new();
    queue.push(record(&device, 0));

    let result = queue.wait_all(&device, 2_000_000);
    assert!(matches!(result, Err(Error::DeviceLost(_))));
    assert_eq!(queue.len(), 1);
}
