/// GPU command submission: device abstraction, per-thread command pools,
/// asynchronous recording and fence-based retirement

pub mod async_submission;
pub mod command_staging;
pub mod dedicated_worker;
pub mod device;
pub mod gpu_work;
pub mod retirement;

#[cfg(test)]
pub mod mock_device;

pub use async_submission::AsyncSubmissionManager;
pub use command_staging::{CommandStagingPool, StagingArena};
pub use dedicated_worker::DedicatedCommandWorker;
pub use device::*;
pub use gpu_work::{record_and_submit, GpuWork, RecordFn};
pub use retirement::{FinishCallback, GpuFlag, OwnedResource, RetirementQueue, RetirementRecord};
