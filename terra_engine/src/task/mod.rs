/// Task module - completion signals, work items and the worker pool

pub mod signal;
pub mod work_item;
pub mod worker_pool;

pub use signal::*;
pub use work_item::{WorkFn, WorkItem, WorkOutcome, WorkerContext};
pub use worker_pool::*;
