/// Scheduler configuration

use std::time::Duration;

use crate::log::LogSeverity;

/// Default timeout for blocking fence waits (10 seconds)
///
/// Exceeding it is reported as `Error::DeviceLost`.
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Configuration shared by the worker pool and the GPU submission layer
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = one per available hardware thread)
    pub worker_count: usize,
    /// Name prefix for worker threads (suffixed with the worker index)
    pub thread_name: String,
    /// Timeout used by blocking fence waits, in nanoseconds
    pub fence_timeout_ns: u64,
    /// How long a dedicated command worker sleeps between fence polls
    /// while it still has submissions in flight
    pub dedicated_poll_interval: Duration,
    /// Minimum severity forwarded by the log handle created at the composition root
    pub min_log_severity: LogSeverity,
}

impl SchedulerConfig {
    /// Worker count with `0` resolved against the machine's parallelism
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            thread_name: "terra-worker".to_string(),
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            dedicated_poll_interval: Duration::from_millis(1),
            min_log_severity: if cfg!(debug_assertions) {
                LogSeverity::Debug
            } else {
                LogSeverity::Info
            },
        }
    }
}
