/*!
# Terra Engine

Concurrent task scheduling and asynchronous GPU command submission for the
Terra terrain renderer.

This crate is platform-agnostic: it talks to the GPU only through the
`SubmissionDevice` trait. Backend implementations (Vulkan) live in their own
crates.

## Architecture

- **CompletionSignal**: countdown latch with predicate gating, used to order work
- **WorkItem**: a closure bound to a signal, signaled exactly once
- **WorkerPool**: fixed set of threads running work in dependency order
- **AsyncSubmissionManager**: records command buffers on the pool, retires them when their fence signals
- **DedicatedCommandWorker**: single thread with private command pools for long-lived streams
- **Engine**: composition root holding the shared pool and the global logger
*/

// Internal modules
mod config;
mod engine;
mod error;
pub mod log;
pub mod submission;
pub mod task;

#[cfg(test)]
mod test_support;

// Main terra namespace module
pub mod terra {
    // Error types
    pub use crate::error::{Error, Result};

    // Composition root and configuration
    pub use crate::config::{SchedulerConfig, DEFAULT_FENCE_TIMEOUT_NS};
    pub use crate::engine::Engine;

    // Logging sub-module (types only; the engine_* macros are exported at the crate root)
    pub mod log {
        pub use crate::log::{DefaultLogger, LogEntry, LogHandle, LogSeverity, Logger, NullLogger};
    }

    // Scheduling sub-module
    pub mod task {
        pub use crate::task::*;
    }

    // GPU submission sub-module
    pub mod submission {
        pub use crate::submission::*;
    }
}
