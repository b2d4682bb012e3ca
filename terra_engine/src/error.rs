//! Error types for the Terra engine
//!
//! This module defines the error types used throughout the engine,
//! including task scheduling, GPU submission and device failures.

use std::fmt;

/// Result type for Terra engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Terra engine errors
#[derive(Debug, Clone)]
pub enum Error {
    /// Backend-specific error (Vulkan API call returned a failure code, etc.)
    BackendError(String),

    /// Out of GPU or host memory
    OutOfMemory,

    /// Invalid resource or invalid use of an object (bad handle, cyclic dependency, ...)
    InvalidResource(String),

    /// Initialization failed (engine, worker pool, device, subsystems)
    InitializationFailed(String),

    /// A work closure returned an error or panicked
    WorkFailed(String),

    /// Work was skipped because one of the signals it waited on failed
    DependencyFailed(String),

    /// Work was dropped because the pool that held it has stopped
    PoolStopped,

    /// The device stopped responding (fence timeout or VK_ERROR_DEVICE_LOST)
    DeviceLost(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::WorkFailed(msg) => write!(f, "Work failed: {}", msg),
            Error::DependencyFailed(msg) => write!(f, "Dependency failed: {}", msg),
            Error::PoolStopped => write!(f, "Worker pool stopped"),
            Error::DeviceLost(msg) => write!(f, "Device lost: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
