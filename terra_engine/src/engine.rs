/// Terra Engine - composition root
///
/// Owns the process-wide pieces: the shared worker pool, the configuration it
/// was built with and the logger. Everything below this level receives its
/// `LogHandle` and collaborators explicitly; this is the only module with
/// global state.

use std::sync::{Arc, OnceLock, RwLock};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::log::{DefaultLogger, LogHandle, Logger};
use crate::submission::async_submission::AsyncSubmissionManager;
use crate::submission::dedicated_worker::DedicatedCommandWorker;
use crate::submission::device::SubmissionDevice;
use crate::task::worker_pool::WorkerPool;

const SOURCE: &str = "terra::Engine";

// ===== INTERNAL STATE =====

/// Global engine state storage
static ENGINE_STATE: OnceLock<EngineState> = OnceLock::new();

/// Global logger (initialized with DefaultLogger)
static LOGGER: OnceLock<RwLock<Arc<dyn Logger>>> = OnceLock::new();

struct EngineRuntime {
    config: SchedulerConfig,
    worker_pool: Arc<WorkerPool>,
}

struct EngineState {
    runtime: RwLock<Option<EngineRuntime>>,
}

fn state() -> &'static EngineState {
    ENGINE_STATE.get_or_init(|| EngineState {
        runtime: RwLock::new(None),
    })
}

fn logger() -> &'static RwLock<Arc<dyn Logger>> {
    LOGGER.get_or_init(|| RwLock::new(Arc::new(DefaultLogger)))
}

// ===== PUBLIC API =====

/// Process-wide entry point
///
/// # Example
///
/// ```no_run
/// use terra_engine::terra::{Engine, SchedulerConfig};
/// use terra_engine::terra::task::CompletionSignal;
///
/// Engine::initialize(SchedulerConfig::default())?;
///
/// let pool = Engine::worker_pool()?;
/// let done = CompletionSignal::new();
/// pool.submit(|_| Ok(()), &done)?;
/// done.wait()?;
///
/// Engine::shutdown();
/// # Ok::<(), terra_engine::terra::Error>(())
/// ```
pub struct Engine;

impl Engine {
    /// Helper to log errors before returning them (internal use)
    fn log_and_return_error(error: Error) -> Error {
        let log = Self::log_handle();
        match &error {
            Error::InitializationFailed(msg) => {
                crate::engine_error!(log, SOURCE, "Initialization failed: {}", msg);
            }
            _ => {
                crate::engine_error!(log, SOURCE, "Engine error: {}", error);
            }
        }
        error
    }

    /// Start the shared worker pool
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` if the engine is already running or the
    /// worker threads cannot be spawned.
    pub fn initialize(config: SchedulerConfig) -> Result<()> {
        let mut runtime = state()
            .runtime
            .write()
            .map_err(|_| Self::log_and_return_error(Error::BackendError("Engine lock poisoned".to_string())))?;

        if runtime.is_some() {
            return Err(Self::log_and_return_error(Error::InitializationFailed(
                "Engine already initialized. Call Engine::shutdown() first.".to_string(),
            )));
        }

        let log = Self::log_handle().with_min_severity(config.min_log_severity);
        let worker_pool = Arc::new(WorkerPool::new(&config, log.clone())?);
        crate::engine_info!(
            log,
            SOURCE,
            "Engine initialized with {} workers",
            worker_pool.worker_count()
        );
        *runtime = Some(EngineRuntime { config, worker_pool });
        Ok(())
    }

    /// Stop the worker pool and clear the global state
    ///
    /// Work still queued is released with `Error::PoolStopped`. Managers that
    /// hold a clone of the pool keep it alive until they are dropped.
    pub fn shutdown() {
        let runtime = match state().runtime.write() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            runtime.worker_pool.stop();
            crate::engine_info!(Self::log_handle(), SOURCE, "Engine shut down");
        }
    }

    /// Whether `initialize` has been called (and not undone by `shutdown`)
    pub fn is_initialized() -> bool {
        state()
            .runtime
            .read()
            .map(|runtime| runtime.is_some())
            .unwrap_or(false)
    }

    /// The shared worker pool
    ///
    /// # Errors
    ///
    /// `Error::InitializationFailed` if the engine is not initialized.
    pub fn worker_pool() -> Result<Arc<WorkerPool>> {
        Self::with_runtime(|runtime| runtime.worker_pool.clone())
    }

    /// Configuration passed to `initialize`
    pub fn config() -> Result<SchedulerConfig> {
        Self::with_runtime(|runtime| runtime.config.clone())
    }

    /// Build a submission manager on top of the shared worker pool
    pub fn create_submission_manager(device: Arc<dyn SubmissionDevice>) -> Result<AsyncSubmissionManager> {
        let (config, pool) = Self::with_runtime(|runtime| (runtime.config.clone(), runtime.worker_pool.clone()))?;
        let log = Self::log_handle().with_min_severity(config.min_log_severity);
        Ok(AsyncSubmissionManager::new(device, pool, &config, log))
    }

    /// Spawn a dedicated command worker using the engine configuration
    pub fn create_dedicated_worker(name: &str, device: Arc<dyn SubmissionDevice>) -> Result<DedicatedCommandWorker> {
        let config = Self::config()?;
        let log = Self::log_handle().with_min_severity(config.min_log_severity);
        DedicatedCommandWorker::spawn(name, device, &config, log)
    }

    fn with_runtime<T>(f: impl FnOnce(&EngineRuntime) -> T) -> Result<T> {
        let lock = state()
            .runtime
            .read()
            .map_err(|_| Self::log_and_return_error(Error::BackendError("Engine lock poisoned".to_string())))?;
        lock.as_ref().map(f).ok_or_else(|| {
            Self::log_and_return_error(Error::InitializationFailed(
                "Engine not initialized. Call Engine::initialize() first.".to_string(),
            ))
        })
    }

    // ===== LOGGING API =====

    /// Set a custom logger
    ///
    /// Handles obtained before the call keep the previous logger.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use terra_engine::terra::{Engine, log::{Logger, LogEntry}};
    ///
    /// struct FileLogger;
    /// impl Logger for FileLogger {
    ///     fn log(&self, entry: &LogEntry) {
    ///         // Write to file...
    ///     }
    /// }
    ///
    /// Engine::set_logger(FileLogger);
    /// ```
    pub fn set_logger<L: Logger + 'static>(logger: L) {
        if let Ok(mut lock) = self::logger().write() {
            *lock = Arc::new(logger);
        }
    }

    /// Reset logger to default (DefaultLogger)
    pub fn reset_logger() {
        if let Ok(mut lock) = self::logger().write() {
            *lock = Arc::new(DefaultLogger);
        }
    }

    /// Handle to the current global logger
    pub fn log_handle() -> LogHandle {
        match self::logger().read() {
            Ok(lock) => LogHandle::from_arc(lock.clone()),
            Err(_) => LogHandle::console(),
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
