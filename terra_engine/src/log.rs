//! Logging system for Terra Engine
//!
//! This module provides a flexible logging system with:
//! - Customizable logger via Logger trait
//! - Severity levels (Trace, Debug, Info, Warn, Error)
//! - Colored console output by default
//! - An explicit `LogHandle` passed to every subsystem constructor
//! - File and line information for detailed ERROR logs

use colored::*;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use chrono::{DateTime, Local};

/// Logger trait for custom logging implementations
///
/// Implement this trait to create custom loggers (file logging, network logging, etc.)
///
/// # Example
///
/// ```no_run
/// use terra_engine::terra::log::{Logger, LogEntry};
///
/// struct FileLogger {
///     file: std::fs::File,
/// }
///
/// impl Logger for FileLogger {
///     fn log(&self, entry: &LogEntry) {
///         // Write to file...
///     }
/// }
/// ```
pub trait Logger: Send + Sync {
    /// Log an entry
    ///
    /// # Arguments
    ///
    /// * `entry` - The log entry to process
    fn log(&self, entry: &LogEntry);
}

/// Log entry containing all information about a log message
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity level (Trace, Debug, Info, Warn, Error)
    pub severity: LogSeverity,

    /// Timestamp when the log was created
    pub timestamp: SystemTime,

    /// Source module (e.g., "terra::WorkerPool", "terra::vulkan")
    pub source: String,

    /// Log message
    pub message: String,

    /// Source file (only for detailed ERROR logs)
    pub file: Option<&'static str>,

    /// Source line (only for detailed ERROR logs)
    pub line: Option<u32>,
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    /// Very verbose debug information (typically disabled in release)
    Trace,

    /// Development/debugging information
    Debug,

    /// Important informational messages
    Info,

    /// Warning messages (potential issues)
    Warn,

    /// Error messages (critical issues with file:line details)
    Error,
}

/// Default logger implementation using colored console output
///
/// Format:
/// - Normal: `[timestamp] [SEVERITY] [source] message`
/// - Error: `[timestamp] [ERROR] [source] message (file:line)`
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn log(&self, entry: &LogEntry) {
        // Format timestamp as YYYY-MM-DD HH:MM:SS.mmm
        let datetime: DateTime<Local> = entry.timestamp.into();
        let timestamp = datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let severity_str = match entry.severity {
            LogSeverity::Trace => "TRACE".bright_black(),
            LogSeverity::Debug => "DEBUG".cyan(),
            LogSeverity::Info => "INFO ".green(),
            LogSeverity::Warn => "WARN ".yellow(),
            LogSeverity::Error => "ERROR".red().bold(),
        };

        let source = entry.source.bright_blue();

        if let (Some(file), Some(line)) = (entry.file, entry.line) {
            eprintln!(
                "[{}] [{}] [{}] {} ({}:{})",
                timestamp,
                severity_str,
                source,
                entry.message,
                file,
                line
            );
        } else {
            eprintln!(
                "[{}] [{}] [{}] {}",
                timestamp,
                severity_str,
                source,
                entry.message
            );
        }
    }
}

/// Logger that discards everything
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _entry: &LogEntry) {}
}

// ===== LOG HANDLE =====

/// Cloneable handle to a logger, threaded through subsystem constructors
///
/// Entries below `min_severity` are dropped before the message is formatted
/// (the `engine_*!` macros check `enabled()` first).
#[derive(Clone)]
pub struct LogHandle {
    logger: Arc<dyn Logger>,
    min_severity: LogSeverity,
}

impl LogHandle {
    /// Wrap a logger, accepting every severity
    pub fn new<L: Logger + 'static>(logger: L) -> Self {
        Self::from_arc(Arc::new(logger))
    }

    /// Wrap an already shared logger
    pub fn from_arc(logger: Arc<dyn Logger>) -> Self {
        Self {
            logger,
            min_severity: LogSeverity::Trace,
        }
    }

    /// Colored console logger
    pub fn console() -> Self {
        Self::new(DefaultLogger)
    }

    /// Handle that drops every entry
    pub fn silent() -> Self {
        Self::new(NullLogger)
    }

    /// Same logger, different severity threshold
    pub fn with_min_severity(mut self, min_severity: LogSeverity) -> Self {
        self.min_severity = min_severity;
        self
    }

    /// Current severity threshold
    pub fn min_severity(&self) -> LogSeverity {
        self.min_severity
    }

    /// Whether entries of this severity reach the logger
    pub fn enabled(&self, severity: LogSeverity) -> bool {
        severity >= self.min_severity
    }

    /// Log a message without file:line information
    pub fn log(&self, severity: LogSeverity, source: &str, message: String) {
        if !self.enabled(severity) {
            return;
        }
        self.logger.log(&LogEntry {
            severity,
            timestamp: SystemTime::now(),
            source: source.to_string(),
            message,
            file: None,
            line: None,
        });
    }

    /// Log a message with file:line information (used by `engine_error!`)
    pub fn log_detailed(
        &self,
        severity: LogSeverity,
        source: &str,
        message: String,
        file: &'static str,
        line: u32,
    ) {
        if !self.enabled(severity) {
            return;
        }
        self.logger.log(&LogEntry {
            severity,
            timestamp: SystemTime::now(),
            source: source.to_string(),
            message,
            file: Some(file),
            line: Some(line),
        });
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("min_severity", &self.min_severity)
            .finish_non_exhaustive()
    }
}

// ===== LOGGING MACROS =====

/// Log a TRACE message (very verbose, typically disabled)
///
/// # Example
///
/// ```ignore
/// engine_trace!(self.log, "terra::WorkerPool", "Worker {} woke up", index);
/// ```
#[macro_export]
macro_rules! engine_trace {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let log: &$crate::terra::log::LogHandle = &$log;
        if log.enabled($crate::terra::log::LogSeverity::Trace) {
            log.log($crate::terra::log::LogSeverity::Trace, $source, format!($($arg)*));
        }
    }};
}

/// Log a DEBUG message (development information)
#[macro_export]
macro_rules! engine_debug {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let log: &$crate::terra::log::LogHandle = &$log;
        if log.enabled($crate::terra::log::LogSeverity::Debug) {
            log.log($crate::terra::log::LogSeverity::Debug, $source, format!($($arg)*));
        }
    }};
}

/// Log an INFO message (important events)
#[macro_export]
macro_rules! engine_info {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let log: &$crate::terra::log::LogHandle = &$log;
        if log.enabled($crate::terra::log::LogSeverity::Info) {
            log.log($crate::terra::log::LogSeverity::Info, $source, format!($($arg)*));
        }
    }};
}

/// Log a WARN message (potential issues)
#[macro_export]
macro_rules! engine_warn {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let log: &$crate::terra::log::LogHandle = &$log;
        if log.enabled($crate::terra::log::LogSeverity::Warn) {
            log.log($crate::terra::log::LogSeverity::Warn, $source, format!($($arg)*));
        }
    }};
}

/// Log an ERROR message with file:line information
#[macro_export]
macro_rules! engine_error {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let log: &$crate::terra::log::LogHandle = &$log;
        if log.enabled($crate::terra::log::LogSeverity::Error) {
            log.log_detailed(
                $crate::terra::log::LogSeverity::Error,
                $source,
                format!($($arg)*),
                file!(),
                line!(),
            );
        }
    }};
}

/// Log an ERROR message and evaluate to `Error::BackendError` with the same text
///
/// # Example
///
/// ```ignore
/// let fence = device.create_fence(&info, None)
///     .map_err(|e| engine_err!(self.log, "terra::vulkan", "Failed to create fence: {:?}", e))?;
/// ```
#[macro_export]
macro_rules! engine_err {
    ($log:expr, $source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::engine_error!($log, $source, "{}", message);
        $crate::terra::Error::BackendError(message)
    }};
}

/// Log an ERROR message and return `Err(Error::BackendError)` from the current function
#[macro_export]
macro_rules! engine_bail {
    ($log:expr, $source:expr, $($arg:tt)*) => {
        return Err($crate::engine_err!($log, $source, $($arg)*))
    };
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
