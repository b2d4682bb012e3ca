//! Shared helpers for unit tests (compiled only with `cfg(test)`)

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::log::{LogEntry, LogHandle, LogSeverity, Logger};

/// Logger that keeps every entry in memory for assertions
#[derive(Clone, Default)]
pub struct CaptureLogger {
    pub entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl CaptureLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> LogHandle {
        LogHandle::new(self.clone())
    }

    pub fn count(&self, severity: LogSeverity) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.message.contains(needle))
    }
}

impl Logger for CaptureLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

/// Spin (with short sleeps) until `condition` holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
