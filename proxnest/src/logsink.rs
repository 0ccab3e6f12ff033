//! Bounded operational log consumed by status observers.
//!
//! This is the operator-facing log: a FIFO ring of the 100 most recent
//! entries, timestamped with wall-clock time. Diagnostic logging goes
//! through `tracing` as usual; the sink only carries what a polling
//! frontend would show next to the status register.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Maximum number of retained entries. Oldest are silently dropped.
const LOG_CAPACITY: usize = 100;

/// A single timestamped log line.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Wall-clock `HH:MM:SS` at append time.
    pub timestamp: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp, self.message)
    }
}

/// Cloneable handle to the shared ring buffer.
///
/// Concurrent producers may interleave entries; append order is only
/// guaranteed per producer.
#[derive(Clone)]
pub struct LogSink {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_CAPACITY))),
        }
    }

    /// Append a message, evicting the oldest entry when full.
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(log = %message, "operational log");

        let entry = LogEntry {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            message,
        };

        let mut entries = self.entries.lock();
        if entries.len() == LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of all retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Snapshot of the `n` most recent entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
