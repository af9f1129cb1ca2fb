//! In-process capture of log fabric traffic.
//!
//! Every record the coordinator emits is also pushed into a bounded
//! [`LogBuffer`], which operator tooling and tests can inspect without
//! standing up a UDP receiver.

use crate::logfabric::{LogLevel, LogRecord};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 4096;

/// One captured record and the sink it was routed to.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    /// `primary`, `secondary`, or `local` when no sink was installed.
    pub target: String,
    pub record: LogRecord,
}

impl LogEntry {
    pub fn level(&self) -> Option<LogLevel> {
        match &self.record {
            LogRecord::Text { level, .. } => Some(*level),
            LogRecord::Monitor { .. } => None,
        }
    }
}

/// A shared ring of the most recent records.
#[derive(Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, target: &str, record: LogRecord) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Local::now(),
            target: target.to_string(),
            record,
        });
    }

    pub fn read(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Text messages, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.record.is_text())
            .map(|e| e.record.body().to_string())
            .collect()
    }

    /// Monitor records published under `var`, oldest first.
    pub fn monitor_records(&self, var: &str) -> Vec<LogRecord> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.record.var() == Some(var))
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.record.body().contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let buffer = LogBuffer::with_capacity(2);
        buffer.push("local", LogRecord::text(LogLevel::Info, "one"));
        buffer.push("local", LogRecord::text(LogLevel::Info, "two"));
        buffer.push("local", LogRecord::text(LogLevel::Warn, "three"));
        assert_eq!(buffer.messages(), vec!["two", "three"]);
        assert_eq!(buffer.read().back().and_then(LogEntry::level), Some(LogLevel::Warn));
        buffer.clear();
        assert!(buffer.read().is_empty());
    }
}
