//! Pool diagnostic log model: structured entries in a bounded ring.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Fine-grained diagnostics.
    Debug,
    /// Routine lifecycle events.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure that affected a task, worker or stream.
    Error,
}

/// One structured diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Wall-clock stamp, epoch milliseconds.
    pub timestamp: i64,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Worker type the entry relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    /// Worker the entry relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Task the entry relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Additional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    /// Entry stamped with the current wall clock.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            message: message.into(),
            worker_type: None,
            worker_id: None,
            task_id: None,
            data: None,
        }
    }

    /// Tags the entry with a worker type.
    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }

    /// Tags the entry with a worker id.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Tags the entry with a task id.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attaches a structured payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Bounded ring of log entries; the oldest entry drops when full.
#[derive(Debug)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogRing {
    /// Ring holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends an entry, dropping the oldest when at capacity.
    pub fn push(&mut self, entry: LogEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Newest-last view of the retained entries, optionally filtered by
    /// minimum level.
    pub fn entries(&self, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| min_level.is_none_or(|lvl| e.level >= lvl))
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_when_full() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(LogEntry::new(LogLevel::Info, format!("entry {i}")));
        }
        let entries = ring.entries(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].message, "entry 4");
    }

    #[test]
    fn level_filter_is_a_minimum() {
        let mut ring = LogRing::new(10);
        ring.push(LogEntry::new(LogLevel::Debug, "d"));
        ring.push(LogEntry::new(LogLevel::Warn, "w"));
        ring.push(LogEntry::new(LogLevel::Error, "e"));

        let warnings = ring.entries(Some(LogLevel::Warn));
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|e| e.level >= LogLevel::Warn));
    }
}
