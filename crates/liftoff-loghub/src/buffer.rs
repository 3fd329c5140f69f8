//! Per-deployment log ring buffer and query filtering.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which part of the platform produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    System,
    Application,
    Build,
    Deployment,
}

/// One buffered log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub deployment_id: String,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Per-deployment monotonically increasing insertion index.
    pub sequence: u64,
}

/// Query filter, applied in field order; `tail` is the final slice.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub levels: Option<Vec<LogLevel>>,
    pub sources: Option<Vec<LogSource>>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    /// Case-insensitive substring match over message and tags.
    pub search: Option<String>,
    /// Entry matches if it carries any of these tags.
    pub tags: Option<Vec<String>>,
    pub tail: Option<usize>,
}

/// Bounded ring of log entries for one deployment.
///
/// `sequence` counts total insertions, so it keeps increasing after the
/// ring starts evicting.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    max_size: usize,
    total_appended: u64,
    pub created_at: u64,
    pub last_access_at: u64,
}

impl LogBuffer {
    pub fn new(max_size: usize, now: u64) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(64)),
            max_size,
            total_appended: 0,
            created_at: now,
            last_access_at: now,
        }
    }

    /// Sequence the next appended entry will receive.
    pub fn next_sequence(&self) -> u64 {
        self.total_appended
    }

    /// Append an entry, assigning its sequence. Returns entries evicted
    /// to stay within `max_size` (oldest first).
    pub fn push(&mut self, mut entry: LogEntry, now: u64) -> (LogEntry, Vec<LogEntry>) {
        entry.sequence = self.total_appended;
        self.total_appended += 1;
        self.last_access_at = now;
        self.entries.push_back(entry.clone());

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            if let Some(old) = self.entries.pop_front() {
                evicted.push(old);
            }
        }
        (entry, evicted)
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries (the sequence counter keeps running).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The newest `n` entries, in sequence order.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Apply a filter and return matching entries in sequence order.
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let mut results: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| {
                if let Some(ref levels) = filter.levels {
                    if !levels.contains(&e.level) {
                        return false;
                    }
                }
                if let Some(ref sources) = filter.sources {
                    if !sources.contains(&e.source) {
                        return false;
                    }
                }
                if let Some(start) = filter.start_time {
                    if e.timestamp < start {
                        return false;
                    }
                }
                if let Some(end) = filter.end_time {
                    if e.timestamp > end {
                        return false;
                    }
                }
                if let Some(ref needle) = filter.search {
                    let needle = needle.to_lowercase();
                    let in_message = e.message.to_lowercase().contains(&needle);
                    let in_tags = e.tags.iter().any(|t| t.to_lowercase().contains(&needle));
                    if !in_message && !in_tags {
                        return false;
                    }
                }
                if let Some(ref tags) = filter.tags {
                    if !tags.iter().any(|t| e.tags.contains(t)) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if let Some(tail) = filter.tail {
            let skip = results.len().saturating_sub(tail);
            results.drain(..skip);
        }
        results
    }
}
