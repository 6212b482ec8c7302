//! Bounded console-output capture.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One captured console line.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConsoleEntry {
    pub timestamp: DateTime<Utc>,
    /// CDP console level ("log", "warn", "error", ...).
    pub level: String,
    pub text: String,
}

impl ConsoleEntry {
    pub fn new(level: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            text: text.into(),
        }
    }

    fn cost(&self) -> usize {
        self.level.len() + self.text.len()
    }
}

/// Fixed-capacity ring buffer with both an entry count and a byte cap;
/// oldest entries are shed first.
#[derive(Debug)]
pub struct ConsoleBuffer {
    entries: VecDeque<ConsoleEntry>,
    max_entries: usize,
    max_bytes: usize,
    bytes: usize,
}

impl ConsoleBuffer {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            max_bytes,
            bytes: 0,
        }
    }

    pub fn push(&mut self, entry: ConsoleEntry) {
        let cost = entry.cost();
        self.entries.push_back(entry);
        self.bytes += cost;

        while self.entries.len() > self.max_entries
            || (self.bytes > self.max_bytes && self.entries.len() > 1)
        {
            if let Some(evicted) = self.entries.pop_front() {
                self.bytes -= evicted.cost();
            }
        }
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ConsoleEntry> {
        let start = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(1_000, 256 * 1024)
    }
}
