//! Diagnostic logging helpers.
//!
//! The downstream JSON-RPC channel rides on stdout, so every diagnostic —
//! including captured upstream stderr — goes to the process stderr through
//! `tracing`. A bounded ring buffer keeps the most recent upstream stderr
//! lines around for inspection.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber for the CLI.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Output goes
/// to stderr so the JSON-RPC channel on stdout stays clean.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One captured upstream stderr line.
#[derive(Debug, Clone, PartialEq)]
pub struct StderrEntry {
    pub timestamp: DateTime<Utc>,
    pub upstream: String,
    pub line: String,
}

/// A ring buffer for captured lines with a maximum capacity.
#[derive(Debug)]
pub struct LogRingBuffer {
    buffer: VecDeque<StderrEntry>,
    max_entries: usize,
}

impl LogRingBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
        }
    }

    pub fn push(&mut self, entry: StderrEntry) {
        if self.buffer.len() >= self.max_entries {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// The most recent `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<StderrEntry> {
        let start = self.buffer.len().saturating_sub(count);
        self.buffer.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Shared sink for upstream stderr lines.
///
/// Each line is re-emitted through `tracing` under the upstream's logical
/// name and retained in the ring buffer.
#[derive(Clone)]
pub struct StderrCapture {
    buffer: Option<Arc<Mutex<LogRingBuffer>>>,
}

impl StderrCapture {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Some(Arc::new(Mutex::new(LogRingBuffer::new(max_entries)))),
        }
    }

    /// A capture that only forwards to `tracing`, for tests and tools that
    /// do not need retention.
    pub fn disabled() -> Self {
        Self { buffer: None }
    }

    pub fn record(&self, upstream: &str, line: &str) {
        info!(target: "manifold::upstream", upstream = %upstream, "{line}");
        if let Some(buffer) = &self.buffer
            && let Ok(mut guard) = buffer.lock()
        {
            guard.push(StderrEntry {
                timestamp: Utc::now(),
                upstream: upstream.to_string(),
                line: line.to_string(),
            });
        }
    }

    /// The most recent captured lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<StderrEntry> {
        match &self.buffer {
            Some(buffer) => buffer
                .lock()
                .map(|guard| guard.recent(count))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Default for StderrCapture {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str) -> StderrEntry {
        StderrEntry {
            timestamp: Utc::now(),
            upstream: "test".to_string(),
            line: line.to_string(),
        }
    }

    #[test]
    fn ring_buffer_sheds_oldest() {
        let mut buffer = LogRingBuffer::new(2);
        buffer.push(entry("one"));
        buffer.push(entry("two"));
        buffer.push(entry("three"));

        assert_eq!(buffer.len(), 2);
        let recent = buffer.recent(10);
        assert_eq!(recent[0].line, "two");
        assert_eq!(recent[1].line, "three");
    }

    #[test]
    fn recent_limits_count() {
        let mut buffer = LogRingBuffer::new(10);
        for i in 0..5 {
            buffer.push(entry(&format!("line {i}")));
        }
        let recent = buffer.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].line, "line 3");
    }

    #[test]
    fn capture_records_lines() {
        let capture = StderrCapture::new(10);
        capture.record("files", "warning: slow start");
        let recent = capture.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].upstream, "files");
    }

    #[test]
    fn disabled_capture_retains_nothing() {
        let capture = StderrCapture::disabled();
        capture.record("files", "line");
        assert!(capture.recent(10).is_empty());
    }
}
