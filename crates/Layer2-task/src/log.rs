//! Service Log Buffer - fixed-capacity output ring per dev service
//!
//! Holds the most recent combined stdout/stderr lines of one service with
//! terminal escape sequences removed. Oldest lines fall off first.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default lines kept per service
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Prefix for lines written by the supervisor itself
pub const DIAGNOSTIC_PREFIX: &str = "[service-manager]";

/// Ring buffer of output lines
#[derive(Debug)]
pub struct ServiceLogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for ServiceLogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl ServiceLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a raw output line (escape codes are stripped)
    pub fn push(&self, line: &str) {
        let clean = strip_ansi_escapes::strip_str(line);
        self.push_clean(clean);
    }

    /// Append a supervisor diagnostic line
    pub fn push_diagnostic(&self, message: &str) {
        self.push_clean(format!("{} {}", DIAGNOSTIC_PREFIX, message));
    }

    fn push_clean(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Every buffered line, oldest first
    pub fn all(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}
