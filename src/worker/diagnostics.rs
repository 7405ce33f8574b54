//! Bounded history of the worker's diagnostic (stderr) stream

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// What happened to a line offered to a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The line was queued after evicting the oldest entry
    EvictedOldest,
    /// The queue was full and the new line was discarded
    DroppedNewest,
    /// The consumer side is gone
    Closed,
}

/// Fixed-capacity ring of recent diagnostic lines.
///
/// Writers never block: at capacity the oldest line is evicted to admit the
/// new one. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, line: impl Into<String>) -> PushOutcome {
        let mut lines = self.lines();
        let outcome = if lines.len() >= self.capacity {
            lines.pop_front();
            PushOutcome::EvictedOldest
        } else {
            PushOutcome::Queued
        };
        lines.push_back(line.into());
        outcome
    }

    /// Copy of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines().iter().cloned().collect()
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lines().clear();
    }

    pub fn len(&self) -> usize {
        self.lines().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Emit the retained history as a single error-level log record.
    pub fn log_recent(&self, context: &str) {
        let recent = self.snapshot();
        if recent.is_empty() {
            tracing::debug!("{}: no worker diagnostics captured", context);
        } else {
            tracing::error!(
                "{}; recent worker stderr output:\n{}",
                context,
                recent.join("\n")
            );
        }
    }
}
