//! Bounded in-memory log capture.
//!
//! Each managed server owns a [`LogStore`]: a fixed-capacity ring of
//! captured lines plus a broadcast channel for live followers. Pushing
//! never blocks; slow followers lag and miss lines rather than applying
//! backpressure to the tailers.

use crate::defaults::{LOG_BUFFER_LINES, LOG_LINE_MAX_BYTES};
use canopy_core::{LogLine, LogSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Fixed-capacity ring: pushing beyond capacity evicts the oldest entry.
#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}

/// Captured output for one managed server.
pub struct LogStore {
    lines: Mutex<RingBuffer<LogLine>>,
    tx: broadcast::Sender<LogLine>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            lines: Mutex::new(RingBuffer::new(capacity)),
            tx,
        }
    }

    pub fn push(&self, source: LogSource, line: String) {
        let mut line = line;
        if line.len() > LOG_LINE_MAX_BYTES {
            line.truncate(floor_char_boundary(&line, LOG_LINE_MAX_BYTES));
        }
        let entry = LogLine { source, line };
        self.lines.lock().push(entry.clone());
        // No receivers is fine; followers come and go.
        let _ = self.tx.send(entry);
    }

    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        self.lines.lock().tail(n)
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
