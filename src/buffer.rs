// ============================================================================
// EVENT BUFFER
// ============================================================================
// Bounded FIFO shared between the realtime thread and the collection loop:
// - `add` never blocks and never fails
// - overflow drops the oldest entry (drop-oldest backpressure)
// - `drain` hands every buffered entry to the caller in arrival order
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::types::BufferedEvent;
use crate::DEFAULT_EVENT_BUFFER_CAPACITY;

/// Bounded, thread-safe ring buffer with drop-oldest overflow.
pub struct EventBuffer<T = BufferedEvent> {
    /// Buffered entries, oldest at the front
    entries: Mutex<VecDeque<T>>,
    /// Fixed capacity
    capacity: usize,
    /// Total entries ever added
    total_added: AtomicU64,
    /// Entries discarded on overflow
    dropped: AtomicU64,
    /// Whether an overflow has been logged since the last drain
    overflow_logged: AtomicBool,
}

impl<T> EventBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total_added: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            overflow_logged: AtomicBool::new(false),
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn add(&self, entry: T) {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front().is_some()
            } else {
                false
            };
            entries.push_back(entry);
            evicted
        };

        self.total_added.fetch_add(1, AtomicOrdering::Relaxed);
        if evicted {
            self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
            if !self.overflow_logged.swap(true, AtomicOrdering::Relaxed) {
                warn!(target: "vigil::buffer",
                    capacity = self.capacity,
                    "Event buffer full, discarding oldest events");
            }
        }
    }

    /// Remove and return everything buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut entries = self.entries.lock();
            entries.drain(..).collect()
        };
        self.overflow_logged.store(false, AtomicOrdering::Relaxed);
        trace!(target: "vigil::buffer", count = drained.len(), "Buffer drained");
        drained
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics.
    pub fn stats(&self) -> BufferStats {
        let len = self.len();
        BufferStats {
            capacity: self.capacity,
            current_len: len,
            total_added: self.total_added.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            utilization: len as f64 / self.capacity as f64,
        }
    }
}

impl<T> Default for EventBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_CAPACITY)
    }
}

impl<T> fmt::Debug for EventBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

/// Statistics for an event buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub current_len: usize,
    pub total_added: u64,
    pub dropped: u64,
    pub utilization: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_overflow_keeps_newest_in_order() {
        let buffer: EventBuffer<i32> = EventBuffer::new(3);
        for i in 1..=5 {
            buffer.add(i);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.drain(), vec![3, 4, 5]);

        let stats = buffer.stats();
        assert_eq!(stats.total_added, 5);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let buffer: EventBuffer<&str> = EventBuffer::new(10);
        assert!(buffer.drain().is_empty());

        buffer.add("a");
        buffer.add("b");
        assert_eq!(buffer.drain(), vec!["a", "b"]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer: EventBuffer<u8> = EventBuffer::new(0);
        buffer.add(1);
        buffer.add(2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.drain(), vec![2]);
    }

    #[test]
    fn test_default_capacity() {
        let buffer: EventBuffer = EventBuffer::default();
        assert_eq!(buffer.capacity(), DEFAULT_EVENT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_concurrent_producers_and_consumer() {
        let buffer: Arc<EventBuffer<(usize, usize)>> = Arc::new(EventBuffer::new(100_000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.add((p, i));
                    }
                })
            })
            .collect();

        let mut collected = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            collected.extend(buffer.drain());
        }
        for handle in producers {
            handle.join().unwrap();
        }
        collected.extend(buffer.drain());

        assert_eq!(collected.len(), 4_000);
        // Per-producer arrival order survives interleaved drains.
        for p in 0..4 {
            let seq: Vec<usize> = collected.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..1_000).collect::<Vec<_>>());
        }
    }
}
