//! Delay-line jitter buffer
//!
//! Single producer (the receiver thread), single consumer (the assembler
//! thread). Entries are released in arrival order once
//! `now >= arrival + delay`. The buffer is bounded by the packets that
//! arrive within `delay + safety margin`; on overflow the oldest entry is
//! discarded.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::ms_to_ns;
use crate::constants::{JITTER_SAFETY_MARGIN_MS, MAX_BUFFER_DELAY_MS};

/// Smallest slot count regardless of delay
const MIN_SLOTS: usize = 16;

/// A buffered datagram
#[derive(Debug, Clone)]
pub struct JitterEntry {
    pub arrival_ns: u64,
    /// `arrival_ns + delay` under the delay in force when released
    pub release_ns: u64,
    pub payload: Bytes,
}

/// Bounded delay queue for one stream
pub struct JitterBuffer {
    queue: ArrayQueue<JitterEntry>,
    /// Head entry taken off the queue but not yet due
    held: Mutex<Option<JitterEntry>>,
    packet_rate: u32,
    active_slots: AtomicUsize,
    delay_ns: AtomicU64,
    pushed: AtomicU64,
    released: AtomicU64,
    overflows: AtomicU64,
}

impl JitterBuffer {
    /// Create a buffer for a stream of `packet_rate` packets per second
    pub fn new(packet_rate: u32, delay_ms: u32) -> Self {
        let max_slots = Self::slots_for(packet_rate, MAX_BUFFER_DELAY_MS);
        let delay_ms = delay_ms.min(MAX_BUFFER_DELAY_MS);

        Self {
            queue: ArrayQueue::new(max_slots),
            held: Mutex::new(None),
            packet_rate,
            active_slots: AtomicUsize::new(Self::slots_for(packet_rate, delay_ms)),
            delay_ns: AtomicU64::new(ms_to_ns(delay_ms as u64)),
            pushed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Slots needed to hold `delay_ms` plus the safety margin at `packet_rate`
    pub fn slots_for(packet_rate: u32, delay_ms: u32) -> usize {
        let window_ms = (delay_ms + JITTER_SAFETY_MARGIN_MS) as usize;
        let slots = (packet_rate as usize * window_ms).div_ceil(1000);
        slots.max(MIN_SLOTS)
    }

    /// Enqueue a datagram stamped at `arrival_ns`
    pub fn push(&self, payload: Bytes, arrival_ns: u64) {
        let delay = self.delay_ns.load(Ordering::Relaxed);
        let entry = JitterEntry {
            arrival_ns,
            release_ns: arrival_ns + delay,
            payload,
        };

        // Enforce the delay-dependent bound
        let active = self.active_slots.load(Ordering::Relaxed);
        while self.queue.len() >= active {
            if self.queue.pop().is_none() {
                break;
            }
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }

        if self.queue.force_push(entry).is_some() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the oldest entry if it is due at `now_ns`
    pub fn pop_ready(&self, now_ns: u64) -> Option<JitterEntry> {
        let mut held = self.held.lock();
        let mut entry = match held.take() {
            Some(entry) => entry,
            None => self.queue.pop()?,
        };

        let release_ns = entry.arrival_ns + self.delay_ns.load(Ordering::Relaxed);
        if now_ns >= release_ns {
            entry.release_ns = release_ns;
            self.released.fetch_add(1, Ordering::Relaxed);
            Some(entry)
        } else {
            *held = Some(entry);
            None
        }
    }

    /// Change the delay; applies to queued entries as well
    pub fn set_delay(&self, delay_ms: u32) {
        let delay_ms = delay_ms.min(MAX_BUFFER_DELAY_MS);
        self.delay_ns.store(ms_to_ns(delay_ms as u64), Ordering::Relaxed);
        self.active_slots.store(Self::slots_for(self.packet_rate, delay_ms), Ordering::Relaxed);
    }

    /// Current delay in milliseconds
    pub fn delay_ms(&self) -> u32 {
        (self.delay_ns.load(Ordering::Relaxed) / 1_000_000) as u32
    }

    /// Discard all entries
    pub fn clear(&self) {
        let mut held = self.held.lock();
        *held = None;
        while self.queue.pop().is_some() {}
    }

    /// Get current buffer length
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.held.lock().is_some())
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the delay-dependent bound
    pub fn capacity(&self) -> usize {
        self.active_slots.load(Ordering::Relaxed)
    }

    /// Get overflow count
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.len(),
            capacity: self.capacity(),
            delay_ms: self.delay_ms(),
            pushed: self.pushed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub delay_ms: u32,
    pub pushed: u64,
    pub released: u64,
    pub overflows: u64,
}

impl JitterBufferStats {
    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            self.level as f32 / self.capacity as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    #[test]
    fn test_release_at_arrival_plus_delay() {
        let buffer = JitterBuffer::new(250, 10);
        buffer.push(payload(1), 5 * MS);

        assert!(buffer.pop_ready(15 * MS - 1).is_none());
        let entry = buffer.pop_ready(15 * MS).unwrap();
        assert_eq!(entry.arrival_ns, 5 * MS);
        assert_eq!(entry.release_ns, 15 * MS);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_preserves_arrival_order() {
        let buffer = JitterBuffer::new(3400, 0);
        for i in 0..10u8 {
            buffer.push(payload(i), i as u64);
        }
        let tags: Vec<u8> = std::iter::from_fn(|| buffer.pop_ready(100))
            .map(|e| e.payload[0])
            .collect();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_held_entry_blocks_newer_ones() {
        let buffer = JitterBuffer::new(250, 20);
        buffer.push(payload(1), 0);
        buffer.push(payload(2), 5 * MS);

        assert!(buffer.pop_ready(19 * MS).is_none());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop_ready(20 * MS).unwrap().payload[0], 1);
        assert!(buffer.pop_ready(20 * MS).is_none());
        assert_eq!(buffer.pop_ready(25 * MS).unwrap().payload[0], 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = JitterBuffer::new(100, 0);
        // 100 pkt/s over 100 ms margin -> floor of 16 slots
        assert_eq!(buffer.capacity(), 16);

        for i in 0..20u8 {
            buffer.push(payload(i), 0);
        }
        assert_eq!(buffer.overflow_count(), 4);
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.pop_ready(MS).unwrap().payload[0], 4);
    }

    #[test]
    fn test_capacity_tracks_delay() {
        assert_eq!(JitterBuffer::slots_for(3400, 10), 374);
        assert_eq!(JitterBuffer::slots_for(250, 500), 150);

        let buffer = JitterBuffer::new(3400, 10);
        buffer.set_delay(100);
        assert_eq!(buffer.capacity(), 680);
        assert_eq!(buffer.delay_ms(), 100);

        buffer.set_delay(10_000);
        assert_eq!(buffer.delay_ms(), 500);
    }

    #[test]
    fn test_set_delay_applies_to_queued_entries() {
        let buffer = JitterBuffer::new(250, 50);
        buffer.push(payload(1), 0);
        assert!(buffer.pop_ready(10 * MS).is_none());

        buffer.set_delay(10);
        assert!(buffer.pop_ready(10 * MS).is_some());
    }

    #[test]
    fn test_stats() {
        let buffer = JitterBuffer::new(250, 0);
        buffer.push(payload(1), 0);
        buffer.push(payload(2), 0);
        buffer.pop_ready(0);

        let stats = buffer.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.level, 1);
        assert_eq!(buffer.len(), 1);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
