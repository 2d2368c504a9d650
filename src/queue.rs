//! Bounded ring queue with a marker cursor.
//!
//! Descriptors travel from producers (including the sample path, which must
//! never wait) to the sender fibers through these queues. The queue cannot
//! be locked from the sample path, so it carries two cursors:
//!
//! - the real head, advanced by `dequeue`, which consumes the slot;
//! - a marker head, advanced by the consuming fiber via `marker_dequeue`,
//!   which only records "observed" without freeing the slot.
//!
//! A producer cleans up behind the marker: entries the marker has passed were
//! fully handled by the fiber and may be popped for real. That cleanup is
//! forbidden while the fiber is moving the marker, which the fiber signals
//! through the `marker_updating` flag.
//!
//! Correctness rests on the single-producer / single-consumer-per-queue
//! discipline; every cursor is word-sized and written atomically.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::pool::SlotIndex;

/// Error returned when enqueueing into a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

pub struct MarkerQueue {
    ring: Box<[AtomicUsize]>,
    head: AtomicUsize,
    count: AtomicUsize,
    marker_head: AtomicUsize,
    marker_updating: AtomicBool,
}

impl MarkerQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        MarkerQueue {
            ring: (0..capacity)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            head: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            marker_head: AtomicUsize::new(0),
            marker_updating: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// True when the marker has caught up with the tail, i.e. the consumer
    /// has observed every entry currently in the queue.
    pub fn marker_empty(&self) -> bool {
        let tail = (self.head.load(Ordering::Acquire) + self.len()) % self.capacity();
        tail == self.marker_head.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, slot: SlotIndex) -> Result<(), QueueFull> {
        let count = self.count.load(Ordering::Acquire);
        if count == self.capacity() {
            return Err(QueueFull);
        }
        let pos = (self.head.load(Ordering::Acquire) + count) % self.capacity();
        self.ring[pos].store(slot, Ordering::Relaxed);
        self.count.store(count + 1, Ordering::Release);
        Ok(())
    }

    /// Pops from the real head, dragging the marker along if it was still
    /// pointing at the popped entry.
    pub fn dequeue(&self) -> Option<SlotIndex> {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return None;
        }
        let head = self.head.load(Ordering::Acquire);
        let slot = self.ring[head].load(Ordering::Relaxed);
        let next = (head + 1) % self.capacity();
        if self.marker_head.load(Ordering::Acquire) == head {
            self.marker_head.store(next, Ordering::Release);
        }
        self.head.store(next, Ordering::Release);
        self.count.store(count - 1, Ordering::Release);
        Some(slot)
    }

    pub fn front(&self) -> Option<SlotIndex> {
        if self.is_empty() {
            return None;
        }
        Some(self.ring[self.head.load(Ordering::Acquire)].load(Ordering::Relaxed))
    }

    /// The entry at the marker, without advancing anything.
    pub fn marker_front(&self) -> Option<SlotIndex> {
        if self.marker_empty() {
            return None;
        }
        Some(self.ring[self.marker_head.load(Ordering::Acquire)].load(Ordering::Relaxed))
    }

    /// Returns the entry at the marker and advances the marker past it. The
    /// entry stays in the queue until a real `dequeue` removes it.
    pub fn marker_dequeue(&self) -> Option<SlotIndex> {
        self.marker_updating.store(true, Ordering::Release);
        let result = if self.marker_empty() {
            None
        } else {
            let marker = self.marker_head.load(Ordering::Acquire);
            let slot = self.ring[marker].load(Ordering::Relaxed);
            self.marker_head
                .store((marker + 1) % self.capacity(), Ordering::Release);
            Some(slot)
        };
        self.marker_updating.store(false, Ordering::Release);
        result
    }

    /// Advisory flag: a consumer is currently moving the marker, so a
    /// producer must not pop passed entries right now.
    pub fn is_marker_updating(&self) -> bool {
        self.marker_updating.load(Ordering::Acquire)
    }

    /// True while the real head trails the marker, i.e. the front entry has
    /// already been observed by the consumer and may be reclaimed.
    pub fn head_behind_marker(&self) -> bool {
        !self.is_empty()
            && self.head.load(Ordering::Acquire) != self.marker_head.load(Ordering::Acquire)
    }
}
