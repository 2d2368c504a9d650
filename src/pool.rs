//! Fixed-capacity object pool.
//!
//! A pool owns a preallocated slot table and hands out slot indices with
//! bounded latency and no fragmentation. Allocation is a compare-and-swap
//! scan over the occupancy flags, so a producer on the sample path and the
//! sender fibers can share one pool without a lock. The occupancy view is
//! exposed so the sender fan-out and the stats reporter can iterate live
//! entries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Index of a live pool slot.
pub type SlotIndex = usize;

struct Slot<T> {
    used: AtomicBool,
    value: T,
}

pub struct Pool<T> {
    slots: Box<[Slot<T>]>,
    high_water: AtomicUsize,
}

impl<T> Pool<T> {
    /// Static flavor: the arena is built up front from the given values.
    pub fn with_slots(values: Vec<T>) -> Self {
        let slots = values
            .into_iter()
            .map(|value| Slot {
                used: AtomicBool::new(false),
                value,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Pool {
            slots,
            high_water: AtomicUsize::new(0),
        }
    }

    /// Heap flavor: slots are produced by the given constructor. Behaves
    /// identically afterwards; the two constructors only differ in where the
    /// slot storage comes from.
    pub fn from_fn(capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self::with_slots((0..capacity).map(&mut init).collect())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims a free slot, or `None` if the pool is exhausted.
    pub fn allocate(&self) -> Option<SlotIndex> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .used
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.update_high_water();
                return Some(i);
            }
        }
        None
    }

    /// Returns a slot to the pool. Freeing an index that is out of range or
    /// not currently allocated reports `false` without mutating anything.
    pub fn free(&self, index: SlotIndex) -> bool {
        match self.slots.get(index) {
            Some(slot) => slot
                .used
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok(),
            None => false,
        }
    }

    /// Access to a slot's value. Slot values carry their own interior
    /// mutability; the pool only tracks occupancy.
    pub fn get(&self, index: SlotIndex) -> &T {
        &self.slots[index].value
    }

    pub fn is_used(&self, index: SlotIndex) -> bool {
        self.slots
            .get(index)
            .map(|s| s.used.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Iterates the currently allocated entries.
    pub fn iter_used(&self) -> impl Iterator<Item = (SlotIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.used.load(Ordering::Acquire))
            .map(|(i, s)| (i, &s.value))
    }

    pub fn used_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.used.load(Ordering::Acquire))
            .count()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.used_count()
    }

    /// Highest simultaneous occupancy seen since construction.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    fn update_high_water(&self) {
        let usage = self.used_count();
        self.high_water.fetch_max(usage, Ordering::Relaxed);
    }
}
