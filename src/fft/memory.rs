//! Scratch memory for the per-channel FFT buffers.
//!
//! One contiguous arena is carved up at measurement start by a first-fit
//! cursor; every enabled instance receives two big buffers (samples plus
//! header slack) and one half-length overlap buffer. Instances that do not
//! fit are either disabled or fail the start, depending on policy.

use std::cell::UnsafeCell;

use crate::config::MAX_MEASUREMENTS;
use crate::stream::descriptor::SendPtr;

use super::{FftInstance, FFT_HEADER_ALIGNMENT, FFT_HEADER_SIZE, MAX_FFT_SIZE};

/// Enough space for every channel to run the largest transform.
pub const FFT_MEMORY_SIZE: usize = (MAX_FFT_SIZE * 3 * std::mem::size_of::<f32>()
    + 2 * (FFT_HEADER_ALIGNMENT + FFT_HEADER_SIZE))
    * MAX_MEASUREMENTS;

/// The arena itself. Regions handed out by `assign` are disjoint; the fill
/// and calc sides of one region are kept apart by the instance's dirty-flag
/// protocol, which is why raw pointers into the arena may cross threads.
pub struct FftMemory {
    arena: UnsafeCell<Box<[u8]>>,
    size: usize,
}

unsafe impl Send for FftMemory {}
unsafe impl Sync for FftMemory {}

impl FftMemory {
    pub fn new(size: usize) -> Self {
        FftMemory {
            arena: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn region(&self, offset: usize, len: usize) -> SendPtr {
        assert!(offset + len <= self.size, "fft arena region out of bounds");
        // The caller receives exclusive access to [offset, offset+len) until
        // the next assignment, which only happens while acquisition is idle.
        unsafe { SendPtr((*self.arena.get()).as_mut_ptr().add(offset)) }
    }

    /// Walks the instances in order and assigns each enabled one its scratch
    /// region. On overflow the instance is disabled and skipped when
    /// `disable_on_overflow` is set, otherwise the whole assignment fails.
    pub fn assign<'a>(
        &self,
        instances: impl Iterator<Item = &'a mut FftInstance>,
        disable_on_overflow: bool,
    ) -> bool {
        let mut cursor = 0usize;
        for fft in instances {
            fft.clear_buffers();
            if !fft.enabled() {
                continue;
            }

            let needed = fft.needed_buffer_size();
            if cursor + needed > self.size {
                if disable_on_overflow {
                    fft.set_enabled(false);
                    continue;
                }
                return false;
            }

            fft.assign_raw_buffer(self.region(cursor, needed));
            cursor += needed;
        }
        true
    }
}

impl Default for FftMemory {
    fn default() -> Self {
        Self::new(FFT_MEMORY_SIZE)
    }
}
