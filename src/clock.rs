//! 10-microsecond reference tick counter.
//!
//! All sample timestamps, value-record deltas and FFT frame timing are
//! expressed in these ticks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Number of microseconds per reference tick.
pub const TICK_US: u64 = 10;

/// Monotonic tick source. The normal flavor derives ticks from a monotonic
/// clock; the manual flavor is advanced explicitly and exists for
/// deterministic tests of timestamp handling.
pub struct TickClock {
    origin: Instant,
    manual: bool,
    manual_ticks: AtomicU64,
}

impl TickClock {
    pub fn new() -> Self {
        TickClock {
            origin: Instant::now(),
            manual: false,
            manual_ticks: AtomicU64::new(0),
        }
    }

    /// A clock that only moves when `advance` is called.
    pub fn manual() -> Self {
        TickClock {
            origin: Instant::now(),
            manual: true,
            manual_ticks: AtomicU64::new(0),
        }
    }

    /// Current tick count since construction.
    pub fn ticks(&self) -> u64 {
        if self.manual {
            self.manual_ticks.load(Ordering::Acquire)
        } else {
            (self.origin.elapsed().as_micros() / TICK_US as u128) as u64
        }
    }

    /// Advance a manual clock. No effect on a real clock.
    pub fn advance(&self, ticks: u64) {
        self.manual_ticks.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_real_clock_advances() {
        let clock = TickClock::new();
        let t0 = clock.ticks();
        thread::sleep(Duration::from_millis(5));
        let t1 = clock.ticks();
        // 5 ms are 500 ticks; allow generous scheduling slack.
        assert!(t1 - t0 >= 400, "clock advanced only {} ticks", t1 - t0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = TickClock::manual();
        assert_eq!(clock.ticks(), 0);
        clock.advance(64_001);
        assert_eq!(clock.ticks(), 64_001);
    }
}
