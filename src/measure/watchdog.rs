//! Sample-flow watchdog.
//!
//! A one-second tick counts up between conversions; the sample path resets
//! the counter on every DRDY. If the counter overruns its limit the
//! converter has silently died and acquisition must stop. All configured
//! data rates produce a sample well within one second except the two
//! slowest, which get two and three seconds of headroom.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::adc::{RATE_2_5, RATE_5};

pub struct Watchdog {
    started: AtomicBool,
    /// Set on start; the first tick after starting is skipped because its
    /// phase relative to the start is unknown.
    start_flag: AtomicBool,
    counter: AtomicU8,
    max_counter: AtomicU8,
}

impl Watchdog {
    pub fn new() -> Self {
        Watchdog {
            started: AtomicBool::new(false),
            start_flag: AtomicBool::new(false),
            counter: AtomicU8::new(0),
            max_counter: AtomicU8::new(1),
        }
    }

    pub fn start(&self, samplerate: u8) {
        let max = match samplerate {
            RATE_5 => 2,
            RATE_2_5 => 3,
            _ => 1,
        };
        self.max_counter.store(max, Ordering::Release);
        self.counter.store(0, Ordering::Release);
        self.start_flag.store(true, Ordering::Release);
        self.started.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    /// Called from the sample path on every conversion.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// One-second tick. Returns true exactly when the deadline expired; the
    /// watchdog then disarms itself and the caller stops acquisition.
    pub fn tick(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        if self.start_flag.swap(false, Ordering::AcqRel) {
            return false;
        }

        let count = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.max_counter.load(Ordering::Acquire) {
            self.started.store(false, Ordering::Release);
            return true;
        }
        false
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::RATE_100;

    #[test]
    fn test_fires_without_resets() {
        let wd = Watchdog::new();
        wd.start(RATE_100);
        assert!(!wd.tick(), "first tick after start is skipped");
        assert!(!wd.tick(), "counter arms");
        assert!(wd.tick(), "second unanswered tick fires");
        assert!(!wd.is_started(), "watchdog disarms itself");
        assert!(!wd.tick(), "stays quiet once disarmed");
    }

    #[test]
    fn test_reset_keeps_it_quiet() {
        let wd = Watchdog::new();
        wd.start(RATE_100);
        for _ in 0..10 {
            wd.reset();
            assert!(!wd.tick());
        }
    }

    #[test]
    fn test_slow_rates_get_longer_deadlines() {
        let wd = Watchdog::new();
        wd.start(RATE_2_5);
        assert!(!wd.tick()); // start skip
        assert!(!wd.tick());
        assert!(!wd.tick());
        assert!(!wd.tick());
        assert!(wd.tick(), "2.5 SPS fires after three unanswered seconds");
    }

    #[test]
    fn test_stop_disarms() {
        let wd = Watchdog::new();
        wd.start(RATE_100);
        wd.stop();
        assert!(!wd.tick());
        assert!(!wd.tick());
    }
}
