//! Simulated ADC driver.
//!
//! Generates conversions at the configured data rate without hardware. Used
//! by `nanovoltd` when no converter is attached and by the end-to-end tests.
//! Values come from a waveform function of (sample index, mux byte) so tests
//! can make them deterministic; samples and status bytes can also be
//! injected explicitly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    samples_per_second, AdcDriver, AdcSample, AdcStatus, PGA_BYPASSED, RATE_100,
    REF_INTERNAL_TENS_NANOVOLT,
};

type ValueFn = Box<dyn Fn(u64, u8) -> i32 + Send + Sync>;

struct SimRegs {
    mux: u8,
    samplerate: u8,
    filter: u8,
    gain: u8,
    internal_reference: bool,
    v_ref: u64,
    ref_pins: u8,
    calibration_offset: i32,
    calibration_scale: u32,
    continuous: bool,
    next_drdy: Option<Instant>,
    injected: VecDeque<AdcSample>,
}

pub struct SimAdc {
    regs: Mutex<SimRegs>,
    running: AtomicBool,
    sample_index: AtomicU64,
    value_fn: ValueFn,
    /// When true, DRDY pacing is disabled entirely (watchdog tests).
    drdy_suppressed: AtomicBool,
}

impl SimAdc {
    pub fn new() -> Self {
        // Default waveform: a slow full-scale triangle, distinct per mux so
        // multiplexed channels are tellable apart.
        Self::with_value_fn(Box::new(|n, mux| {
            let phase = (n % 2000) as i32 - 1000;
            phase * 1000 + (mux as i32) * 7
        }))
    }

    pub fn with_value_fn(value_fn: ValueFn) -> Self {
        SimAdc {
            regs: Mutex::new(SimRegs {
                mux: 0x01,
                samplerate: RATE_100,
                filter: 0,
                gain: 0,
                internal_reference: true,
                v_ref: REF_INTERNAL_TENS_NANOVOLT,
                ref_pins: 0,
                calibration_offset: 0,
                calibration_scale: 0x40_0000,
                continuous: false,
                next_drdy: None,
                injected: VecDeque::new(),
            }),
            running: AtomicBool::new(false),
            sample_index: AtomicU64::new(0),
            value_fn,
            drdy_suppressed: AtomicBool::new(false),
        }
    }

    /// Queue a sample to be returned ahead of the generated waveform.
    pub fn inject(&self, sample: AdcSample) {
        self.regs.lock().injected.push_back(sample);
    }

    /// Stop raising DRDY while leaving the converter logically started.
    pub fn suppress_drdy(&self, suppressed: bool) {
        self.drdy_suppressed.store(suppressed, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for SimAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl AdcDriver for SimAdc {
    fn reset(&self) {
        let mut regs = self.regs.lock();
        regs.mux = 0x01;
        regs.samplerate = RATE_100;
        regs.filter = 0;
        regs.gain = 0;
        regs.internal_reference = true;
        regs.v_ref = REF_INTERNAL_TENS_NANOVOLT;
        regs.ref_pins = 0;
        regs.calibration_offset = 0;
        regs.next_drdy = None;
        regs.injected.clear();
        self.running.store(false, Ordering::Release);
    }

    fn start(&self) {
        let mut regs = self.regs.lock();
        let period = Duration::from_secs_f64(1.0 / samples_per_second(regs.samplerate));
        regs.next_drdy = Some(Instant::now() + period);
        drop(regs);
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.regs.lock().next_drdy = None;
    }

    fn set_continuous_mode(&self) {
        self.regs.lock().continuous = true;
    }

    fn wait_data_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let converting = self.running.load(Ordering::Acquire)
                && !self.drdy_suppressed.load(Ordering::Acquire)
                && self.regs.lock().continuous;
            if !converting {
                // Nothing will convert; wait out the timeout in small steps
                // so a restart is picked up promptly.
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            let next = {
                let mut regs = self.regs.lock();
                let period =
                    Duration::from_secs_f64(1.0 / samples_per_second(regs.samplerate));
                let next = *regs.next_drdy.get_or_insert(Instant::now() + period);
                if Instant::now() >= next {
                    regs.next_drdy = Some(next + period);
                    return true;
                }
                next
            };
            let now = Instant::now();
            if next >= deadline {
                if now >= deadline {
                    return false;
                }
                std::thread::sleep(
                    deadline
                        .saturating_duration_since(now)
                        .min(Duration::from_millis(1)),
                );
            } else {
                std::thread::sleep(
                    next.saturating_duration_since(now)
                        .min(Duration::from_millis(1)),
                );
            }
        }
    }

    fn read_sample(&self) -> AdcSample {
        let mut regs = self.regs.lock();
        if let Some(sample) = regs.injected.pop_front() {
            return sample;
        }
        let mux = regs.mux;
        drop(regs);
        let n = self.sample_index.fetch_add(1, Ordering::AcqRel);
        AdcSample {
            tens_nanovolt: (self.value_fn)(n, mux),
            status: AdcStatus::default(),
            checksum_error: false,
        }
    }

    fn set_input_mux(&self, mux: u8) {
        self.regs.lock().mux = mux;
    }

    fn set_samplerate(&self, rate: u8) {
        self.regs.lock().samplerate = rate & 0x0F;
    }

    fn samplerate(&self) -> u8 {
        self.regs.lock().samplerate
    }

    fn set_filter(&self, filter: u8) {
        self.regs.lock().filter = filter & 0x0F;
    }

    fn filter(&self) -> u8 {
        self.regs.lock().filter
    }

    fn set_gain(&self, gain: u8) {
        self.regs.lock().gain = gain;
    }

    fn gain(&self) -> u8 {
        self.regs.lock().gain
    }

    fn bypass_pga(&self) {
        self.regs.lock().gain = PGA_BYPASSED;
    }

    fn set_reference(&self, pos: u8, neg: u8, v_ref_tens_nanovolt: u64) {
        let mut regs = self.regs.lock();
        regs.ref_pins = (pos << 4) | (neg & 0x0F);
        regs.v_ref = v_ref_tens_nanovolt;
    }

    fn reference_voltage(&self) -> u64 {
        self.regs.lock().v_ref
    }

    fn reference_pins(&self) -> u8 {
        self.regs.lock().ref_pins
    }

    fn enable_internal_reference(&self) {
        self.regs.lock().internal_reference = true;
    }

    fn disable_internal_reference(&self) {
        self.regs.lock().internal_reference = false;
    }

    fn internal_reference_used(&self) -> bool {
        self.regs.lock().internal_reference
    }

    fn calibration_offset(&self) -> i32 {
        self.regs.lock().calibration_offset
    }

    fn set_calibration_offset(&self, offset: i32) {
        self.regs.lock().calibration_offset = offset;
    }

    fn send_offset_calibration_command(&self) {
        self.regs.lock().calibration_offset = 42;
    }

    fn calibration_scale(&self) -> u32 {
        self.regs.lock().calibration_scale
    }

    fn set_calibration_scale(&self, scale: u32) {
        self.regs.lock().calibration_scale = scale;
    }

    fn send_scale_calibration_command(&self) {
        self.regs.lock().calibration_scale = 0x40_1234;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::RATE_19200;

    #[test]
    fn test_drdy_pacing() {
        let adc = SimAdc::new();
        adc.set_samplerate(RATE_19200);
        adc.set_continuous_mode();
        adc.start();
        let start = Instant::now();
        let mut count = 0;
        while count < 100 {
            assert!(adc.wait_data_ready(Duration::from_millis(100)));
            adc.read_sample();
            count += 1;
        }
        // 100 samples at 19.2 kSPS should take about 5 ms.
        assert!(start.elapsed() < Duration::from_millis(500));
        adc.stop();
        assert!(!adc.wait_data_ready(Duration::from_millis(5)));
    }

    #[test]
    fn test_injection_takes_priority() {
        let adc = SimAdc::new();
        adc.inject(AdcSample {
            tens_nanovolt: 1234,
            status: AdcStatus(AdcStatus::RESET),
            checksum_error: false,
        });
        let s = adc.read_sample();
        assert_eq!(s.tens_nanovolt, 1234);
        assert!(s.status.reset());
        assert!(!adc.read_sample().status.reset());
    }
}
