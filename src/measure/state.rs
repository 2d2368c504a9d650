//! The single source of truth over converter and channel configuration.
//!
//! One `CompleteState` mirrors the ADC registers and the measurement
//! registry. Every mutation through the protocol rebuilds the affected half
//! from the live sources, broadcasts the packed bytes on the STATUS stream
//! and persists the same bytes to the state file. On boot the file is
//! validated and pushed back into the converter and the registry; a corrupt
//! file is replaced by clean defaults.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::adc::{
    AdcDriver, CALIBRATION_OFFSET_MAX, CALIBRATION_OFFSET_MIN, PGA_BYPASSED,
    REF_INTERNAL_TENS_NANOVOLT,
};
use crate::config::{MAX_MEASUREMENTS, SEND_TYPE_STATUS};
use crate::fft::{is_valid_length, RECTANGULAR_WINDOW_INDEX, WINDOW_FUNCTIONS};
use crate::measure::measurement::Registry;
use crate::measure::MeasureStateCell;
use crate::stream::Streamer;

pub const STATE_FILENAME: &str = "state";

pub const ADC_STATE_SIZE: usize = 29;
pub const MEASUREMENT_STATE_SIZE: usize = 9;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcState {
    /// Acquisition state machine value (2 bits on the wire).
    pub started: u8,
    pub internal_reference: bool,
    pub slow_connection: bool,
    pub adc_reset: bool,
    /// Samplerate in the low nibble, filter in the high nibble.
    pub sr_filter: u8,
    /// PGA gain code, or 0xFF for bypass.
    pub pga: u8,
    pub v_ref_tens_nanovolt: u64,
    pub v_ref_inputs: u8,
    pub calibration_offset: i64,
    pub calibration_scale: u64,
    pub measurement_count: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementState {
    pub id: u8,
    pub input_multiplexer: u8,
    pub enabled: u8,
    pub averaging: u16,
    pub fft_enabled: u8,
    pub fft_length: u16,
    pub fft_window_index: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteState {
    pub adc: AdcState,
    pub measurements: Vec<MeasurementState>,
}

impl CompleteState {
    /// Packed little-endian image, exactly the bytes that go to clients and
    /// to the state file.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            ADC_STATE_SIZE + self.measurements.len() * MEASUREMENT_STATE_SIZE,
        );
        let a = &self.adc;
        let mut flags = a.started & 0x03;
        if a.internal_reference {
            flags |= 1 << 2;
        }
        if a.slow_connection {
            flags |= 1 << 3;
        }
        if a.adc_reset {
            flags |= 1 << 4;
        }
        out.push(flags);
        out.push(a.sr_filter);
        out.push(a.pga);
        out.extend_from_slice(&a.v_ref_tens_nanovolt.to_le_bytes());
        out.push(a.v_ref_inputs);
        out.extend_from_slice(&a.calibration_offset.to_le_bytes());
        out.extend_from_slice(&a.calibration_scale.to_le_bytes());
        out.push(self.measurements.len() as u8);

        for m in &self.measurements {
            out.push(m.id);
            out.push(m.input_multiplexer);
            out.push(m.enabled);
            out.extend_from_slice(&m.averaging.to_le_bytes());
            out.push(m.fft_enabled);
            out.extend_from_slice(&m.fft_length.to_le_bytes());
            out.push(m.fft_window_index);
        }
        out
    }

    /// Parses and validates a persisted image. Any violated reload rule
    /// rejects the whole image; the started, slow-connection and ADC-reset
    /// flags never survive a reload.
    pub fn decode(data: &[u8]) -> Option<CompleteState> {
        if data.len() < ADC_STATE_SIZE {
            return None;
        }

        let flags = data[0];
        let sr_filter = data[1];
        let pga = data[2];
        let v_ref = u64::from_le_bytes(data[3..11].try_into().ok()?);
        let v_ref_inputs = data[11];
        let calibration_offset = i64::from_le_bytes(data[12..20].try_into().ok()?);
        let calibration_scale = u64::from_le_bytes(data[20..28].try_into().ok()?);
        let measurement_count = data[28];

        let filter = (sr_filter >> 4) & 0x0F;
        if filter > 4 {
            return None;
        }
        if pga != PGA_BYPASSED && pga > 5 {
            return None;
        }
        let internal_reference = flags & (1 << 2) != 0;
        if internal_reference && v_ref != REF_INTERNAL_TENS_NANOVOLT {
            return None;
        }
        if !(CALIBRATION_OFFSET_MIN..=CALIBRATION_OFFSET_MAX).contains(&calibration_offset) {
            return None;
        }
        if measurement_count as usize > MAX_MEASUREMENTS {
            return None;
        }
        if data.len()
            != ADC_STATE_SIZE + measurement_count as usize * MEASUREMENT_STATE_SIZE
        {
            return None;
        }

        let mut measurements = Vec::with_capacity(measurement_count as usize);
        for i in 0..measurement_count as usize {
            let m = &data[ADC_STATE_SIZE + i * MEASUREMENT_STATE_SIZE..];
            let state = MeasurementState {
                id: m[0],
                input_multiplexer: m[1],
                enabled: m[2],
                averaging: u16::from_le_bytes([m[3], m[4]]),
                fft_enabled: m[5],
                fft_length: u16::from_le_bytes([m[6], m[7]]),
                fft_window_index: m[8],
            };
            if state.id as usize >= MAX_MEASUREMENTS {
                return None;
            }
            if state.enabled > 1 || state.fft_enabled > 1 {
                return None;
            }
            if !is_valid_length(state.fft_length) {
                return None;
            }
            if state.fft_window_index != RECTANGULAR_WINDOW_INDEX
                && state.fft_window_index >= WINDOW_FUNCTIONS
            {
                return None;
            }
            measurements.push(state);
        }

        Some(CompleteState {
            adc: AdcState {
                started: 0,
                internal_reference,
                slow_connection: false,
                adc_reset: false,
                sr_filter,
                pga,
                v_ref_tens_nanovolt: v_ref,
                v_ref_inputs,
                calibration_offset,
                calibration_scale,
                measurement_count,
            },
            measurements,
        })
    }
}

/// Programs the converter registers from a state image.
pub fn apply_adc_state(adc: &dyn AdcDriver, state: &AdcState) {
    adc.set_samplerate(state.sr_filter & 0x0F);
    adc.set_filter((state.sr_filter >> 4) & 0x0F);
    if state.pga == PGA_BYPASSED {
        adc.bypass_pga();
    } else {
        adc.set_gain(state.pga);
    }
    if state.internal_reference {
        adc.enable_internal_reference();
        adc.set_reference(0, 0, REF_INTERNAL_TENS_NANOVOLT);
    } else {
        adc.disable_internal_reference();
        adc.set_reference(
            state.v_ref_inputs >> 4,
            state.v_ref_inputs & 0x0F,
            state.v_ref_tens_nanovolt,
        );
    }
    adc.set_calibration_offset(state.calibration_offset as i32);
    adc.set_calibration_scale(state.calibration_scale as u32);
}

pub struct StateController {
    state: Mutex<CompleteState>,
    slow_connection: AtomicBool,
    adc_reset: AtomicBool,
    /// Guards the state file; writers that lose the race skip the write, the
    /// next update persists again.
    file_lock: Mutex<()>,
    path: PathBuf,
    adc: Arc<dyn AdcDriver>,
    registry: Arc<Mutex<Registry>>,
    measure_state: Arc<MeasureStateCell>,
    streamer: Arc<Streamer>,
}

impl StateController {
    pub fn new(
        data_dir: &Path,
        adc: Arc<dyn AdcDriver>,
        registry: Arc<Mutex<Registry>>,
        measure_state: Arc<MeasureStateCell>,
        streamer: Arc<Streamer>,
    ) -> Self {
        StateController {
            state: Mutex::new(CompleteState::default()),
            slow_connection: AtomicBool::new(false),
            adc_reset: AtomicBool::new(false),
            file_lock: Mutex::new(()),
            path: data_dir.join(STATE_FILENAME),
            adc,
            registry,
            measure_state,
            streamer,
        }
    }

    pub fn set_slow_connection_flag(&self) {
        self.slow_connection.store(true, Ordering::Release);
    }

    pub fn clear_slow_connection_flag(&self) {
        self.slow_connection.store(false, Ordering::Release);
    }

    pub fn is_slow_connection_set(&self) -> bool {
        self.slow_connection.load(Ordering::Acquire)
    }

    pub fn set_adc_reset_flag(&self) {
        self.adc_reset.store(true, Ordering::Release);
    }

    pub fn clear_adc_reset_flag(&self) {
        self.adc_reset.store(false, Ordering::Release);
    }

    pub fn is_adc_reset_set(&self) -> bool {
        self.adc_reset.load(Ordering::Acquire)
    }

    /// Refreshes the converter half of the state by reading the live
    /// registers. While the reset flag is set the registers are untrusted
    /// and left as they were.
    pub fn update_adc_state(&self, send_and_save: bool) {
        {
            let mut state = self.state.lock();
            if !self.is_adc_reset_set() {
                let adc = &*self.adc;
                state.adc.internal_reference = adc.internal_reference_used();
                state.adc.sr_filter = adc.samplerate() | (adc.filter() << 4);
                state.adc.pga = adc.gain();
                state.adc.v_ref_tens_nanovolt = adc.reference_voltage();
                state.adc.v_ref_inputs = adc.reference_pins();
                state.adc.calibration_offset = adc.calibration_offset() as i64;
                state.adc.calibration_scale = adc.calibration_scale() as u64;
            }
        }
        if send_and_save {
            self.broadcast();
            self.save();
        }
    }

    /// Refreshes the channel half of the state from the registry.
    pub fn update_measurement_state(&self, send_and_save: bool) {
        {
            let registry = self.registry.lock();
            let mut state = self.state.lock();
            state.measurements = registry
                .iter()
                .map(|(id, m)| MeasurementState {
                    id,
                    input_multiplexer: m.input_mux,
                    enabled: m.enabled as u8,
                    averaging: m.averaging_count,
                    fft_enabled: m.fft.enabled() as u8,
                    fft_length: m.fft.length(),
                    fft_window_index: m.fft.window_index(),
                })
                .collect();
            state.adc.measurement_count = state.measurements.len() as u8;
        }
        if send_and_save {
            self.broadcast();
            self.save();
        }
    }

    pub fn update_complete_state(&self, send_and_save: bool) {
        self.update_adc_state(false);
        self.update_measurement_state(send_and_save);
    }

    /// The current packed image, with the volatile flags merged in.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let mut snapshot = self.state.lock().clone();
        snapshot.adc.started = self.measure_state.get() as u8;
        snapshot.adc.slow_connection = self.is_slow_connection_set();
        snapshot.adc.adc_reset = self.is_adc_reset_set();
        snapshot.encode()
    }

    /// Pushes the packed state to all STATUS subscribers.
    pub fn broadcast(&self) {
        let bytes = self.snapshot_bytes();
        self.streamer.send_data(SEND_TYPE_STATUS, &bytes);
    }

    /// Best-effort persistence: a writer that cannot take the file lock
    /// immediately falls through, the next update will persist.
    pub fn save(&self) {
        let guard = match self.file_lock.try_lock() {
            Some(guard) => guard,
            None => return,
        };
        let bytes = self.snapshot_bytes();
        if let Err(e) = std::fs::write(&self.path, &bytes) {
            warn!("could not write state file {}: {}", self.path.display(), e);
        }
        drop(guard);
    }

    /// Re-programs the converter from the mirrored state, e.g. after an
    /// explicit reset command.
    pub fn reprogram_adc(&self) {
        let state = self.state.lock();
        apply_adc_state(&*self.adc, &state.adc);
    }

    /// Boot path: load the persisted state and program the converter and
    /// the registry from it, or fall back to clean defaults and overwrite
    /// the file.
    pub fn load_and_apply(&self) {
        let loaded = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| CompleteState::decode(&bytes));

        match loaded {
            Some(state) => {
                info!("loaded state from {}", self.path.display());
                apply_adc_state(&*self.adc, &state.adc);
                self.registry.lock().restore_from_state(&state);
                *self.state.lock() = state;
            }
            None => {
                info!("no usable state file, writing defaults");
                self.update_complete_state(false);
                self.save();
            }
        }
    }
}
