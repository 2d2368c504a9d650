//! Measurement channel registry.
//!
//! A measurement pairs an input-multiplexer setting with averaging
//! parameters and an attached FFT instance. Channels live in a fixed slot
//! table; the slot index is the channel id on the wire. All mutating
//! operations are rejected by the protocol layer while acquisition is
//! active, so the registry itself stays a plain data structure.

use crate::adc::input_mux_from_pos_neg;
use crate::config::MAX_MEASUREMENTS;
use crate::error::{ProtocolResult, ResponseCode};
use crate::fft::FftInstance;
use crate::measure::state::CompleteState;

pub struct Measurement {
    pub input_mux: u8,
    pub enabled: bool,
    pub averaging_count: u16,
    pub averaging_step: u16,
    pub averaging_sum: i64,
    pub fft: FftInstance,
}

impl Measurement {
    fn new(id: u8, input_mux: u8, enabled: bool, averaging_count: u16) -> Self {
        Measurement {
            input_mux,
            enabled,
            averaging_count,
            averaging_step: 0,
            averaging_sum: 0,
            fft: FftInstance::new(id),
        }
    }

    pub fn reset_averaging(&mut self) {
        self.averaging_step = 0;
        self.averaging_sum = 0;
    }
}

pub struct Registry {
    slots: [Option<Measurement>; MAX_MEASUREMENTS],
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Creates a channel in the first free slot and returns its id.
    pub fn create(
        &mut self,
        pos: u8,
        neg: u8,
        enabled: bool,
        averaging: u16,
    ) -> ProtocolResult<u8> {
        let id = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(ResponseCode::TooMuchMeasurements)?;
        self.slots[id] = Some(Measurement::new(
            id as u8,
            input_mux_from_pos_neg(pos, neg),
            enabled,
            averaging,
        ));
        Ok(id as u8)
    }

    /// Deleting an id that does not exist is already the requested outcome.
    pub fn delete(&mut self, id: u8) -> ResponseCode {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = None;
        }
        ResponseCode::Ok
    }

    pub fn get(&self, id: u8) -> Option<&Measurement> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Measurement> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub fn set_inputs(&mut self, id: u8, pos: u8, neg: u8) -> ProtocolResult<()> {
        let m = self.get_mut(id).ok_or(ResponseCode::NoSuchMeasurement)?;
        m.input_mux = input_mux_from_pos_neg(pos, neg);
        Ok(())
    }

    pub fn set_enabled(&mut self, id: u8, enabled: bool) -> ProtocolResult<()> {
        let m = self.get_mut(id).ok_or(ResponseCode::NoSuchMeasurement)?;
        m.enabled = enabled;
        Ok(())
    }

    pub fn set_averaging(&mut self, id: u8, averaging: u16) -> ProtocolResult<()> {
        let m = self.get_mut(id).ok_or(ResponseCode::NoSuchMeasurement)?;
        m.averaging_count = averaging;
        Ok(())
    }

    /// Number of slots, i.e. the highest possible channel count.
    pub fn available_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of existing channels.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn enabled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.as_ref().map(|m| m.enabled).unwrap_or(false))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Measurement)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|m| (i as u8, m)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u8, &mut Measurement)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|m| (i as u8, m)))
    }

    /// Rebuilds the whole table from a persisted state image.
    pub fn restore_from_state(&mut self, state: &CompleteState) {
        for id in 0..MAX_MEASUREMENTS {
            let stored = state.measurements.iter().find(|m| m.id == id as u8);
            self.slots[id] = stored.map(|m| {
                let mut measurement = Measurement::new(
                    id as u8,
                    m.input_multiplexer,
                    m.enabled != 0,
                    m.averaging,
                );
                measurement.input_mux = m.input_multiplexer;
                measurement.fft.set_enabled(m.fft_enabled != 0);
                measurement.fft.set_length(m.fft_length);
                measurement.fft.set_window(m.fft_window_index);
                measurement
            });
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
