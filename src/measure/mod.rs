//! Acquisition: the per-sample pipeline and its control operations.
//!
//! The converter's data-ready event drives `Acquisition::on_data_ready`,
//! which rotates the input multiplexer across the enabled channels, applies
//! per-channel averaging, packs timestamped values into the bounded value
//! buffer and feeds enabled FFT instances. This path never blocks on
//! anything a slower task could hold for long: queue operations are
//! non-blocking, locks on this path are only contended by control commands
//! that refuse to run while acquisition is active.
//!
//! Start/stop, one-shot reads and the two calibration commands are the
//! control surface; one-shot and calibration park the calling task on a
//! single-slot rendezvous that the sample path completes.

pub mod measurement;
pub mod state;
pub mod watchdog;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::adc::{AdcDriver, RATE_38400};
use crate::clock::TickClock;
use crate::config::{MAX_MEASUREMENTS, MAX_TIMESTAMP_DELTA, SEND_TYPE_DATA, VALUE_BUFFER_SIZE};
use crate::error::{ProtocolResult, ResponseCode};
use crate::fft::memory::FftMemory;
use crate::fft::FftExecutor;
use crate::measure::measurement::Registry;
use crate::measure::state::StateController;
use crate::measure::watchdog::Watchdog;
use crate::stream::Streamer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeasureState {
    Idle = 0,
    Running = 1,
    Oneshot = 2,
    Calibrating = 3,
}

/// Word-sized acquisition state, readable from any task.
pub struct MeasureStateCell(AtomicU8);

impl MeasureStateCell {
    pub fn new() -> Self {
        MeasureStateCell(AtomicU8::new(MeasureState::Idle as u8))
    }

    pub fn get(&self) -> MeasureState {
        match self.0.load(Ordering::Acquire) {
            1 => MeasureState::Running,
            2 => MeasureState::Oneshot,
            3 => MeasureState::Calibrating,
            _ => MeasureState::Idle,
        }
    }

    pub fn set(&self, state: MeasureState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.get() != MeasureState::Idle
    }
}

impl Default for MeasureStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct ValueRecord {
    id_and_status: u8,
    value: i32,
    delta: u16,
}

/// Bounded accumulator of timestamped samples, flushed as one DATA payload.
struct ValueBuffer {
    time_reference: u64,
    records: Vec<ValueRecord>,
}

impl ValueBuffer {
    fn new() -> Self {
        ValueBuffer {
            time_reference: 0,
            records: Vec::with_capacity(VALUE_BUFFER_SIZE),
        }
    }

    fn reset(&mut self) {
        self.time_reference = 0;
        self.records.clear();
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.records.len() * 7);
        out.extend_from_slice(&self.time_reference.to_le_bytes());
        for r in &self.records {
            out.push(r.id_and_status);
            out.extend_from_slice(&r.value.to_le_bytes());
            out.extend_from_slice(&r.delta.to_le_bytes());
        }
        out
    }
}

/// Single-slot rendezvous between a waiting control task and the sample
/// path. Only one one-shot or calibration can be outstanding; the state
/// machine serializes the callers.
struct Rendezvous {
    slot: Mutex<Option<SyncSender<i32>>>,
}

impl Rendezvous {
    fn new() -> Self {
        Rendezvous {
            slot: Mutex::new(None),
        }
    }

    fn arm(&self) -> Receiver<i32> {
        let (tx, rx) = mpsc::sync_channel(1);
        *self.slot.lock() = Some(tx);
        rx
    }

    fn disarm(&self) {
        *self.slot.lock() = None;
    }

    fn armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wakes the waiter exactly once; subsequent completes are dropped
    /// until the next arm.
    fn complete(&self, value: i32) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.try_send(value);
                true
            }
            None => false,
        }
    }
}

pub struct Acquisition {
    measure_state: Arc<MeasureStateCell>,
    current_index: AtomicUsize,
    value_buffer: Mutex<ValueBuffer>,
    rendezvous: Rendezvous,
    adc: Arc<dyn AdcDriver>,
    registry: Arc<Mutex<Registry>>,
    streamer: Arc<Streamer>,
    state_ctl: Arc<StateController>,
    watchdog: Arc<Watchdog>,
    fft_memory: Arc<FftMemory>,
    fft_executor: Arc<FftExecutor>,
    clock: Arc<TickClock>,
}

impl Acquisition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        measure_state: Arc<MeasureStateCell>,
        adc: Arc<dyn AdcDriver>,
        registry: Arc<Mutex<Registry>>,
        streamer: Arc<Streamer>,
        state_ctl: Arc<StateController>,
        watchdog: Arc<Watchdog>,
        fft_memory: Arc<FftMemory>,
        fft_executor: Arc<FftExecutor>,
        clock: Arc<TickClock>,
    ) -> Self {
        Acquisition {
            measure_state,
            current_index: AtomicUsize::new(0),
            value_buffer: Mutex::new(ValueBuffer::new()),
            rendezvous: Rendezvous::new(),
            adc,
            registry,
            streamer,
            state_ctl,
            watchdog,
            fft_memory,
            fft_executor,
            clock,
        }
    }

    pub fn state(&self) -> MeasureState {
        self.measure_state.get()
    }

    pub fn is_active(&self) -> bool {
        self.measure_state.is_active()
    }

    pub fn state_cell(&self) -> &Arc<MeasureStateCell> {
        &self.measure_state
    }

    /// The data-ready handler. Runs on the sampler task for every
    /// conversion the converter completes.
    pub fn on_data_ready(&self) {
        // Take the time reference first, before any processing skews it.
        let now = self.clock.ticks();

        let state = self.measure_state.get();
        // A conversion with nobody interested in it is a false alarm.
        if state == MeasureState::Idle
            || ((state == MeasureState::Calibrating || state == MeasureState::Oneshot)
                && !self.rendezvous.armed())
        {
            return;
        }

        if state == MeasureState::Calibrating {
            // The conversion marks the calibration command as finished; the
            // value itself is read from the calibration registers.
            self.rendezvous.complete(0);
            return;
        }

        let mut sample = self.adc.read_sample();
        if sample.checksum_error && self.adc.samplerate() != RATE_38400 {
            // One retry; at the top rate there is no time for a second read.
            sample = self.adc.read_sample();
        }

        self.watchdog.reset();

        if sample.status.reset() {
            // The converter rebooted underneath us; its configuration is
            // gone. Stop and tell everyone.
            self.state_ctl.set_adc_reset_flag();
            self.stop();
            self.state_ctl.update_adc_state(true);
            return;
        }

        let mut registry = self.registry.lock();
        let index = self.current_index.load(Ordering::Acquire);
        let current = match registry.get_mut(index as u8) {
            Some(m) => m,
            None => panic!("sample arrived with no measurement at cursor {}", index),
        };

        // Averaging: accumulate until the configured count is reached, then
        // emit the rounded mean.
        let mut value = sample.tens_nanovolt;
        let mut emit = true;
        if current.averaging_count > 0 {
            current.averaging_sum += value as i64;
            current.averaging_step += 1;
            if current.averaging_step < current.averaging_count {
                emit = false;
            } else {
                value = ((current.averaging_sum as f32 + 0.5) / current.averaging_count as f32)
                    as i32;
                current.reset_averaging();
            }
        }

        if state == MeasureState::Oneshot {
            if emit {
                self.rendezvous.complete(value);
            }
            return;
        }

        // Continuous measurement.
        if emit {
            let mut vb = self.value_buffer.lock();
            if vb.time_reference == 0 {
                vb.time_reference = now;
            }

            let mut delta = now - vb.time_reference;
            if delta > MAX_TIMESTAMP_DELTA {
                // The u16 delta would overflow; ship the buffer first.
                if !self.send_value_buffer(&mut vb) {
                    return;
                }
                vb.time_reference = now;
                delta = 0;
            }

            vb.records.push(ValueRecord {
                id_and_status: (index as u8 & 0x07) | sample.status.status_bits(),
                value,
                delta: delta as u16,
            });

            if vb.records.len() >= VALUE_BUFFER_SIZE && !self.send_value_buffer(&mut vb) {
                return;
            }
            drop(vb);

            if current.fft.enabled() {
                current.fft.push_sample(value, now, &self.fft_executor);
            }
        }

        // Rotate to the next enabled channel. Programming the mux restarts
        // the conversion, so leave it alone when nothing changes.
        let mut next_index = index;
        for step in 1..=registry.available_count() {
            let candidate = (index + step) % MAX_MEASUREMENTS;
            if let Some(m) = registry.get(candidate as u8) {
                if m.enabled {
                    next_index = candidate;
                    break;
                }
            }
        }
        if next_index != index {
            let mux = registry.get(next_index as u8).unwrap().input_mux;
            self.adc.set_input_mux(mux);
            self.current_index.store(next_index, Ordering::Release);
        }
    }

    /// Ships the buffer as one DATA payload and resets it. Failure here
    /// means the streaming engine is overloaded; its overload reaction has
    /// already stopped acquisition.
    fn send_value_buffer(&self, vb: &mut ValueBuffer) -> bool {
        let payload = vb.encode();
        let ok = self.streamer.send_data(SEND_TYPE_DATA, &payload);
        vb.reset();
        ok
    }

    /// Starts continuous acquisition over all enabled channels.
    pub fn start(&self) -> ResponseCode {
        if self.is_active() {
            return ResponseCode::MeasurementActive;
        }

        let mut registry = self.registry.lock();

        if registry.active_count() == 0 {
            return ResponseCode::NoMeasurements;
        }

        let mut first_index = None;
        let mut enabled = 0usize;
        for (id, m) in registry.iter_mut() {
            m.reset_averaging();
            if m.enabled {
                first_index = Some(id as usize);
                enabled += 1;
            }
        }
        if enabled == 0 {
            return ResponseCode::NoEnabledMeasurement;
        }

        // Hand every existing instance its scratch region; an enabled FFT
        // that does not fit aborts the start.
        let instances = registry.iter_mut().map(|(_, m)| &mut m.fft);
        if !self.fft_memory.assign(instances, false) {
            return ResponseCode::FftNoMemory;
        }

        self.state_ctl.clear_slow_connection_flag();
        for (_, m) in registry.iter_mut() {
            m.fft.prepare();
        }

        self.watchdog.start(self.adc.samplerate());

        let start_index = first_index.unwrap();
        self.current_index.store(start_index, Ordering::Release);
        self.adc
            .set_input_mux(registry.get(start_index as u8).unwrap().input_mux);

        self.value_buffer.lock().reset();
        self.measure_state.set(MeasureState::Running);
        self.adc.set_continuous_mode();
        self.adc.start();

        info!("acquisition started over {} enabled channels", enabled);
        ResponseCode::Ok
    }

    /// Stops acquisition and flushes what the value buffer still holds.
    pub fn stop(&self) -> ResponseCode {
        let was_active = self.is_active();
        self.measure_state.set(MeasureState::Idle);
        self.adc.stop();
        self.watchdog.stop();

        // try_lock: the overload reaction reaches here from inside the
        // sample path, which already holds the buffer.
        if let Some(mut vb) = self.value_buffer.try_lock() {
            if vb.records.len() > 1 && was_active {
                // The sampler may have been mid-record when the state
                // flipped; drop the last record rather than ship a torn one.
                vb.records.pop();
                self.send_value_buffer(&mut vb);
            }
        }

        ResponseCode::Ok
    }

    /// Synchronous single measurement of one channel.
    pub fn oneshot(&self, id: u8) -> ProtocolResult<i32> {
        if self.measure_state.get() != MeasureState::Idle {
            return Err(ResponseCode::MeasurementActive);
        }

        let (mux, averaging) = {
            let mut registry = self.registry.lock();
            let m = registry
                .get_mut(id)
                .ok_or(ResponseCode::NoSuchMeasurement)?;
            m.reset_averaging();
            (m.input_mux, m.averaging_count)
        };

        self.current_index.store(id as usize, Ordering::Release);
        self.state_ctl.clear_slow_connection_flag();
        self.adc.set_input_mux(mux);
        self.measure_state.set(MeasureState::Oneshot);

        // Publish the state now; this task sleeps once the converter runs.
        self.state_ctl.update_adc_state(true);

        // Averaging over N samples needs roughly N seconds at the slowest
        // rates; three seconds is the floor.
        let timeout = Duration::from_secs(u64::from(averaging).max(3));

        self.adc.set_continuous_mode();
        let waiter = self.rendezvous.arm();
        self.adc.start();

        let result = waiter.recv_timeout(timeout);
        self.adc.stop();
        self.rendezvous.disarm();
        self.measure_state.set(MeasureState::Idle);

        match result {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(ResponseCode::CalibrationTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("oneshot rendezvous dropped");
                Err(ResponseCode::CalibrationTimeout)
            }
        }
    }

    pub fn do_offset_calibration(&self, pos: u8, neg: u8) -> ProtocolResult<i32> {
        self.do_calibration(pos, neg, true)?;
        Ok(self.adc.calibration_offset())
    }

    pub fn do_scale_calibration(&self, pos: u8, neg: u8) -> ProtocolResult<u32> {
        self.do_calibration(pos, neg, false)?;
        Ok(self.adc.calibration_scale())
    }

    fn do_calibration(&self, pos: u8, neg: u8, offset: bool) -> ProtocolResult<()> {
        if self.measure_state.get() != MeasureState::Idle {
            return Err(ResponseCode::MeasurementActive);
        }

        self.adc
            .set_input_mux(crate::adc::input_mux_from_pos_neg(pos, neg));
        self.state_ctl.clear_slow_connection_flag();
        self.measure_state.set(MeasureState::Calibrating);
        self.state_ctl.update_adc_state(true);

        self.adc.set_continuous_mode();
        self.adc.start();
        if offset {
            self.adc.send_offset_calibration_command();
        } else {
            self.adc.send_scale_calibration_command();
        }
        // Arm only after the command went out: at high data rates a
        // conversion can complete in between and would end the wait before
        // the calibration even ran.
        let waiter = self.rendezvous.arm();

        let result = waiter.recv_timeout(Duration::from_secs(10));
        self.adc.stop();
        self.rendezvous.disarm();
        self.measure_state.set(MeasureState::Idle);

        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(ResponseCode::CalibrationTimeout),
        }
    }
}

/// Drives `on_data_ready` from the converter's data-ready event.
pub fn spawn_sampler(
    acquisition: Arc<Acquisition>,
    adc: Arc<dyn AdcDriver>,
    running: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sampler".into())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                if adc.wait_data_ready(Duration::from_millis(100)) {
                    acquisition.on_data_ready();
                }
            }
        })
        .expect("spawn sampler")
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adc::sim::SimAdc;
    use crate::adc::{AdcSample, AdcStatus};
    use crate::config::SEND_TYPE_STATUS;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;

    /// Minimal unique temp dir, removed on drop.
    pub(crate) struct TempDir(PathBuf);

    impl TempDir {
        pub fn new(tag: &str) -> TempDir {
            let mut path = std::env::temp_dir();
            path.push(format!(
                "nanovolt-{}-{}-{}",
                tag,
                std::process::id(),
                std::thread::current().name().unwrap_or("t").replace("::", "-")
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        pub fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    pub(crate) struct Rig {
        pub adc: Arc<SimAdc>,
        pub registry: Arc<Mutex<Registry>>,
        pub streamer: Arc<Streamer>,
        pub state_ctl: Arc<StateController>,
        pub acquisition: Arc<Acquisition>,
        pub clock: Arc<TickClock>,
        pub running: Arc<AtomicBool>,
        _dir: TempDir,
    }

    /// Wires a full acquisition stack around a simulated converter, without
    /// any network parts.
    pub(crate) fn rig_with_adc(tag: &str, adc: Arc<SimAdc>) -> Rig {
        let dir = TempDir::new(tag);
        let adc_dyn: Arc<dyn AdcDriver> = adc.clone();
        let clock = Arc::new(TickClock::manual());
        let registry = Arc::new(Mutex::new(Registry::new()));
        let streamer = Arc::new(Streamer::new());
        let measure_state = Arc::new(MeasureStateCell::new());
        let state_ctl = Arc::new(StateController::new(
            dir.path(),
            adc_dyn.clone(),
            registry.clone(),
            measure_state.clone(),
            streamer.clone(),
        ));
        let running = Arc::new(AtomicBool::new(true));
        let (executor, _handle) = FftExecutor::spawn(
            streamer.clone(),
            measure_state.clone(),
            clock.clone(),
            running.clone(),
        );
        let acquisition = Arc::new(Acquisition::new(
            measure_state,
            adc_dyn,
            registry.clone(),
            streamer.clone(),
            state_ctl.clone(),
            Arc::new(Watchdog::new()),
            Arc::new(FftMemory::default()),
            executor,
            clock.clone(),
        ));

        let hook_acq = acquisition.clone();
        let hook_state = state_ctl.clone();
        streamer.set_overload_hook(Box::new(move || {
            if hook_acq.is_active() {
                hook_acq.stop();
            }
            hook_state.set_slow_connection_flag();
        }));

        Rig {
            adc,
            registry,
            streamer,
            state_ctl,
            acquisition,
            clock,
            running,
            _dir: dir,
        }
    }

    pub(crate) fn rig(tag: &str) -> Rig {
        rig_with_adc(tag, Arc::new(SimAdc::new()))
    }

    #[test]
    fn test_start_requires_channels() {
        let rig = rig("start-requires");
        assert_eq!(rig.acquisition.start(), ResponseCode::NoMeasurements);

        rig.registry.lock().create(1, 2, false, 0).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::NoEnabledMeasurement);

        rig.registry.lock().set_enabled(0, true).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);
        assert!(rig.acquisition.is_active());
        rig.acquisition.stop();
        assert!(!rig.acquisition.is_active());
    }

    #[test]
    fn test_full_value_buffer_flushes_one_data_payload() {
        let rig = rig("emit");
        rig.registry.lock().create(1, 2, true, 0).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);

        for _ in 0..VALUE_BUFFER_SIZE {
            rig.clock.advance(10);
            rig.acquisition.on_data_ready();
        }

        assert_eq!(rig.streamer.queue_depth(SEND_TYPE_DATA), 1);
        rig.acquisition.stop();
    }

    #[test]
    fn test_delta_overflow_forces_flush() {
        let rig = rig("delta");
        rig.registry.lock().create(1, 2, true, 0).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);

        rig.clock.advance(5);
        rig.acquisition.on_data_ready();
        // Jump past the span a u16 tick delta can express.
        rig.clock.advance(MAX_TIMESTAMP_DELTA + 1);
        rig.acquisition.on_data_ready();

        assert_eq!(
            rig.streamer.queue_depth(SEND_TYPE_DATA),
            1,
            "overflowing delta must flush the previous records"
        );
        rig.acquisition.stop();
    }

    #[test]
    fn test_averaging_emits_every_nth_sample() {
        let adc = Arc::new(SimAdc::with_value_fn(Box::new(|_, _| 10)));
        let rig = rig_with_adc("avg", adc);
        rig.registry.lock().create(1, 2, true, 4).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);

        for _ in 0..8 {
            rig.clock.advance(1);
            rig.acquisition.on_data_ready();
        }
        // 8 samples with averaging count 4 emit exactly 2 records.
        {
            let vb = rig.acquisition.value_buffer.lock();
            assert_eq!(vb.records.len(), 2);
            assert_eq!(vb.records[0].value, 10, "mean of constant 10 is 10");
        }

        // Stop drops the possibly-torn last record and flushes the rest.
        rig.acquisition.stop();
        assert_eq!(rig.streamer.queue_depth(SEND_TYPE_DATA), 1);
    }

    #[test]
    fn test_adc_reset_stops_acquisition_and_broadcasts() {
        let rig = rig("reset");
        rig.registry.lock().create(1, 2, true, 0).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);

        rig.adc.inject(AdcSample {
            tens_nanovolt: 0,
            status: AdcStatus(AdcStatus::RESET),
            checksum_error: false,
        });
        rig.clock.advance(1);
        rig.acquisition.on_data_ready();

        assert!(!rig.acquisition.is_active());
        assert!(rig.state_ctl.is_adc_reset_set());
        assert!(rig.streamer.queue_depth(SEND_TYPE_STATUS) >= 1);
    }

    #[test]
    fn test_round_robin_skips_disabled_channels() {
        let rig = rig("rotate");
        {
            let mut registry = rig.registry.lock();
            registry.create(1, 2, true, 0).unwrap(); // id 0
            registry.create(3, 4, false, 0).unwrap(); // id 1, disabled
            registry.create(5, 6, true, 0).unwrap(); // id 2
        }
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);
        // The start cursor lands on the last enabled channel.
        assert_eq!(rig.acquisition.current_index.load(Ordering::Acquire), 2);

        rig.clock.advance(1);
        rig.acquisition.on_data_ready();
        assert_eq!(rig.acquisition.current_index.load(Ordering::Acquire), 0);

        rig.clock.advance(1);
        rig.acquisition.on_data_ready();
        assert_eq!(
            rig.acquisition.current_index.load(Ordering::Acquire),
            2,
            "disabled channel 1 is skipped"
        );
        rig.acquisition.stop();
    }

    #[test]
    fn test_descriptor_exhaustion_stops_acquisition_cleanly() {
        let rig = rig("overload");
        rig.registry.lock().create(1, 2, true, 0).unwrap();
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);

        // No sender fiber is draining; drive samples until the DATA queue
        // overflows. The overload reaction must stop acquisition, raise the
        // slow-connection flag and flush every queue.
        let mut iterations = 0usize;
        while rig.acquisition.is_active() {
            rig.clock.advance(10);
            rig.acquisition.on_data_ready();
            iterations += 1;
            assert!(
                iterations < 200 * VALUE_BUFFER_SIZE,
                "overload reaction never fired"
            );
        }

        assert!(rig.state_ctl.is_slow_connection_set());
        assert_eq!(rig.streamer.descriptor_pool_used(), 0, "queues flushed");

        // The next start succeeds cleanly.
        assert_eq!(rig.acquisition.start(), ResponseCode::Ok);
        rig.acquisition.stop();
    }

    #[test]
    fn test_oneshot_returns_value_via_rendezvous() {
        let adc = Arc::new(SimAdc::with_value_fn(Box::new(|_, _| 777)));
        let rig = rig_with_adc("oneshot", adc.clone());
        rig.registry.lock().create(1, 2, true, 0).unwrap();

        let sampler = spawn_sampler(
            rig.acquisition.clone(),
            adc,
            rig.running.clone(),
        );

        let value = rig.acquisition.oneshot(0).unwrap();
        assert_eq!(value, 777);
        assert!(!rig.acquisition.is_active());

        assert_eq!(
            rig.acquisition.oneshot(9),
            Err(ResponseCode::NoSuchMeasurement)
        );

        rig.running.store(false, Ordering::Release);
        sampler.join().unwrap();
    }

    #[test]
    fn test_offset_calibration_reads_back_register() {
        let rig = rig("calibration");
        let sampler = spawn_sampler(
            rig.acquisition.clone(),
            rig.adc.clone(),
            rig.running.clone(),
        );

        let offset = rig.acquisition.do_offset_calibration(1, 2).unwrap();
        assert_eq!(offset, 42, "simulated self-calibration result");
        assert!(!rig.acquisition.is_active());

        rig.running.store(false, Ordering::Release);
        sampler.join().unwrap();
    }
}
