//! Streaming real FFT, one instance per measurement channel.
//!
//! Samples are inserted in bit-reversed complex order as they arrive, so no
//! permutation pass is needed at transform time. Each instance owns two big
//! buffers (fill side and calc-and-send side) that swap by pointer when a
//! frame completes, plus a half-length retention buffer that realizes 50 %
//! overlap when a window function is active. The transform and the network
//! handoff run on a single executor thread; a per-instance dirty flag
//! provides backpressure: a frame completing while the previous one is still
//! in flight is dropped, the sample path never waits.
//!
//! Buffer layout of one big buffer:
//! `[alignment pad][7 bytes packet header slack][21 bytes metadata][samples]`
//! The slack lets the streaming engine write the ADCP and WebSocket headers
//! in front of the payload without copying the bins.

pub mod memory;
pub mod tables;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::clock::TickClock;
use crate::config::{DATA_DESCRIPTOR_BUFFER_RESERVED, SEND_TYPE_FFT};
use crate::error::ResponseCode;
use crate::measure::MeasureStateCell;
use crate::stream::descriptor::SendPtr;
use crate::stream::Streamer;

use tables::{bitrev_index, window_sum_squares, window_value};

pub const MAX_FFT_BITS: u8 = 14;
pub const MIN_FFT_BITS: u8 = 3;
pub const MAX_FFT_SIZE: usize = 1 << MAX_FFT_BITS;
pub const MIN_FFT_SIZE: usize = 1 << MIN_FFT_BITS;
pub const FFT_DEFAULT_LENGTH: u16 = 128;

pub const WINDOW_FUNCTIONS: u8 = 3;
pub const RECTANGULAR_WINDOW_INDEX: u8 = 0xFF;

/// Space for the network headers written in front of the payload.
pub const FFT_PACKET_HEADER_SIZE: usize = DATA_DESCRIPTOR_BUFFER_RESERVED;
pub const FFT_METADATA_SIZE: usize = 21;
pub const FFT_HEADER_SIZE: usize = FFT_METADATA_SIZE + FFT_PACKET_HEADER_SIZE;

/// Pad so header plus alignment is a multiple of 32 and the sample region
/// starts cache-aligned.
pub const FFT_HEADER_ALIGNMENT: usize = (32 - (FFT_HEADER_SIZE & 0x1F)) & 0x1F;

/// Data bytes of one sub-packet when a frame spans several packets.
pub const FFT_PACKET_DATA_SPACE: usize = u16::MAX as usize - FFT_HEADER_SIZE;

/// Largest transform whose whole frame fits a copy-mode descriptor (4 KiB of
/// bins).
const MAX_LENGTH_FOR_SINGLE_PACKET: usize = 4096 / std::mem::size_of::<f32>();

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

/// A valid transform length is a power of two in [16, 16384]. The lower
/// bound comes from the real FFT halving: 16 real samples are the smallest
/// frame that still runs a complex stage.
pub fn is_valid_length(length: u16) -> bool {
    let l = length as usize;
    l >= MIN_FFT_SIZE * 2 && l <= MAX_FFT_SIZE && l.is_power_of_two()
}

/// Position of the highest set bit, i.e. log2 for powers of two.
fn bits_for(length: u16) -> u8 {
    (15 - length.leading_zeros()) as u8
}

/// Iterative in-place radix-2 FFT over complex samples already stored in
/// bit-reversed order.
fn fft(samples: &mut [Complex]) {
    let n = samples.len();
    let twiddle = &*tables::TWIDDLE_FACTORS;

    let mut stage_size_half = 1usize;
    let mut stage_size = 2usize;
    while stage_size <= n {
        let tw_delta = tables::TWIDDLE_FACTOR_TABLE_SIZE / stage_size;

        for j in 0..stage_size_half {
            let tw = twiddle[tw_delta * j];

            let mut i = 0;
            while i < n {
                let a = j + i;
                let b = a + stage_size_half;

                let b_re = samples[b].re * tw.re - samples[b].im * tw.im;
                let b_im = samples[b].re * tw.im + samples[b].im * tw.re;

                let a_re = samples[a].re;
                let a_im = samples[a].im;

                samples[a].re = a_re + b_re;
                samples[a].im = a_im + b_im;
                samples[b].re = a_re - b_re;
                samples[b].im = a_im - b_im;

                i += stage_size;
            }
        }

        stage_size_half = stage_size;
        stage_size *= 2;
    }
}

/// In-place real FFT of `samples` (bit-reversed order, length a power of
/// two). The result is the positive half of the spectrum as complex bins;
/// bin 0 carries DC in the real part and the Nyquist bin in the imaginary
/// part.
pub fn real_fft(samples: &mut [f32]) {
    let n = samples.len();
    let n_half = n / 2;

    // The layout of [f32] and [Complex] pairs is identical (#[repr(C)]).
    let s = unsafe {
        std::slice::from_raw_parts_mut(samples.as_mut_ptr() as *mut Complex, n_half)
    };

    fft(s);

    // Unpack the two interleaved real sequences into one spectrum.
    let twiddle = &*tables::TWIDDLE_FACTORS;
    let tw_delta = tables::TWIDDLE_FACTOR_TABLE_SIZE / n;
    for k in 1..n_half / 2 {
        let tw = twiddle[tw_delta * k];
        let k2 = n_half - k;

        let h1_re = 0.5 * (s[k].re + s[k2].re);
        let h1_im = 0.5 * (s[k].im - s[k2].im);
        let h2_re = 0.5 * (s[k].im + s[k2].im);
        let h2_im = -0.5 * (s[k].re - s[k2].re);

        s[k].re = h1_re + (tw.re * h2_re - tw.im * h2_im);
        s[k].im = h1_im + (tw.re * h2_im + tw.im * h2_re);
        s[k2].re = h1_re + (-tw.re * h2_re + tw.im * h2_im);
        s[k2].im = -h1_im + (tw.re * h2_im + tw.im * h2_re);
    }
    let tmp = s[0].re;
    s[0].re += s[0].im;
    s[0].im = tmp - s[0].im;
}

/// State shared between the fill side (sample path) and the executor.
pub struct FftShared {
    id: u8,
    dirty: AtomicBool,
    frame: Mutex<FrameJob>,
}

struct FrameJob {
    calc_raw: Option<SendPtr>,
    length: u16,
    bits: u8,
    window_index: u8,
    frequency_resolution: f32,
    frame_count: u8,
    frame_number: u8,
    bytes_sent: u32,
}

impl FftShared {
    fn new(id: u8) -> Self {
        FftShared {
            id,
            dirty: AtomicBool::new(false),
            frame: Mutex::new(FrameJob {
                calc_raw: None,
                length: 0,
                bits: 0,
                window_index: RECTANGULAR_WINDOW_INDEX,
                frequency_resolution: 0.0,
                frame_count: 0,
                frame_number: 0,
                bytes_sent: 0,
            }),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn set_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

struct FftBuffers {
    raw_fill: SendPtr,
    raw_calc: SendPtr,
    overlap: SendPtr,
}

/// Per-channel FFT descriptor. Owned by its measurement; the fill path runs
/// on the sample thread only.
pub struct FftInstance {
    id: u8,
    enabled: bool,
    length: u16,
    bits: u8,
    window_index: u8,
    fill_step: u16,
    timestamp_first_sample: u64,
    buffers: Option<FftBuffers>,
    shared: Arc<FftShared>,
}

impl FftInstance {
    pub fn new(id: u8) -> Self {
        FftInstance {
            id,
            enabled: false,
            length: FFT_DEFAULT_LENGTH,
            bits: bits_for(FFT_DEFAULT_LENGTH),
            window_index: RECTANGULAR_WINDOW_INDEX,
            fill_step: 0,
            timestamp_first_sample: 0,
            buffers: None,
            shared: Arc::new(FftShared::new(id)),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Fails with `FftInvalidLength` semantics (returns false) unless the
    /// length is a power of two in range. Changing the length invalidates any
    /// assigned buffers.
    pub fn set_length(&mut self, length: u16) -> bool {
        if !is_valid_length(length) {
            return false;
        }
        self.length = length;
        self.bits = bits_for(length);
        self.clear_buffers();
        true
    }

    pub fn window_index(&self) -> u8 {
        self.window_index
    }

    pub fn set_window(&mut self, window_index: u8) -> ResponseCode {
        if window_index != RECTANGULAR_WINDOW_INDEX && window_index >= WINDOW_FUNCTIONS {
            return ResponseCode::FftInvalidWindow;
        }
        self.window_index = window_index;
        ResponseCode::Ok
    }

    /// Two big buffers with header slack each, plus the overlap buffer.
    pub fn needed_buffer_size(&self) -> usize {
        let big = self.big_buffer_size();
        let small = (self.length as usize / 2) * std::mem::size_of::<f32>();
        2 * big + small
    }

    fn big_buffer_size(&self) -> usize {
        self.length as usize * std::mem::size_of::<f32>()
            + FFT_HEADER_ALIGNMENT
            + FFT_HEADER_SIZE
    }

    pub fn assign_raw_buffer(&mut self, region: SendPtr) {
        let big = self.big_buffer_size();
        // Region layout: [fill big buffer][calc big buffer][overlap buffer].
        self.buffers = Some(FftBuffers {
            raw_fill: region,
            raw_calc: SendPtr(unsafe { region.0.add(big) }),
            overlap: SendPtr(unsafe { region.0.add(2 * big) }),
        });
    }

    pub fn clear_buffers(&mut self) {
        self.buffers = None;
        self.shared.frame.lock().calc_raw = None;
    }

    pub fn has_buffers(&self) -> bool {
        self.buffers.is_some()
    }

    /// An instance is ready to take samples when it is disabled (nothing to
    /// do) or has its buffers assigned.
    pub fn ready(&self) -> bool {
        !self.enabled || self.buffers.is_some()
    }

    pub fn shared(&self) -> &Arc<FftShared> {
        &self.shared
    }

    fn reset_fill_step(&self) -> u16 {
        if self.window_index == RECTANGULAR_WINDOW_INDEX {
            0
        } else {
            self.length / 2
        }
    }

    /// Prepares the instance for a fresh acquisition run: resets the fill
    /// cursor and zeroes the retention buffer so the first overlapped frame
    /// starts from silence.
    pub fn prepare(&mut self) {
        self.fill_step = self.reset_fill_step();
        self.shared.set_clean();
        if self.window_index != RECTANGULAR_WINDOW_INDEX {
            if let Some(bufs) = &self.buffers {
                let half = self.length as usize / 2;
                let overlap = unsafe {
                    std::slice::from_raw_parts_mut(bufs.overlap.0 as *mut f32, half)
                };
                overlap.fill(0.0);
            }
        }
    }

    fn fill_samples_ptr(&self) -> *mut f32 {
        let bufs = self.buffers.as_ref().expect("fft buffers not assigned");
        unsafe { bufs.raw_fill.0.add(FFT_HEADER_ALIGNMENT + FFT_HEADER_SIZE) as *mut f32 }
    }

    /// Feeds one sample into the fill buffer. Runs on the sample path and
    /// never blocks: when the previous frame is still dirty, the completed
    /// fill is discarded instead of waiting.
    pub fn push_sample(&mut self, tens_nanovolt: i32, timestamp: u64, executor: &FftExecutor) {
        if !self.enabled || !self.ready() {
            panic!("fft instance {} fed while not ready", self.id);
        }

        if self.fill_step == self.reset_fill_step() {
            self.timestamp_first_sample = timestamp;
        }

        let original_value = tens_nanovolt as f32 / 1_000_000_000.0;
        let windowed_value = if self.window_index == RECTANGULAR_WINDOW_INDEX {
            original_value
        } else {
            window_value(original_value, self.window_index, self.bits, self.fill_step)
        };

        // The fill buffer is interpreted as length/2 complex values; samples
        // land at their bit-reversed slot directly.
        let samples = self.fill_samples_ptr();
        unsafe {
            *samples.add(bitrev_index(self.fill_step, self.bits)) = windowed_value;
        }

        // With a window active the frame overlaps its predecessor by 50 %:
        // while filling the upper half, the lower half is replayed from the
        // retention buffer and the raw value is retained for the next cycle.
        if self.window_index != RECTANGULAR_WINDOW_INDEX {
            let copy_index = self.fill_step - self.length / 2;
            let bufs = self.buffers.as_ref().unwrap();
            unsafe {
                let overlap = bufs.overlap.0 as *mut f32;
                let retained = *overlap.add(copy_index as usize);
                let replay =
                    window_value(retained, self.window_index, self.bits, copy_index);
                *samples.add(bitrev_index(copy_index, self.bits)) = replay;
                *overlap.add(copy_index as usize) = original_value;
            }
        }

        self.fill_step += 1;

        if self.fill_step >= self.length {
            self.complete_frame(timestamp, executor);
        }
    }

    fn complete_frame(&mut self, timestamp: u64, executor: &FftExecutor) {
        // Frequency resolution over the frame: (N-1)/N per tick span, scaled
        // by 100 000 to land in Hz (ticks are 10 us).
        let timediff = timestamp.saturating_sub(self.timestamp_first_sample);
        let frequency_resolution = ((self.length as u64 - 1) * 100_000) as f32
            / (self.length as f32 * timediff as f32);

        let reset = self.reset_fill_step();

        if self.shared.is_dirty() {
            // Previous frame still in calc-or-send. Drop this one.
            self.fill_step = reset;
            return;
        }

        let bufs = self.buffers.as_mut().unwrap();
        std::mem::swap(&mut bufs.raw_fill, &mut bufs.raw_calc);
        self.fill_step = reset;

        {
            let mut frame = self.shared.frame.lock();
            frame.calc_raw = Some(bufs.raw_calc);
            frame.length = self.length;
            frame.bits = self.bits;
            frame.window_index = self.window_index;
            frame.frequency_resolution = frequency_resolution;
            frame.frame_count = 0;
            frame.frame_number = 0;
            frame.bytes_sent = 0;
        }
        self.shared.dirty.store(true, Ordering::Release);
        executor.submit(self.shared.clone());
    }

    #[cfg(test)]
    fn read_fill_slot(&self, index: usize) -> f32 {
        unsafe { *self.fill_samples_ptr().add(index) }
    }

    #[cfg(test)]
    fn read_calc_slot(&self, index: usize) -> f32 {
        let bufs = self.buffers.as_ref().unwrap();
        unsafe {
            *(bufs.raw_calc.0.add(FFT_HEADER_ALIGNMENT + FFT_HEADER_SIZE) as *const f32)
                .add(index)
        }
    }
}

/// Serializes the packet metadata in front of a frame's sample data.
fn write_metadata(
    dst: *mut u8,
    shared: &FftShared,
    frame: &FrameJob,
    timestamp: u64,
) {
    let wss = if frame.window_index == RECTANGULAR_WINDOW_INDEX {
        frame.length as f32
    } else {
        window_sum_squares(frame.window_index, frame.bits)
    };

    let mut buf = [0u8; FFT_METADATA_SIZE];
    buf[0] = shared.id;
    buf[1] = frame.frame_count;
    buf[2] = frame.frame_number;
    buf[3..5].copy_from_slice(&frame.length.to_le_bytes());
    buf[5..13].copy_from_slice(&timestamp.to_le_bytes());
    buf[13..17].copy_from_slice(&frame.frequency_resolution.to_le_bytes());
    buf[17..21].copy_from_slice(&wss.to_le_bytes());
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, FFT_METADATA_SIZE);
    }
}

/// One executor serves all channels: transforms run one at a time, which
/// also guarantees that no two runs for the same channel overlap.
pub struct FftExecutor {
    tx: Mutex<mpsc::Sender<Arc<FftShared>>>,
}

impl FftExecutor {
    pub fn spawn(
        streamer: Arc<Streamer>,
        measure_state: Arc<MeasureStateCell>,
        clock: Arc<TickClock>,
        running: Arc<AtomicBool>,
    ) -> (Arc<FftExecutor>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Arc<FftShared>>();
        let handle = thread::Builder::new()
            .name("fft-executor".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(shared) => {
                            Self::process(&shared, &streamer, &measure_state, &clock)
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("spawn fft executor");
        (Arc::new(FftExecutor { tx: Mutex::new(tx) }), handle)
    }

    /// An executor whose queue is read by the caller. Test use only.
    #[cfg(test)]
    pub(crate) fn detached() -> (FftExecutor, mpsc::Receiver<Arc<FftShared>>) {
        let (tx, rx) = mpsc::channel();
        (FftExecutor { tx: Mutex::new(tx) }, rx)
    }

    pub fn submit(&self, shared: Arc<FftShared>) {
        if self.tx.lock().send(shared).is_err() {
            warn!("fft executor gone, frame dropped");
        }
    }

    fn process(
        shared: &Arc<FftShared>,
        streamer: &Arc<Streamer>,
        measure_state: &Arc<MeasureStateCell>,
        clock: &Arc<TickClock>,
    ) {
        if !measure_state.is_active() {
            shared.set_clean();
            return;
        }

        let (calc_raw, length) = {
            let frame = shared.frame.lock();
            match frame.calc_raw {
                Some(ptr) => (ptr, frame.length as usize),
                None => {
                    shared.set_clean();
                    return;
                }
            }
        };

        // Exclusive access: the fill side will not touch the calc buffer
        // while the dirty flag is set.
        let samples = unsafe {
            std::slice::from_raw_parts_mut(
                calc_raw.0.add(FFT_HEADER_ALIGNMENT + FFT_HEADER_SIZE) as *mut f32,
                length,
            )
        };
        real_fft(samples);

        if !measure_state.is_active() {
            shared.set_clean();
            return;
        }

        if length <= MAX_LENGTH_FOR_SINGLE_PACKET {
            // The whole frame fits one descriptor: write the metadata into
            // the header slack and hand it over in copy mode.
            let payload_len = FFT_METADATA_SIZE + length * std::mem::size_of::<f32>();
            let data = unsafe { calc_raw.0.add(FFT_HEADER_ALIGNMENT + FFT_PACKET_HEADER_SIZE) };
            {
                let mut frame = shared.frame.lock();
                frame.frame_count = 1;
                frame.frame_number = 0;
                write_metadata(data, shared, &frame, clock.ticks());
            }
            let payload = unsafe { std::slice::from_raw_parts(data, payload_len) };
            if !streamer.send_data(SEND_TYPE_FFT, payload) {
                debug!("fft frame for channel {} not enqueued", shared.id);
            }
            shared.set_clean();
        } else {
            // Too big for a descriptor buffer: send the calc buffer itself in
            // sub-packets, chained by the delivery callback.
            {
                let mut frame = shared.frame.lock();
                let data_to_send = length * std::mem::size_of::<f32>();
                let mut frames = (data_to_send / FFT_PACKET_DATA_SPACE) as u8;
                if data_to_send % FFT_PACKET_DATA_SPACE != 0 {
                    frames += 1;
                }
                frame.frame_count = frames;
                frame.frame_number = 0;
                frame.bytes_sent = 0;
            }
            Self::transmit_frame(shared.clone(), streamer.clone(), measure_state.clone(), clock.clone());
        }
    }

    /// Sends the next sub-packet of a multi-packet frame. The metadata for
    /// each sub-packet is written directly in front of its data slice; for
    /// later sub-packets this overwrites sample bytes that have already been
    /// delivered.
    fn transmit_frame(
        shared: Arc<FftShared>,
        streamer: Arc<Streamer>,
        measure_state: Arc<MeasureStateCell>,
        clock: Arc<TickClock>,
    ) {
        let (data, payload_len) = {
            let mut frame = shared.frame.lock();
            let calc_raw = match frame.calc_raw {
                Some(ptr) => ptr,
                None => {
                    shared.set_clean();
                    return;
                }
            };
            let total = frame.length as usize * std::mem::size_of::<f32>();
            let bytes_left = total - frame.bytes_sent as usize;
            let bytes_to_send = bytes_left.min(FFT_PACKET_DATA_SPACE);

            let data = unsafe {
                calc_raw
                    .0
                    .add(frame.bytes_sent as usize + FFT_HEADER_ALIGNMENT + FFT_PACKET_HEADER_SIZE)
            };
            write_metadata(data, &shared, &frame, clock.ticks());
            frame.frame_number += 1;
            frame.bytes_sent += bytes_to_send as u32;
            (data, bytes_to_send + FFT_METADATA_SIZE)
        };

        let cb_shared = shared.clone();
        let cb_streamer = streamer.clone();
        let callback = Box::new(move || {
            Self::frame_transmitted(cb_shared, cb_streamer, measure_state, clock);
        });

        if !streamer.send_data_non_copy(SEND_TYPE_FFT, SendPtr(data), payload_len, callback) {
            // The sub-packet could not be queued; release the channel so the
            // next frame can run.
            shared.set_clean();
        }
    }

    /// Delivery callback of a sub-packet: chain the next one, or mark the
    /// channel clean after the last.
    fn frame_transmitted(
        shared: Arc<FftShared>,
        streamer: Arc<Streamer>,
        measure_state: Arc<MeasureStateCell>,
        clock: Arc<TickClock>,
    ) {
        if !measure_state.is_active() {
            shared.set_clean();
            return;
        }

        let bytes_left = {
            let frame = shared.frame.lock();
            frame.length as usize * std::mem::size_of::<f32>() - frame.bytes_sent as usize
        };
        if bytes_left == 0 {
            shared.set_clean();
        } else {
            Self::transmit_frame(shared, streamer, measure_state, clock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::FftMemory;
    use super::tables::WINDOW_HANN;
    use super::*;

    #[test]
    fn test_valid_lengths() {
        for length in [16u16, 32, 64, 128, 1024, 16384] {
            assert!(is_valid_length(length), "{} should be valid", length);
        }
        for length in [8u16, 12, 100, 32768, 24576] {
            assert!(!is_valid_length(length), "{} should be invalid", length);
        }
    }

    #[test]
    fn test_impulse_spectrum_is_flat() {
        // An impulse at sample 0 (slot 0 survives bit reversal) transforms
        // to (1, 0) in every bin; bin 0 packs DC and Nyquist, both 1.
        for bits in [4u8, 7, 10] {
            let n = 1usize << bits;
            let mut samples = vec![0.0f32; n];
            samples[0] = 1.0;
            real_fft(&mut samples);
            assert!((samples[0] - 1.0).abs() < 1e-4, "dc = {}", samples[0]);
            assert!((samples[1] - 1.0).abs() < 1e-4, "nyquist = {}", samples[1]);
            for pair in samples[2..].chunks_exact(2) {
                assert!((pair[0] - 1.0).abs() < 1e-4, "re = {}", pair[0]);
                assert!(pair[1].abs() < 1e-4, "im = {}", pair[1]);
            }
        }
    }

    #[test]
    fn test_cosine_peaks_at_its_bin() {
        let bits = 8u8;
        let n = 1usize << bits;
        let k = 12usize;
        let mut samples = vec![0.0f32; n];
        for step in 0..n {
            let x = (2.0 * std::f64::consts::PI * k as f64 * step as f64 / n as f64).cos();
            samples[bitrev_index(step as u16, bits)] = x as f32;
        }
        real_fft(&mut samples);

        let tolerance = n as f32 * 1e-4;
        for bin in 1..n / 2 {
            let re = samples[2 * bin];
            let im = samples[2 * bin + 1];
            let magnitude = (re * re + im * im).sqrt();
            if bin == k {
                assert!(
                    (magnitude - n as f32 / 2.0).abs() < 0.01 * n as f32,
                    "peak magnitude {} at bin {}",
                    magnitude,
                    bin
                );
            } else {
                assert!(magnitude < tolerance, "leak {} at bin {}", magnitude, bin);
            }
        }
        // DC (packed in bin 0 real part) is zero for a pure cosine.
        assert!(samples[0].abs() < tolerance);
    }

    fn prepared_instance(length: u16, window: u8, memory: &FftMemory) -> FftInstance {
        let mut fft = FftInstance::new(0);
        fft.set_enabled(true);
        assert!(fft.set_length(length));
        assert_eq!(fft.set_window(window), ResponseCode::Ok);
        assert!(memory.assign([&mut fft].into_iter(), false));
        fft.prepare();
        fft
    }

    #[test]
    fn test_rectangular_fill_completes_after_length_samples() {
        let memory = FftMemory::new(1 << 16);
        let (executor, rx) = FftExecutor::detached();
        let mut fft = prepared_instance(16, RECTANGULAR_WINDOW_INDEX, &memory);

        for step in 0u64..16 {
            fft.push_sample(1_000_000_000, step * 10, &executor);
        }
        let shared = rx.try_recv().expect("frame should be submitted");
        assert!(shared.is_dirty());
        // All slots carry the normalized value 1.0.
        for i in 0..16 {
            assert!((fft.read_calc_slot(i) - 1.0).abs() < 1e-6);
        }
        // Frequency resolution: (L-1)*100000 / (L * span).
        let frame = shared.frame.lock();
        let expected = (15.0 * 100_000.0) / (16.0 * 150.0);
        assert!((frame.frequency_resolution - expected).abs() < 1e-3);
    }

    #[test]
    fn test_dirty_frame_is_dropped_not_blocked() {
        let memory = FftMemory::new(1 << 16);
        let (executor, rx) = FftExecutor::detached();
        let mut fft = prepared_instance(16, RECTANGULAR_WINDOW_INDEX, &memory);

        for step in 0u64..16 {
            fft.push_sample(7, step, &executor);
        }
        assert!(rx.try_recv().is_ok());

        // The first frame is never marked clean; the second completion must
        // drop silently without a second submission.
        for step in 0u64..16 {
            fft.push_sample(9, step, &executor);
        }
        assert!(rx.try_recv().is_err(), "dirty channel must drop the frame");
        assert!(fft.shared().is_dirty());
    }

    #[test]
    fn test_overlap_replays_previous_half_frame() {
        let length = 16u16;
        let half = (length / 2) as usize;
        let memory = FftMemory::new(1 << 16);
        let (executor, rx) = FftExecutor::detached();
        let mut fft = prepared_instance(length, WINDOW_HANN, &memory);

        // First frame: completes after length/2 fresh samples over the
        // zeroed retention buffer.
        for step in 0..half {
            fft.push_sample((step as i32 + 1) * 1000, step as u64, &executor);
        }
        let first = rx.try_recv().expect("first overlapped frame");
        first.set_clean();

        // Second frame: its lower half must be the windowed replay of the
        // previous frame's raw samples.
        for step in 0..half {
            fft.push_sample(900, (half + step) as u64, &executor);
        }
        rx.try_recv().expect("second overlapped frame");

        for step in 0..half {
            let original = ((step as i32 + 1) * 1000) as f32 / 1_000_000_000.0;
            let expected = window_value(original, WINDOW_HANN, fft.bits, step as u16);
            let got = fft.read_calc_slot(bitrev_index(step as u16, fft.bits));
            assert!(
                (got - expected).abs() <= f32::EPSILON * expected.abs().max(1e-9),
                "slot {}: got {} expected {}",
                step,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_metadata_layout() {
        let shared = FftShared::new(3);
        {
            let mut frame = shared.frame.lock();
            frame.length = 128;
            frame.bits = 7;
            frame.window_index = RECTANGULAR_WINDOW_INDEX;
            frame.frequency_resolution = 99.25;
            frame.frame_count = 1;
            frame.frame_number = 0;
        }
        let mut buf = [0u8; FFT_METADATA_SIZE];
        let frame = shared.frame.lock();
        write_metadata(buf.as_mut_ptr(), &shared, &frame, 0x0102030405060708);
        assert_eq!(buf[0], 3);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2], 0);
        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), 128);
        assert_eq!(
            u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            0x0102030405060708
        );
        assert_eq!(
            f32::from_le_bytes(buf[13..17].try_into().unwrap()),
            99.25
        );
        // Rectangular wss falls back to the frame length.
        assert_eq!(f32::from_le_bytes(buf[17..21].try_into().unwrap()), 128.0);
    }
}
