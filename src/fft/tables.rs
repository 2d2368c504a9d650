//! Lookup tables for the streaming real FFT.
//!
//! Twiddle factors, per-length bit-reversal permutations and the window
//! function tables are built once on first use. The window tables cover the
//! largest supported transform at full resolution; smaller transforms index
//! them with a right-shifted step.

use lazy_static::lazy_static;

use super::{Complex, MAX_FFT_BITS, RECTANGULAR_WINDOW_INDEX, WINDOW_FUNCTIONS};

/// One full turn of e^(-2*pi*j*k/SIZE) at the resolution of the largest
/// transform.
pub const TWIDDLE_FACTOR_TABLE_SIZE: usize = 1 << MAX_FFT_BITS;

/// The window tables hold one extra bit of resolution over the largest
/// transform; only the first half of each window is stored (symmetry).
pub const WINDOW_FUNCTION_TABLE_BITS: u8 = MAX_FFT_BITS + 1;
pub const WINDOW_FUNCTION_TABLE_SIZE: usize = 1 << WINDOW_FUNCTION_TABLE_BITS;

pub const WINDOW_HANN: u8 = 0;
pub const WINDOW_HAMMING: u8 = 1;
pub const WINDOW_BLACKMAN: u8 = 2;

lazy_static! {
    /// twiddle[k] = e^(-2*pi*j*k / TWIDDLE_FACTOR_TABLE_SIZE)
    pub static ref TWIDDLE_FACTORS: Vec<Complex> = {
        (0..TWIDDLE_FACTOR_TABLE_SIZE)
            .map(|k| {
                let angle =
                    -2.0 * std::f64::consts::PI * k as f64 / TWIDDLE_FACTOR_TABLE_SIZE as f64;
                Complex {
                    re: angle.cos() as f32,
                    im: angle.sin() as f32,
                }
            })
            .collect()
    };

    /// BIT_REV_TABLES[w][i] reverses the w low bits of i, for w up to the
    /// complex width of the largest transform.
    static ref BIT_REV_TABLES: Vec<Vec<u16>> = {
        (0..MAX_FFT_BITS as usize)
            .map(|w| {
                (0u16..(1 << w))
                    .map(|i| if w == 0 { 0 } else { i.reverse_bits() >> (16 - w) })
                    .collect()
            })
            .collect()
    };

    /// First half of each window function, sampled over
    /// WINDOW_FUNCTION_TABLE_SIZE points.
    static ref WINDOWS: Vec<Vec<f32>> = {
        let m = WINDOW_FUNCTION_TABLE_SIZE as f64;
        let half = WINDOW_FUNCTION_TABLE_SIZE / 2;
        let tau = 2.0 * std::f64::consts::PI;
        (0..WINDOW_FUNCTIONS)
            .map(|window| {
                (0..half)
                    .map(|i| {
                        let x = tau * i as f64 / (m - 1.0);
                        let w = match window {
                            WINDOW_HANN => 0.5 - 0.5 * x.cos(),
                            WINDOW_HAMMING => 0.54 - 0.46 * x.cos(),
                            _ => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                        };
                        w as f32
                    })
                    .collect()
            })
            .collect()
    };

    /// Sum of squared window coefficients per (window, transform bits),
    /// reported in the FFT packet metadata for amplitude correction.
    static ref WINDOW_SUM_SQUARES: Vec<[f32; MAX_FFT_BITS as usize + 1]> = {
        (0..WINDOW_FUNCTIONS)
            .map(|window| {
                let mut per_bits = [0.0f32; MAX_FFT_BITS as usize + 1];
                for (bits, slot) in per_bits.iter_mut().enumerate().skip(1) {
                    let length = 1usize << bits;
                    *slot = (0..length)
                        .map(|step| {
                            let w = window_value(1.0, window, bits as u8, step as u16);
                            w * w
                        })
                        .sum();
                }
                per_bits
            })
            .collect()
    };
}

/// Applies the window function to a value at the given fill step. The step
/// ranges over 0..2^bits; the table index is mirrored at the center and
/// scaled up to the table resolution. Must not be called with the
/// rectangular pseudo-window.
pub fn window_value(value: f32, window_index: u8, bits: u8, step: u16) -> f32 {
    debug_assert_ne!(window_index, RECTANGULAR_WINDOW_INDEX);
    let window = &WINDOWS[window_index as usize];

    let mut entry = step as usize;
    let half_length = 1usize << (bits - 1);
    if entry >= half_length {
        entry = (1usize << bits) - entry - 1;
    }
    entry <<= (WINDOW_FUNCTION_TABLE_BITS - bits) as usize;
    value * window[entry]
}

/// Sum of squared coefficients of a window at transform length 2^bits.
pub fn window_sum_squares(window_index: u8, bits: u8) -> f32 {
    WINDOW_SUM_SQUARES[window_index as usize][bits as usize]
}

/// Maps a fill step to its slot in the fill buffer. The buffer is treated as
/// 2^(bits-1) complex values, so the reversal applies to the complex index
/// step/2 while the real/imag lane bit stays in place.
pub fn bitrev_index(step: u16, bits: u8) -> usize {
    let i = (step >> 1) as usize;
    let lane = (step & 1) as usize;
    BIT_REV_TABLES[(bits - 1) as usize][i] as usize * 2 + lane
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reverse_bits_manual(value: usize, width: u8) -> usize {
        let mut out = 0;
        for bit in 0..width {
            if value & (1 << bit) != 0 {
                out |= 1 << (width - 1 - bit);
            }
        }
        out
    }

    #[test]
    fn test_bitrev_insertion_index() {
        // For every supported length and step, the insertion index must be
        // bitrev(step/2) over bits-1 bits, times two, plus the lane bit.
        for bits in 4..=14u8 {
            let length = 1usize << bits;
            for step in 0..length {
                let expected = reverse_bits_manual(step >> 1, bits - 1) * 2 + (step & 1);
                assert_eq!(
                    bitrev_index(step as u16, bits),
                    expected,
                    "bits={} step={}",
                    bits,
                    step
                );
            }
        }
    }

    #[test]
    fn test_twiddle_factors_unit_circle() {
        let quarter = TWIDDLE_FACTOR_TABLE_SIZE / 4;
        assert!((TWIDDLE_FACTORS[0].re - 1.0).abs() < 1e-6);
        assert!(TWIDDLE_FACTORS[0].im.abs() < 1e-6);
        assert!(TWIDDLE_FACTORS[quarter].re.abs() < 1e-6);
        assert!((TWIDDLE_FACTORS[quarter].im + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_symmetry() {
        for window in 0..WINDOW_FUNCTIONS {
            for bits in [4u8, 10, 14] {
                let length = 1u16 << bits;
                for step in [0u16, 1, length / 4] {
                    let a = window_value(1.0, window, bits, step);
                    let b = window_value(1.0, window, bits, length - 1 - step);
                    assert!(
                        (a - b).abs() < 1e-6,
                        "window {} not symmetric at bits={} step={}",
                        window,
                        bits,
                        step
                    );
                }
            }
        }
    }

    #[test]
    fn test_window_sum_squares_close_to_analytic() {
        // For a Hann window the sum of squares approaches 3/8 * N.
        let bits = 12u8;
        let n = (1u32 << bits) as f32;
        let wss = window_sum_squares(WINDOW_HANN, bits);
        assert!((wss / n - 0.375).abs() < 0.01, "hann wss/N = {}", wss / n);
    }
}
