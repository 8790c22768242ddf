//! Sample conversion to packed 24-bit PCM
//!
//! Every captured sample of every recorded channel passes through here, so the
//! per-sample functions are branch-light and never allocate.

use serde::{Deserialize, Serialize};

use crate::capture::{AudioBlock, Samples};

/// Largest 24-bit signed value (2^23 - 1). Also the float scale factor.
pub const I24_MAX: i32 = 8_388_607;
/// Smallest 24-bit signed value.
pub const I24_MIN: i32 = -8_388_608;
/// Bytes per packed sample.
pub const BYTES_PER_SAMPLE: usize = 3;

/// How a scaled float is turned into an integer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    /// Truncate toward zero. Bit-exact with files written by the legacy recorder.
    #[default]
    Truncate,
    /// Round half away from zero.
    Nearest,
}

/// Rounding used when nothing else is configured.
pub const DEFAULT_ROUNDING: Rounding = Rounding::Truncate;

/// Convert a normalized float sample to a 24-bit integer.
///
/// The input is clamped to [-1.0, 1.0] before scaling, so anything beyond
/// full scale lands on the value for ±1.0 instead of wrapping. NaN maps to 0.
#[inline]
pub fn f32_to_i24(sample: f32, rounding: Rounding) -> i32 {
    let scaled = sample.clamp(-1.0, 1.0) * I24_MAX as f32;
    let value = match rounding {
        Rounding::Truncate => scaled as i32,
        Rounding::Nearest => scaled.round() as i32,
    };
    value.clamp(I24_MIN, I24_MAX)
}

/// Clamp an integer that is already scaled to 24 bits.
#[inline]
pub fn i32_to_i24(value: i32) -> i32 {
    value.clamp(I24_MIN, I24_MAX)
}

/// Little-endian two's-complement encoding of a 24-bit value.
#[inline]
pub fn pack_i24_le(value: i32) -> [u8; 3] {
    let bytes = value.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

/// Inverse of [`pack_i24_le`], sign-extending to i32.
#[inline]
pub fn unpack_i24_le(bytes: [u8; 3]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) << 8 >> 8
}

/// Converts interleaved capture blocks into per-channel 24-bit byte runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleConverter {
    rounding: Rounding,
}

impl SampleConverter {
    pub fn new(rounding: Rounding) -> Self {
        Self { rounding }
    }

    /// Append packed samples for a run of floats.
    pub fn convert_f32(&self, samples: &[f32], out: &mut Vec<u8>) {
        out.reserve(samples.len() * BYTES_PER_SAMPLE);
        for &s in samples {
            out.extend_from_slice(&pack_i24_le(f32_to_i24(s, self.rounding)));
        }
    }

    /// Append packed samples for a run of pre-scaled integers.
    pub fn convert_i32(&self, samples: &[i32], out: &mut Vec<u8>) {
        out.reserve(samples.len() * BYTES_PER_SAMPLE);
        for &s in samples {
            out.extend_from_slice(&pack_i24_le(i32_to_i24(s)));
        }
    }

    /// Extract `channel` from an interleaved block and append its packed
    /// samples to `out`. Writes exactly `3 * block.frames()` bytes.
    ///
    /// `channel` must be below `block.channels()`; the session validates this
    /// before capture starts.
    pub fn convert_channel(&self, block: &AudioBlock, channel: usize, out: &mut Vec<u8>) {
        let stride = block.channels();
        out.reserve(block.frames() * BYTES_PER_SAMPLE);
        match block.samples() {
            Samples::F32(data) => {
                for &s in data.iter().skip(channel).step_by(stride) {
                    out.extend_from_slice(&pack_i24_le(f32_to_i24(s, self.rounding)));
                }
            }
            Samples::I32(data) => {
                for &s in data.iter().skip(channel).step_by(stride) {
                    out.extend_from_slice(&pack_i24_le(i32_to_i24(s)));
                }
            }
        }
    }
}
