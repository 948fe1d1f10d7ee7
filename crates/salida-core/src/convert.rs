//! Sample format conversion.
//!
//! Conversions are exhaustive over the PCM/float cross product and follow
//! the device path's exact scaling rules:
//!
//! - integer ↔ integer conversions are pure shifts through a high-aligned
//!   32-bit intermediate (24-bit samples are packed little-endian);
//! - integer → float divides the high-aligned value by 2³¹, i.e. scales by
//!   `1 / (INT_MAX + 1)` at the source width;
//! - float → integer scales by `INT16_MAX` for 16-bit targets and by
//!   `INT32_MAX - 127` (f32) or `INT32_MAX` (f64) for 24/32-bit targets,
//!   truncating toward zero. The 127-sample headroom keeps single-precision
//!   rounding from overflowing the target.
//!
//! No clipping happens here; the peak limiter upstream is the guard.
//! Out-of-range float inputs saturate at the integer bounds.

use crate::chunk::Chunk;
use crate::format::SampleFormat;

/// A decoded sample on its way between formats.
///
/// Integer samples travel high-aligned in 32 bits so that narrowing and
/// widening are shifts; floats keep their source precision because the
/// float→integer scale constants differ between f32 and f64 sources.
#[derive(Clone, Copy)]
enum Raw {
    Int(i32),
    F32(f32),
    F64(f64),
}

#[inline]
fn unpack24(raw: &[u8]) -> i32 {
    ((i32::from(raw[2] as i8) << 16) | (i32::from(raw[1]) << 8) | i32::from(raw[0])) << 8
}

#[inline]
fn pack24(value: i32, out: &mut [u8]) {
    out[0] = (value >> 8) as u8;
    out[1] = (value >> 16) as u8;
    out[2] = (value >> 24) as u8;
}

#[inline]
fn decode(format: SampleFormat, raw: &[u8]) -> Raw {
    match format {
        SampleFormat::Pcm8 => Raw::Int(i32::from(raw[0] as i8) << 24),
        SampleFormat::Pcm16 => Raw::Int(i32::from(i16::from_ne_bytes([raw[0], raw[1]])) << 16),
        SampleFormat::Pcm24 => Raw::Int(unpack24(raw)),
        SampleFormat::Pcm32 => Raw::Int(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])),
        SampleFormat::Float32 => Raw::F32(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])),
        SampleFormat::Float64 => Raw::F64(f64::from_ne_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])),
        SampleFormat::Bitstream => unreachable!("bitstream data never enters conversion"),
    }
}

#[inline]
fn encode(format: SampleFormat, value: Raw, out: &mut [u8]) {
    match format {
        SampleFormat::Pcm8 => {
            let sample = match value {
                Raw::Int(high) => (high >> 24) as i8,
                Raw::F32(x) => (x * f32::from(i8::MAX)) as i8,
                Raw::F64(x) => (x * f64::from(i8::MAX)) as i8,
            };
            out[0] = sample as u8;
        }
        SampleFormat::Pcm16 => {
            let sample = match value {
                Raw::Int(high) => (high >> 16) as i16,
                Raw::F32(x) => (x * f32::from(i16::MAX)) as i16,
                Raw::F64(x) => (x * f64::from(i16::MAX)) as i16,
            };
            out[..2].copy_from_slice(&sample.to_ne_bytes());
        }
        SampleFormat::Pcm24 => {
            let wide = match value {
                Raw::Int(high) => high,
                Raw::F32(x) => (x * (i32::MAX - 127) as f32) as i32,
                Raw::F64(x) => (x * f64::from(i32::MAX)) as i32,
            };
            pack24(wide, out);
        }
        SampleFormat::Pcm32 => {
            let sample = match value {
                Raw::Int(high) => high,
                Raw::F32(x) => (x * (i32::MAX - 127) as f32) as i32,
                Raw::F64(x) => (x * f64::from(i32::MAX)) as i32,
            };
            out[..4].copy_from_slice(&sample.to_ne_bytes());
        }
        SampleFormat::Float32 => {
            let sample = match value {
                Raw::Int(high) => high as f32 / 2_147_483_648.0,
                Raw::F32(x) => x,
                Raw::F64(x) => x as f32,
            };
            out[..4].copy_from_slice(&sample.to_ne_bytes());
        }
        SampleFormat::Float64 => {
            let sample = match value {
                Raw::Int(high) => f64::from(high) / 2_147_483_648.0,
                Raw::F32(x) => f64::from(x),
                Raw::F64(x) => x,
            };
            out[..8].copy_from_slice(&sample.to_ne_bytes());
        }
        SampleFormat::Bitstream => unreachable!("bitstream data never enters conversion"),
    }
}

impl Chunk {
    /// Convert the chunk to `format` in place.
    ///
    /// No-op when the chunk is empty or already in `format`.
    ///
    /// # Panics
    ///
    /// Panics if either format is [`SampleFormat::Bitstream`]; bitstream
    /// chunks never participate in DSP.
    pub fn to_format(&mut self, format: SampleFormat) {
        if self.is_empty() || format == self.format() {
            return;
        }
        assert!(self.format().is_pcm() && format.is_pcm());

        let src_format = self.format();
        let src_bytes = src_format.bytes();
        let dst_bytes = format.bytes();

        let mut output = Chunk::new(format, self.channels(), self.frame_count(), self.rate());
        for (src, dst) in self
            .bytes()
            .chunks_exact(src_bytes)
            .zip(output.bytes_mut().chunks_exact_mut(dst_bytes))
        {
            encode(format, decode(src_format, src), dst);
        }

        *self = output;
    }

    /// Convert the chunk to 32-bit float in place.
    pub fn to_float(&mut self) {
        self.to_format(SampleFormat::Float32);
    }
}
