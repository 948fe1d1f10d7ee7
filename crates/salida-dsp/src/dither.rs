//! Dither for 16-bit output.
//!
//! Active only when the device consumes 16-bit PCM and the pipeline carries
//! higher precision. Rectangular dither in `[-0.5, 0.5]` plus a
//! second-order error-feedback shaper: per channel the two previous
//! quantization errors are fed back as `0.5 * e1 - e2`, pushing the noise
//! floor out of the midband. Output rounding is ties-to-even.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use salida_core::{Chunk, SampleFormat};

use crate::stage::{Stage, StageParams};

/// Error-feedback state is kept for at most this many channels.
const MAX_CHANNELS: usize = 18;

/// The dither stage.
pub struct Dither {
    active: bool,
    error1: [f32; MAX_CHANNELS],
    error2: [f32; MAX_CHANNELS],
    rng: SmallRng,
}

impl Default for Dither {
    fn default() -> Dither {
        Dither {
            active: false,
            error1: [0.0; MAX_CHANNELS],
            error2: [0.0; MAX_CHANNELS],
            rng: SmallRng::from_entropy(),
        }
    }
}

impl Dither {
    /// An uninitialized (inactive) dither stage.
    pub fn new() -> Dither {
        Dither::default()
    }

    /// Activate when the device format is 16-bit PCM.
    pub fn initialize(&mut self, device_format: SampleFormat) {
        self.active = device_format == SampleFormat::Pcm16;
        self.error1 = [0.0; MAX_CHANNELS];
        self.error2 = [0.0; MAX_CHANNELS];
    }
}

impl Stage for Dither {
    fn name(&self) -> &'static str {
        "dither"
    }

    fn active(&self) -> bool {
        self.active
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        // 16-bit input has nothing to gain from re-dithering.
        if !self.active || chunk.is_empty() || chunk.sample_bytes() <= SampleFormat::Pcm16.bytes()
        {
            return;
        }

        chunk.to_float();

        let channels = chunk.channels() as usize;
        let frames = chunk.frame_count();
        let mut output = Chunk::new(SampleFormat::Pcm16, chunk.channels(), frames, chunk.rate());
        {
            let input = chunk.samples_f32();
            let out_bytes = output.bytes_mut();
            for frame in 0..frames {
                for channel in 0..channels {
                    let feedback = channel.min(MAX_CHANNELS - 1);
                    let sample = input[frame * channels + channel] * (i16::MAX - 4) as f32;
                    let noise = (self.rng.r#gen::<f32>() - 0.5) + 0.5 * self.error1[feedback]
                        - self.error2[feedback];
                    let quantized = (sample + noise).round_ties_even();
                    self.error2[feedback] = self.error1[feedback];
                    self.error1[feedback] = quantized - sample;

                    let index = (frame * channels + channel) * 2;
                    out_bytes[index..index + 2]
                        .copy_from_slice(&(quantized as i16).to_ne_bytes());
                }
            }
        }

        *chunk = output;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_i16(chunk: &Chunk) -> Vec<i16> {
        chunk
            .bytes()
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_inactive_for_wide_output() {
        let mut dither = Dither::new();
        dither.initialize(SampleFormat::Pcm24);
        assert!(!dither.active());
    }

    #[test]
    fn test_converts_float_to_pcm16() {
        let mut dither = Dither::new();
        dither.initialize(SampleFormat::Pcm16);

        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 256, 48_000);
        chunk.samples_f32_mut().fill(0.5);
        dither.process(&mut chunk, &StageParams::default());

        assert_eq!(chunk.format(), SampleFormat::Pcm16);
        let expected = f32::from(i16::MAX - 4) * 0.5;
        for sample in read_i16(&chunk) {
            // Quantized value stays within the dither + shaper excursion.
            assert!(
                (f32::from(sample) - expected).abs() <= 3.0,
                "sample {sample}, expected ~{expected}"
            );
        }
    }

    #[test]
    fn test_pcm16_input_untouched() {
        let mut dither = Dither::new();
        dither.initialize(SampleFormat::Pcm16);

        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 16, 48_000);
        chunk.bytes_mut()[0] = 0x42;
        dither.process(&mut chunk, &StageParams::default());
        assert_eq!(chunk.format(), SampleFormat::Pcm16);
        assert_eq!(chunk.bytes()[0], 0x42);
    }

    #[test]
    fn test_silence_dithers_to_near_zero() {
        let mut dither = Dither::new();
        dither.initialize(SampleFormat::Pcm16);

        let mut chunk = Chunk::new(SampleFormat::Float32, 1, 1024, 48_000);
        dither.process(&mut chunk, &StageParams::default());
        for sample in read_i16(&chunk) {
            assert!(sample.abs() <= 2, "silence dithered to {sample}");
        }
    }
}
