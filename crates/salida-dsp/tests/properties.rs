//! Property-based tests for the DSP pipeline.
//!
//! Verifies the pipeline-wide invariants: pass-through configurations
//! conserve frames byte-for-byte, the limiter bound holds for arbitrary
//! input, and the channel matrix preserves gain structure.

use proptest::prelude::*;
use salida_core::{ChannelMask, Chunk, SampleFormat};
use salida_dsp::{
    Balance, ChannelMatrix, Crossfeed, Dither, PeakLimiter, RateConverter, Stage, StageParams,
    TempoStretch, Volume,
};

/// A full pipeline configured as a pass-through: stereo in, stereo out,
/// equal rates, unity parameters, exclusive mode.
fn passthrough_pipeline(rate: u32) -> Vec<Box<dyn Stage>> {
    let mut matrix = ChannelMatrix::new();
    matrix.initialize(2, ChannelMask::STEREO, 2, ChannelMask::STEREO);
    let mut rate_conv = RateConverter::new();
    rate_conv.initialize(false, rate, rate, 2).unwrap();
    let mut tempo = TempoStretch::new();
    tempo.initialize(1.0, rate, 2);
    let mut crossfeed = Crossfeed::new();
    crossfeed.initialize(false, 700, 60, rate, 2, ChannelMask::STEREO);
    let mut limiter = PeakLimiter::new();
    limiter.initialize(rate, true, false);
    let mut dither = Dither::new();
    dither.initialize(SampleFormat::Pcm16);

    vec![
        Box::new(matrix),
        Box::new(rate_conv),
        Box::new(tempo),
        Box::new(crossfeed),
        Box::new(Volume::new()),
        Box::new(Balance::new()),
        Box::new(limiter),
        Box::new(dither),
    ]
}

fn pcm16_chunk(samples: &[i16], channels: u32, rate: u32) -> Chunk {
    let frames = samples.len() / channels as usize;
    let mut chunk = Chunk::new(SampleFormat::Pcm16, channels, frames, rate);
    for (raw, sample) in chunk.bytes_mut().chunks_exact_mut(2).zip(samples) {
        raw.copy_from_slice(&sample.to_ne_bytes());
    }
    chunk
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Frame conservation: with identical input and output formats and
    /// pass-through parameters, the pipeline is the byte-for-byte identity.
    #[test]
    fn passthrough_pipeline_is_identity(
        samples in prop::collection::vec(any::<i16>(), 2..512),
    ) {
        let samples = &samples[..samples.len() & !1]; // whole stereo frames
        let params = StageParams::default();
        let mut stages = passthrough_pipeline(48_000);

        let mut chunk = pcm16_chunk(samples, 2, 48_000);
        let input_bytes = chunk.bytes().to_vec();
        for stage in &mut stages {
            stage.process(&mut chunk, &params);
        }

        prop_assert_eq!(chunk.format(), SampleFormat::Pcm16);
        prop_assert_eq!(chunk.frame_count() * 2, samples.len());
        prop_assert_eq!(chunk.bytes(), input_bytes.as_slice());
    }

    /// Limiter bound: after draining, no sample exceeds the shared-mode
    /// limit regardless of input.
    #[test]
    fn limiter_bound_holds(
        samples in prop::collection::vec(-4.0_f32..=4.0, 64..2048),
    ) {
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, false, true);
        let params = StageParams::default();

        let mut chunk = Chunk::new(SampleFormat::Float32, 1, samples.len(), 48_000);
        chunk.samples_f32_mut().copy_from_slice(&samples);

        limiter.process(&mut chunk, &params);
        let mut out = chunk;
        let mut tail = Chunk::empty();
        limiter.finish(&mut tail, &params);
        out.append(tail);

        prop_assert_eq!(out.frame_count(), samples.len());
        for sample in out.samples_f32() {
            prop_assert!(sample.abs() <= 0.98 + 1e-6, "sample {}", sample);
        }
    }

    /// Inputs already under the limit come back unchanged.
    #[test]
    fn limiter_passes_quiet_input(
        samples in prop::collection::vec(-0.9_f32..=0.9, 64..1024),
    ) {
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, false, true);
        let params = StageParams::default();

        let mut chunk = Chunk::new(SampleFormat::Float32, 1, samples.len(), 48_000);
        chunk.samples_f32_mut().copy_from_slice(&samples);

        limiter.process(&mut chunk, &params);
        let mut out = chunk;
        let mut tail = Chunk::empty();
        limiter.finish(&mut tail, &params);
        out.append(tail);

        prop_assert_eq!(out.samples_f32(), samples.as_slice());
    }

    /// The channel matrix routes every common channel onto itself with unit
    /// gain, for any pair of standard layouts and any input level.
    #[test]
    fn matrix_preserves_common_channels(
        level in 0.01_f32..=1.0,
        in_idx in 0_usize..6,
        out_idx in 0_usize..6,
    ) {
        let layouts = [
            ChannelMask::MONO,
            ChannelMask::STEREO,
            ChannelMask::QUAD,
            ChannelMask::SURROUND,
            ChannelMask::FIVE_POINT_ONE,
            ChannelMask::SEVEN_POINT_ONE,
        ];
        let input_mask = layouts[in_idx];
        let output_mask = layouts[out_idx];

        let mut matrix = ChannelMatrix::new();
        matrix.initialize(
            input_mask.count(),
            input_mask,
            output_mask.count(),
            output_mask,
        );

        // Feed each input channel alone and check its own output channel.
        let in_speakers: Vec<_> = input_mask.speakers().collect();
        let out_speakers: Vec<_> = output_mask.speakers().collect();
        for (x, speaker) in in_speakers.iter().enumerate() {
            if !output_mask.contains(*speaker) {
                continue;
            }
            let mut chunk = Chunk::new(SampleFormat::Float32, input_mask.count(), 1, 48_000);
            chunk.samples_f32_mut()[x] = level;
            matrix.process(&mut chunk, &StageParams::default());

            if !matrix.active() {
                continue;
            }
            let y = out_speakers.iter().position(|s| s == speaker).unwrap();
            let value = chunk.samples_f32()[y];
            prop_assert!(
                (value - level).abs() < 1e-4,
                "{:?} {} -> {}", speaker, level, value
            );
        }
    }
}
