//! Property-based tests for sample conversion.
//!
//! Verifies the format round-trip guarantees: conversions into a format
//! with at least the source's precision and back are the identity for
//! integer widening and f32→f64, and within one source LSB across the
//! integer/float boundary (the float→integer headroom scaling makes exact
//! identity impossible there by design).

use proptest::prelude::*;
use salida_core::{Chunk, SampleFormat};

fn chunk_from_i16(samples: &[i16]) -> Chunk {
    let mut chunk = Chunk::new(SampleFormat::Pcm16, 1, samples.len(), 48_000);
    for (raw, sample) in chunk.bytes_mut().chunks_exact_mut(2).zip(samples) {
        raw.copy_from_slice(&sample.to_ne_bytes());
    }
    chunk
}

fn chunk_from_i8(samples: &[i8]) -> Chunk {
    let mut chunk = Chunk::new(SampleFormat::Pcm8, 1, samples.len(), 48_000);
    for (raw, sample) in chunk.bytes_mut().chunks_exact_mut(1).zip(samples) {
        raw[0] = *sample as u8;
    }
    chunk
}

fn read_i16(chunk: &Chunk) -> Vec<i16> {
    chunk
        .bytes()
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]))
        .collect()
}

fn read_i8(chunk: &Chunk) -> Vec<i8> {
    chunk.bytes().iter().map(|&b| b as i8).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Widening an integer format and narrowing back is the identity.
    #[test]
    fn pcm16_integer_round_trips(samples in prop::collection::vec(any::<i16>(), 1..64)) {
        for via in [SampleFormat::Pcm24, SampleFormat::Pcm32] {
            let mut chunk = chunk_from_i16(&samples);
            chunk.to_format(via);
            chunk.to_format(SampleFormat::Pcm16);
            prop_assert_eq!(read_i16(&chunk), samples.clone(), "via {:?}", via);
        }
    }

    /// 8-bit samples survive a round trip through every wider format.
    #[test]
    fn pcm8_round_trips_everywhere(samples in prop::collection::vec(any::<i8>(), 1..64)) {
        for via in [
            SampleFormat::Pcm16,
            SampleFormat::Pcm24,
            SampleFormat::Pcm32,
            SampleFormat::Float32,
            SampleFormat::Float64,
        ] {
            let mut chunk = chunk_from_i8(&samples);
            chunk.to_format(via);
            chunk.to_format(SampleFormat::Pcm8);
            let got = read_i8(&chunk);
            for (a, b) in samples.iter().zip(&got) {
                prop_assert!(
                    (i16::from(*a) - i16::from(*b)).abs() <= 1,
                    "{} -> {:?} -> {}", a, via, b
                );
            }
        }
    }

    /// f32 samples survive a round trip through f64 exactly.
    #[test]
    fn float32_float64_round_trip(samples in prop::collection::vec(-1.0_f32..=1.0, 1..64)) {
        let mut chunk = Chunk::new(SampleFormat::Float32, 1, samples.len(), 48_000);
        chunk.samples_f32_mut().copy_from_slice(&samples);
        chunk.to_format(SampleFormat::Float64);
        chunk.to_format(SampleFormat::Float32);
        prop_assert_eq!(chunk.samples_f32(), samples.as_slice());
    }

    /// Integer/float round trips land within one source LSB.
    #[test]
    fn pcm16_float_round_trip_close(samples in prop::collection::vec(any::<i16>(), 1..64)) {
        for via in [SampleFormat::Float32, SampleFormat::Float64] {
            let mut chunk = chunk_from_i16(&samples);
            chunk.to_format(via);
            chunk.to_format(SampleFormat::Pcm16);
            for (a, b) in samples.iter().zip(read_i16(&chunk)) {
                prop_assert!(
                    (i32::from(*a) - i32::from(b)).abs() <= 1,
                    "{} -> {:?} -> {}", a, via, b
                );
            }
        }
    }

    /// Conversion preserves the frame count in both directions.
    #[test]
    fn conversion_preserves_frames(samples in prop::collection::vec(any::<i16>(), 1..64)) {
        let mut chunk = chunk_from_i16(&samples);
        chunk.to_float();
        prop_assert_eq!(chunk.frame_count(), samples.len());
        chunk.to_format(SampleFormat::Pcm24);
        prop_assert_eq!(chunk.frame_count(), samples.len());
    }
}
