//! Master volume.

use salida_core::Chunk;

use crate::stage::{Stage, StageParams};

/// Scalar gain over all channels, driven by the per-call parameter
/// snapshot. Unity volume leaves the chunk untouched.
#[derive(Default)]
pub struct Volume;

impl Volume {
    /// A volume stage.
    pub fn new() -> Volume {
        Volume
    }
}

impl Stage for Volume {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn active(&self) -> bool {
        true
    }

    fn process(&mut self, chunk: &mut Chunk, params: &StageParams) {
        let volume = params.volume;
        if chunk.is_empty() || volume == 1.0 {
            return;
        }
        debug_assert!((0.0..=1.0).contains(&volume));

        chunk.to_float();
        for sample in chunk.samples_f32_mut() {
            *sample *= volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salida_core::SampleFormat;

    #[test]
    fn test_applies_gain() {
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 4, 48_000);
        chunk.samples_f32_mut().fill(0.8);

        let params = StageParams {
            volume: 0.5,
            balance: 0.0,
        };
        Volume::new().process(&mut chunk, &params);
        for sample in chunk.samples_f32() {
            assert!((sample - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn test_unity_leaves_format_alone() {
        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 4, 48_000);
        Volume::new().process(&mut chunk, &StageParams::default());
        assert_eq!(chunk.format(), SampleFormat::Pcm16);
    }
}
