//! Stereo balance.

use salida_core::Chunk;

use crate::stage::{Stage, StageParams};

/// Attenuates one stereo channel by `|balance|`; centered balance and
/// non-stereo audio pass through untouched.
#[derive(Default)]
pub struct Balance;

impl Balance {
    /// A balance stage.
    pub fn new() -> Balance {
        Balance
    }
}

impl Stage for Balance {
    fn name(&self) -> &'static str {
        "balance"
    }

    fn active(&self) -> bool {
        true
    }

    fn process(&mut self, chunk: &mut Chunk, params: &StageParams) {
        let balance = params.balance;
        if chunk.is_empty() || balance == 0.0 || chunk.channels() != 2 {
            return;
        }
        debug_assert!((-1.0..=1.0).contains(&balance));

        chunk.to_float();
        let gain = balance.abs();
        let start = usize::from(balance < 0.0);
        for sample in chunk.samples_f32_mut().iter_mut().skip(start).step_by(2) {
            *sample *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salida_core::SampleFormat;

    fn stereo(value: f32) -> Chunk {
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 4, 48_000);
        chunk.samples_f32_mut().fill(value);
        chunk
    }

    #[test]
    fn test_positive_balance_attenuates_left() {
        let mut chunk = stereo(1.0);
        let params = StageParams {
            volume: 1.0,
            balance: 0.25,
        };
        Balance::new().process(&mut chunk, &params);
        let samples = chunk.samples_f32();
        assert_eq!(samples[0], 0.25);
        assert_eq!(samples[1], 1.0);
    }

    #[test]
    fn test_negative_balance_attenuates_right() {
        let mut chunk = stereo(1.0);
        let params = StageParams {
            volume: 1.0,
            balance: -0.25,
        };
        Balance::new().process(&mut chunk, &params);
        let samples = chunk.samples_f32();
        assert_eq!(samples[0], 1.0);
        assert_eq!(samples[1], 0.25);
    }

    #[test]
    fn test_non_stereo_bypassed() {
        let mut chunk = Chunk::new(SampleFormat::Float32, 6, 4, 48_000);
        chunk.samples_f32_mut().fill(1.0);
        let params = StageParams {
            volume: 1.0,
            balance: 0.5,
        };
        Balance::new().process(&mut chunk, &params);
        assert!(chunk.samples_f32().iter().all(|&s| s == 1.0));
    }
}
