//! Stereo crossfeed for headphone listening.
//!
//! A BS2B-style head-related filter: each ear receives its own channel
//! through a gentle high shelf plus the opposite channel through a one-pole
//! lowpass, followed by a gain that compensates the bass buildup. The
//! (cutoff, level) pair comes from the settings; level is in tenths of a dB
//! (60 = 6 dB, the CMoy preset).
//!
//! Active only for two-channel audio with the standard stereo layout.

use libm::{exp, log10, pow};
use salida_core::{ChannelMask, Chunk};

use crate::stage::{Stage, StageParams};

/// The crossfeed stage.
#[derive(Default)]
pub struct Crossfeed {
    active: bool,
    // Lowpass (cross path) coefficients.
    b1_lo: f32,
    a0_lo: f32,
    // High-shelf (direct path) coefficients.
    b1_hi: f32,
    a0_hi: f32,
    a1_hi: f32,
    /// Bass-compensation output gain.
    gain: f32,
    // Filter state, [left, right].
    lo: [f32; 2],
    hi: [f32; 2],
    asis: [f32; 2],
}

impl Crossfeed {
    /// An uninitialized (inactive) crossfeed.
    pub fn new() -> Crossfeed {
        Crossfeed::default()
    }

    /// Configure the filter network.
    ///
    /// `cutoff_hz` is the lowpass corner of the cross path (300..=2000);
    /// `level_tenth_db` is the feed level in tenths of a dB (10..=150).
    /// The stage deactivates unless `enabled` and the stream is standard
    /// stereo.
    pub fn initialize(
        &mut self,
        enabled: bool,
        cutoff_hz: u32,
        level_tenth_db: u32,
        rate: u32,
        channels: u32,
        mask: ChannelMask,
    ) {
        *self = Crossfeed::default();

        if !enabled || channels != 2 || mask != ChannelMask::STEREO {
            return;
        }

        let level = f64::from(level_tenth_db) / 10.0;
        let fc_lo = f64::from(cutoff_hz);

        // Cross-path gain, direct-path dip, and the shifted shelf corner.
        let gb_lo = level * -5.0 / 6.0 - 3.0;
        let gb_hi = level / 6.0 - 3.0;
        let g_lo = pow(10.0, gb_lo / 20.0);
        let g_hi = 1.0 - pow(10.0, gb_hi / 20.0);
        let fc_hi = fc_lo * pow(2.0, (gb_lo - 20.0 * log10(g_hi)) / 12.0);

        let srate = f64::from(rate);
        let x = exp(-2.0 * std::f64::consts::PI * fc_lo / srate);
        self.b1_lo = x as f32;
        self.a0_lo = (g_lo * (1.0 - x)) as f32;

        // Direct path is `in - g_hi * lowpass(in)` folded into one biquad-1:
        // out = (1 - g_hi(1-x))*in - x*in[-1] + x*out[-1].
        let x = exp(-2.0 * std::f64::consts::PI * fc_hi / srate);
        self.b1_hi = x as f32;
        self.a0_hi = (1.0 - g_hi * (1.0 - x)) as f32;
        self.a1_hi = -x as f32;

        self.gain = (1.0 / (1.0 - g_hi + g_lo)) as f32;
        self.active = true;
    }
}

impl Stage for Crossfeed {
    fn name(&self) -> &'static str {
        "crossfeed"
    }

    fn active(&self) -> bool {
        self.active
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        if !self.active || chunk.is_empty() {
            return;
        }
        chunk.to_float();
        debug_assert_eq!(chunk.channels(), 2);

        for frame in chunk.samples_f32_mut().chunks_exact_mut(2) {
            for ch in 0..2 {
                let input = frame[ch];
                self.lo[ch] = self.a0_lo * input + self.b1_lo * self.lo[ch];
                self.hi[ch] =
                    self.a0_hi * input + self.a1_hi * self.asis[ch] + self.b1_hi * self.hi[ch];
                self.asis[ch] = input;
            }
            frame[0] = (self.hi[0] + self.lo[1]) * self.gain;
            frame[1] = (self.hi[1] + self.lo[0]) * self.gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salida_core::SampleFormat;

    const CMOY_CUTOFF: u32 = 700;
    const CMOY_LEVEL: u32 = 60;

    fn configured() -> Crossfeed {
        let mut crossfeed = Crossfeed::new();
        crossfeed.initialize(true, CMOY_CUTOFF, CMOY_LEVEL, 48_000, 2, ChannelMask::STEREO);
        crossfeed
    }

    #[test]
    fn test_inactive_without_stereo() {
        let mut crossfeed = Crossfeed::new();
        crossfeed.initialize(true, CMOY_CUTOFF, CMOY_LEVEL, 48_000, 6, ChannelMask::FIVE_POINT_ONE);
        assert!(!crossfeed.active());

        crossfeed.initialize(false, CMOY_CUTOFF, CMOY_LEVEL, 48_000, 2, ChannelMask::STEREO);
        assert!(!crossfeed.active());
    }

    #[test]
    fn test_bleeds_left_into_right() {
        let mut crossfeed = configured();
        // DC on the left channel only.
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 4800, 48_000);
        for frame in chunk.samples_f32_mut().chunks_exact_mut(2) {
            frame[0] = 0.5;
        }
        crossfeed.process(&mut chunk, &StageParams::default());

        let samples = chunk.samples_f32();
        let last = &samples[samples.len() - 2..];
        assert!(last[1] > 0.01, "no crossfeed on right: {}", last[1]);
        assert!(last[0] > last[1], "direct path should dominate");
    }

    #[test]
    fn test_dc_level_is_preserved() {
        // At DC the direct dip, cross feed, and output gain cancel out:
        // a centered signal keeps its level.
        let mut crossfeed = configured();
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 48_000, 48_000);
        chunk.samples_f32_mut().fill(0.25);
        crossfeed.process(&mut chunk, &StageParams::default());

        let samples = chunk.samples_f32();
        let last = samples[samples.len() - 1];
        assert!((last - 0.25).abs() < 1e-3, "settled at {last}");
    }
}
