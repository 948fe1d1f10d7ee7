//! Lookahead peak limiter.
//!
//! The limiter buffers enough chunks to see `attack + release` frames ahead
//! of whatever it emits, where `attack = rate / 1700` and
//! `release = rate / 70` frames. Scanning incoming audio it maintains a
//! *peak history*: an ordered sequence of pivot points
//! `(frame, level)` describing a piecewise-linear attenuation envelope that
//! starts and ends at the limit and stays at or above every over-limit
//! sample in between. Adding a new peak prunes pivots its envelope
//! dominates, so the envelope is always the tightest set of straight lines
//! covering the peaks.
//!
//! On emission each sample is divided by the envelope and scaled back to
//! the limit, which attenuates a `attack`-frame ramp ahead of every peak
//! and releases over `release` frames after it.
//!
//! The limit is 1.0 in exclusive mode and 0.98 in shared mode (headroom for
//! the system mixer); with the shared-mode limiter disabled the stage still
//! guards float output at 1.0.

use std::collections::VecDeque;

use salida_core::{Chunk, SampleFormat};

use crate::stage::{Stage, StageParams};

#[inline]
fn slope(left: (u64, f32), right: (u64, f32)) -> f32 {
    debug_assert!(right.0 > left.0);
    (right.1 - left.1) / (right.0 - left.0) as f32
}

#[inline]
fn line_at(left: (u64, f32), slope: f32, pos: u64) -> f32 {
    left.1 + slope * (pos - left.0) as f32
}

#[inline]
fn envelope_at(left: (u64, f32), right: (u64, f32), pos: u64) -> f32 {
    debug_assert!(pos >= left.0 && pos <= right.0);
    line_at(left, slope(left, right), pos)
}

/// The peak limiting stage.
pub struct PeakLimiter {
    limit: f32,
    attack_frames: u64,
    release_frames: u64,
    window_frames: u64,
    buffer: VecDeque<Chunk>,
    buffer_frames: u64,
    first_frame: u64,
    peaks: VecDeque<(u64, f32)>,
}

impl Default for PeakLimiter {
    fn default() -> PeakLimiter {
        PeakLimiter {
            limit: 1.0,
            attack_frames: 0,
            release_frames: 0,
            window_frames: 0,
            buffer: VecDeque::new(),
            buffer_frames: 0,
            first_frame: 0,
            peaks: VecDeque::new(),
        }
    }
}

impl PeakLimiter {
    /// An uninitialized limiter.
    pub fn new() -> PeakLimiter {
        PeakLimiter::default()
    }

    /// Configure for a stream.
    ///
    /// `exclusive` selects the 1.0 limit; shared mode limits at 0.98 when
    /// `shared_mode_limiter` is on, and otherwise only guards float output
    /// at 1.0.
    pub fn initialize(&mut self, rate: u32, exclusive: bool, shared_mode_limiter: bool) {
        let attack = u64::from(rate / 1700);
        let release = u64::from(rate / 70).max(1);
        *self = PeakLimiter {
            limit: if exclusive || !shared_mode_limiter {
                1.0
            } else {
                0.98
            },
            attack_frames: attack,
            release_frames: release,
            window_frames: attack + release,
            ..PeakLimiter::default()
        };
    }

    fn analyze_last_chunk(&mut self) {
        debug_assert!(self.limit > 0.0);

        let Some(chunk) = self.buffer.back_mut() else {
            return;
        };
        let chunk_frames = chunk.frame_count() as u64;
        let chunk_first = self.first_frame + self.buffer_frames - chunk_frames;
        let channels = chunk.channels() as usize;
        let limit = self.limit;
        let attack = self.attack_frames;
        let release = self.release_frames;

        let data = chunk.samples_f32();
        for frame in 0..chunk_frames {
            let start = frame as usize * channels;
            let mut sample = 0.0_f32;
            for value in &data[start..start + channels] {
                sample = sample.max(value.abs());
            }
            if sample <= limit {
                continue;
            }

            let peak_frame = chunk_first + frame;
            if self.peaks.is_empty() {
                self.peaks.push_back((peak_frame.saturating_sub(attack), limit));
                self.peaks.push_back((peak_frame, sample));
                self.peaks.push_back((peak_frame + release, limit));
                continue;
            }

            debug_assert!(self.peaks.len() > 1);
            let back = self.peaks[self.peaks.len() - 1];
            let next_to_back = self.peaks[self.peaks.len() - 2];
            debug_assert_eq!(back.1, limit);

            // Does the new peak poke above the trailing release line? If
            // not, the existing envelope already covers it.
            if peak_frame > back.0 || envelope_at(next_to_back, back, peak_frame) < sample {
                self.peaks.pop_back();

                // Drop interior pivots dominated by the line from the pivot
                // before them to the new peak.
                while self.peaks.len() >= 2 {
                    let back = self.peaks[self.peaks.len() - 1];
                    let before = self.peaks[self.peaks.len() - 2];
                    if sample >= back.1
                        && line_at(before, slope(before, (peak_frame, sample)), back.0) > back.1
                    {
                        self.peaks.pop_back();
                    } else {
                        break;
                    }
                }

                self.peaks.push_back((peak_frame, sample));
                self.peaks.push_back((peak_frame + release, limit));
            }
        }
    }

    fn attenuate_first_chunk(&mut self) {
        if self.peaks.is_empty() {
            return;
        }
        let Some(chunk) = self.buffer.front_mut() else {
            return;
        };

        let chunk_first = self.first_frame;
        let chunk_frames = chunk.frame_count() as u64;
        let channels = chunk.channels() as usize;
        let limit = self.limit;

        let first_offset = if chunk_first > self.peaks[0].0 {
            0
        } else {
            self.peaks[0].0 - chunk_first
        };

        debug_assert!(self.peaks.len() > 1);
        let mut left = self.peaks[0];
        let mut right = self.peaks[1];
        let mut x = slope(left, right);

        let data = chunk.samples_f32_mut();
        for i in first_offset..chunk_frames {
            let frame = chunk_first + i;
            let divisor = line_at(left, x, frame);

            let start = i as usize * channels;
            for sample in &mut data[start..start + channels] {
                *sample = *sample / divisor * limit;
                debug_assert!(sample.abs() <= limit + 1e-6);
            }

            if right.0 <= frame {
                debug_assert_eq!(right.0, frame);
                self.peaks.pop_front();
                if self.peaks.len() == 1 {
                    self.peaks.clear();
                    break;
                }
                left = self.peaks[0];
                right = self.peaks[1];
                x = slope(left, right);
            }
        }
    }
}

impl Stage for PeakLimiter {
    fn name(&self) -> &'static str {
        "limiter"
    }

    fn active(&self) -> bool {
        self.window_frames > 0
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        if chunk.is_empty() || self.window_frames == 0 {
            return;
        }

        // Integer formats in exclusive mode already cannot exceed the
        // limit; everything else goes through the lookahead window.
        if self.limit != 1.0 || chunk.format() == SampleFormat::Float32 || !self.buffer.is_empty()
        {
            chunk.to_float();

            self.buffer_frames += chunk.frame_count() as u64;
            self.buffer.push_back(chunk.take());

            self.analyze_last_chunk();

            let front_frames = self.buffer[0].frame_count() as u64;
            if self.buffer_frames - front_frames >= self.window_frames {
                self.attenuate_first_chunk();

                self.buffer_frames -= front_frames;
                self.first_frame += front_frames;
                if let Some(front) = self.buffer.pop_front() {
                    *chunk = front;
                }
            }
        }
    }

    fn finish(&mut self, chunk: &mut Chunk, params: &StageParams) {
        self.process(chunk, params);

        let mut out = chunk.take();
        while !self.buffer.is_empty() {
            self.attenuate_first_chunk();
            if let Some(front) = self.buffer.pop_front() {
                let frames = front.frame_count() as u64;
                self.buffer_frames -= frames;
                self.first_frame += frames;
                out.append(front);
            }
        }
        debug_assert_eq!(self.buffer_frames, 0);
        *chunk = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    fn run_all(limiter: &mut PeakLimiter, mut input: Chunk) -> Chunk {
        let params = StageParams::default();
        limiter.process(&mut input, &params);
        let mut out = input;
        let mut tail = Chunk::empty();
        limiter.finish(&mut tail, &params);
        out.append(tail);
        out
    }

    #[test]
    fn test_single_peak_triangular_valley() {
        // 48 kHz mono, limit 1.0: attack is 28 frames, release 685.
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, true, false);

        let frames = 96_000;
        let peak = 48_000_usize;
        let mut chunk = Chunk::new(SampleFormat::Float32, 1, frames, 48_000);
        {
            let data = chunk.samples_f32_mut();
            data.fill(0.5);
            data[peak] = 2.0;
        }

        let mut out = run_all(&mut limiter, chunk);
        let data = out.samples_f32();
        assert_eq!(data.len(), frames);

        // The peak itself lands exactly on the limit.
        assert!((data[peak] - 1.0).abs() < EPSILON, "peak {}", data[peak]);
        // Outside the window nothing changes.
        assert_eq!(data[peak - 29], 0.5);
        assert_eq!(data[peak + 686], 0.5);
        // Half-way up the attack ramp the envelope is 1.5.
        assert!(
            (data[peak - 14] - 0.5 / 1.5).abs() < EPSILON,
            "mid-attack {}",
            data[peak - 14]
        );
        // Half-way down the release the envelope is ~1.5 as well.
        let mid_release = peak + 343;
        let expected_env = 2.0 + (1.0 - 2.0) * (343.0 / 685.0);
        assert!(
            (data[mid_release] - 0.5 / expected_env).abs() < EPSILON,
            "mid-release {}",
            data[mid_release]
        );
    }

    #[test]
    fn test_below_limit_passes_unchanged() {
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, false, true); // shared mode, limit 0.98

        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 4800, 48_000);
        for (i, sample) in chunk.samples_f32_mut().iter_mut().enumerate() {
            *sample = ((i % 97) as f32 / 97.0 - 0.5) * 1.8; // within +-0.9
        }
        let reference: Vec<f32> = chunk.samples_f32().to_vec();

        let mut out = run_all(&mut limiter, chunk);
        assert_eq!(out.samples_f32(), reference.as_slice());
    }

    #[test]
    fn test_output_never_exceeds_limit() {
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, false, true);

        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 48_000, 48_000);
        let mut state = 0x12345_u32;
        for sample in chunk.samples_f32_mut() {
            state = state.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
            *sample = ((state >> 8) as f32 / (1 << 23) as f32 - 1.0) * 3.0;
        }

        let mut out = run_all(&mut limiter, chunk);
        for sample in out.samples_f32() {
            assert!(sample.abs() <= 0.98 + 1e-6, "sample {sample}");
        }
    }

    #[test]
    fn test_exclusive_integer_passthrough() {
        // Exclusive 16-bit audio skips the limiter entirely.
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, true, false);

        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 64, 48_000);
        chunk.bytes_mut()[0] = 0x7F;
        limiter.process(&mut chunk, &StageParams::default());
        assert_eq!(chunk.format(), SampleFormat::Pcm16);
        assert_eq!(chunk.bytes()[0], 0x7F);
    }

    #[test]
    fn test_emission_waits_for_lookahead() {
        let mut limiter = PeakLimiter::new();
        limiter.initialize(48_000, false, true);
        let params = StageParams::default();

        // First small chunk is held back entirely (window is 713 frames).
        let mut chunk = Chunk::new(SampleFormat::Float32, 1, 100, 48_000);
        limiter.process(&mut chunk, &params);
        assert!(chunk.is_empty());

        // A big follow-up flushes the first one out.
        let mut chunk2 = Chunk::new(SampleFormat::Float32, 1, 2000, 48_000);
        limiter.process(&mut chunk2, &params);
        assert_eq!(chunk2.frame_count(), 100);
    }
}
