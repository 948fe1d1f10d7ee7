//! Sample timing correction.
//!
//! Media sources stamp samples sloppily: timestamps go missing, segments
//! start mid-sample, seeks land before the previous sample ended. This
//! stage fills missing timestamps from the running frame count and, at the
//! start of a segment, reshapes the first samples so playback begins
//! exactly at the segment boundary:
//!
//! - a sample that ends at or before the last played position is dropped;
//! - one that starts early is cropped to the boundary;
//! - one that starts late is zero-padded up to its start time.
//!
//! Bitstream streams cannot be cut mid-frame; instead, leading buffers are
//! dropped until a splice point arrives.
//!
//! The residual difference between a sample's stamped start and its
//! expected position accumulates as `timings_error`, which the variable
//! rate stage consumes for drift correction on live sources.

use salida_core::{time, Chunk, RefTime, SharedWaveFormat, TICKS_PER_SEC};

use crate::sample::Sample;

/// Per-segment timing state and the sample correction policies.
#[derive(Default)]
pub struct SampleCorrection {
    format: Option<SharedWaveFormat>,
    bitstream: bool,
    rate: f64,
    fresh_segment: bool,
    fresh_buffer: bool,
    segment_start: RefTime,
    time_in_previous_formats: RefTime,
    frames_in_current_format: u64,
    last_sample_end: RefTime,
    timings_error: RefTime,
}

impl SampleCorrection {
    /// Fresh state; a format and a segment must be announced before
    /// samples arrive.
    pub fn new() -> SampleCorrection {
        SampleCorrection {
            rate: 1.0,
            fresh_segment: true,
            fresh_buffer: true,
            ..SampleCorrection::default()
        }
    }

    /// Switch to a new media format mid-segment. Elapsed time in the old
    /// format is banked so frame counting restarts cleanly.
    pub fn new_format(&mut self, format: SharedWaveFormat) {
        debug_assert!(format.sample_rate > 0);
        if self.format.is_some() {
            self.time_in_previous_formats +=
                self.frames_to_time(self.frames_in_current_format);
            self.frames_in_current_format = 0;
        }
        self.bitstream = format.is_bitstream();
        self.format = Some(format);
    }

    /// Begin a new segment at the given playback rate.
    pub fn new_segment(&mut self, rate: f64) {
        debug_assert!(rate > 0.0);
        self.rate = rate;
        self.fresh_segment = true;
        self.segment_start = 0;
        self.time_in_previous_formats = 0;
        self.frames_in_current_format = 0;
        self.last_sample_end = 0;
        self.timings_error = 0;
    }

    /// Mark the start of fresh buffering (after a flush or format set).
    pub fn new_buffer(&mut self) {
        self.fresh_buffer = true;
    }

    /// End time of the last accepted sample.
    pub fn last_sample_end(&self) -> RefTime {
        self.last_sample_end
    }

    /// Deviation of the last sample's start from its expected position.
    pub fn timings_error(&self) -> RefTime {
        self.timings_error
    }

    fn frames_to_time(&self, frames: u64) -> RefTime {
        let rate = self.format.as_ref().map_or(1, |f| f.sample_rate);
        time::frames_to_ticks(frames, rate)
    }

    fn frames_to_time_rated(&self, frames: u64) -> RefTime {
        (self.frames_to_time(frames) as f64 / self.rate) as RefTime
    }

    fn time_to_frames_rated(&self, ticks: RefTime) -> u64 {
        let rate = self.format.as_ref().map_or(1, |f| f.sample_rate);
        (time::ticks_to_frames(ticks, rate) as f64 * self.rate) as u64
    }

    fn expected_start(&self) -> RefTime {
        let elapsed =
            self.time_in_previous_formats + self.frames_to_time(self.frames_in_current_format);
        self.segment_start + (elapsed as f64 / self.rate) as RefTime
    }

    /// Fill in whatever timestamps the source left out.
    fn fill_missing_timings(
        &self,
        format: &salida_core::WaveFormat,
        sample: &Sample,
    ) -> (RefTime, RefTime) {
        let start = sample.start.unwrap_or_else(|| self.expected_start());
        let stop = sample.stop.unwrap_or_else(|| {
            let duration = sample.len as i64 * 8 / i64::from(format.bits_per_sample)
                / i64::from(format.channels)
                * TICKS_PER_SEC
                / i64::from(format.sample_rate);
            start + (duration as f64 / self.rate) as RefTime
        });
        (start, stop)
    }

    fn accumulate(&mut self, start: RefTime, stop: RefTime, frames: u64) {
        if frames == 0 {
            return;
        }
        if self.fresh_segment {
            debug_assert_eq!(self.segment_start, 0);
            self.segment_start = start;
            self.fresh_segment = false;
        }
        self.last_sample_end = stop;
        self.timings_error = start - self.expected_start();
        self.frames_in_current_format += frames;
        self.fresh_buffer = false;
    }

    /// Apply timing correction to one inbound sample, producing the chunk
    /// that enters the DSP pipeline (possibly empty).
    pub fn process(&mut self, sample: &Sample) -> Chunk {
        let Some(format) = self.format.clone() else {
            debug_assert!(false, "format announced before samples");
            return Chunk::empty();
        };

        let (mut start, stop) = self.fill_missing_timings(&format, sample);

        let drop = (self.bitstream && self.fresh_buffer && !sample.splice_point)
            || (!self.bitstream && self.fresh_segment && stop <= self.last_sample_end);

        if drop {
            self.timings_error = start - self.expected_start();
            return Chunk::empty();
        }

        if !self.bitstream && self.fresh_segment && start < self.last_sample_end {
            // Crop the overlap with what already played.
            let crop_frames = self.time_to_frames_rated(self.last_sample_end - start);
            let crop_bytes = crop_frames as usize * format.frame_size();
            if crop_frames > 0 && crop_bytes < sample.len {
                start += self.frames_to_time_rated(crop_frames);
                let chunk = Chunk::from_shared(
                    sample.buffer.clone(),
                    sample.offset + crop_bytes,
                    sample.len - crop_bytes,
                    &format,
                );
                self.accumulate(start, stop, chunk.frame_count() as u64);
                return chunk;
            }
        } else if !self.bitstream && self.fresh_segment && start > self.last_sample_end {
            // Zero-pad the gap before this sample.
            let pad_frames = self.time_to_frames_rated(start - self.last_sample_end);
            if pad_frames > 0 {
                let borrowed =
                    Chunk::from_shared(sample.buffer.clone(), sample.offset, sample.len, &format);
                start -= self.frames_to_time_rated(pad_frames);

                let frames = borrowed.frame_count() + pad_frames as usize;
                let mut chunk =
                    Chunk::new(format.format, format.channels, frames, format.sample_rate);
                let pad_bytes = pad_frames as usize * format.frame_size();
                chunk.bytes_mut()[pad_bytes..].copy_from_slice(borrowed.bytes());

                self.accumulate(start, stop, frames as u64);
                return chunk;
            }
        }

        // Pass through untouched.
        let chunk = Chunk::from_shared(sample.buffer.clone(), sample.offset, sample.len, &format);
        self.accumulate(start, stop, chunk.frame_count() as u64);
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salida_core::{ChannelMask, SampleFormat, WaveFormat};
    use std::sync::Arc;

    fn stereo_f32_48k() -> SharedWaveFormat {
        Arc::new(WaveFormat::new(
            SampleFormat::Float32,
            48_000,
            2,
            ChannelMask::STEREO,
        ))
    }

    fn fresh(format: SharedWaveFormat) -> SampleCorrection {
        let mut correction = SampleCorrection::new();
        correction.new_format(format);
        correction.new_segment(1.0);
        correction
    }

    fn frames_sample(frames: usize, fill: f32) -> Sample {
        let mut data = vec![0_u8; frames * 8];
        for raw in data.chunks_exact_mut(4) {
            raw.copy_from_slice(&fill.to_ne_bytes());
        }
        Sample::new(data.into())
    }

    #[test]
    fn test_zero_pad_at_segment_start() {
        // 100 frames starting 10,000 ticks into the segment: 48 frames of
        // leading silence get prepended.
        let mut correction = fresh(stereo_f32_48k());

        let sample = frames_sample(100, 0.5).with_times(10_000, 2_094_500);
        let mut chunk = correction.process(&sample);

        assert_eq!(chunk.frame_count(), 148);
        let samples = chunk.samples_f32();
        assert!(samples[..48 * 2].iter().all(|&s| s == 0.0));
        assert!(samples[48 * 2..].iter().all(|&s| s == 0.5));
        assert_eq!(correction.last_sample_end(), 2_094_500);
    }

    #[test]
    fn test_crop_on_overlap() {
        let format = stereo_f32_48k();
        let mut correction = fresh(Arc::clone(&format));
        correction.last_sample_end = 200_000;

        // 100,000 ticks of overlap crops 480 frames.
        let total_frames = 960;
        let sample = frames_sample(total_frames, 0.25).with_times(100_000, 300_000);
        let chunk = correction.process(&sample);

        assert_eq!(chunk.frame_count(), total_frames - 480);
        assert_eq!(correction.last_sample_end(), 300_000);
        // Start advanced to the boundary: the next expected start matches.
        assert_eq!(correction.segment_start, 200_000);
    }

    #[test]
    fn test_drop_on_past_sample() {
        let format = stereo_f32_48k();
        let mut correction = fresh(Arc::clone(&format));
        correction.last_sample_end = 1_000_000;

        let frames_before = correction.frames_in_current_format;
        let sample = frames_sample(100, 0.5).with_times(880_000, 900_000);
        let chunk = correction.process(&sample);

        assert!(chunk.is_empty());
        assert_eq!(correction.frames_in_current_format, frames_before);
        assert_eq!(correction.last_sample_end(), 1_000_000);
        // Only the timing error moved.
        assert_eq!(correction.timings_error(), 880_000);
    }

    #[test]
    fn test_missing_timestamps_are_filled() {
        let mut correction = fresh(stereo_f32_48k());

        // First sample anchors the segment at zero.
        let first = frames_sample(4800, 0.1);
        let chunk = correction.process(&first);
        assert_eq!(chunk.frame_count(), 4800);
        // 4800 frames at 48 kHz is 100 ms.
        assert_eq!(correction.last_sample_end(), 1_000_000);

        // Second unstamped sample continues where the first ended.
        let second = frames_sample(4800, 0.1);
        correction.process(&second);
        assert_eq!(correction.last_sample_end(), 2_000_000);
        assert_eq!(correction.timings_error(), 0);
    }

    #[test]
    fn test_steady_stream_is_untouched() {
        let mut correction = fresh(stereo_f32_48k());

        let first = frames_sample(480, 0.5).with_times(0, 100_000);
        assert_eq!(correction.process(&first).frame_count(), 480);

        // Not a fresh segment anymore: an overlapping stamp passes through.
        let second = frames_sample(480, 0.5).with_times(90_000, 190_000);
        let chunk = correction.process(&second);
        assert_eq!(chunk.frame_count(), 480);
        assert_eq!(correction.timings_error(), -10_000);
    }

    #[test]
    fn test_bitstream_drops_until_splice_point() {
        let format = Arc::new(WaveFormat::bitstream(48_000, 2, 16));
        let mut correction = SampleCorrection::new();
        correction.new_format(format);
        correction.new_segment(1.0);

        let mut sample = frames_sample(100, 0.0).with_times(0, 100_000);
        sample.splice_point = false;
        assert!(correction.process(&sample).is_empty());

        let mut sample = frames_sample(100, 0.0).with_times(100_000, 200_000);
        sample.splice_point = true;
        assert_eq!(correction.process(&sample).frame_count(), 200);

        // Buffer is no longer fresh; plain buffers flow.
        let mut sample = frames_sample(100, 0.0).with_times(200_000, 300_000);
        sample.splice_point = false;
        assert!(!correction.process(&sample).is_empty());
    }

    #[test]
    fn test_segment_times_stay_monotonic() {
        // Jittered stamps around a nominal 10 ms cadence: after correction
        // the accepted sample ends never move backwards.
        let mut correction = fresh(stereo_f32_48k());

        let jitter = [0_i64, -3_000, 2_000, 0, -1_500, 4_000, 0, -2_500];
        let mut previous_end = 0;
        for (i, offset) in jitter.iter().enumerate() {
            let nominal = i as i64 * 100_000;
            let sample = frames_sample(480, 0.5).with_times(nominal + offset, nominal + 100_000);
            let chunk = correction.process(&sample);

            if !chunk.is_empty() {
                assert!(
                    correction.last_sample_end() >= previous_end,
                    "sample {i} moved the stream end backwards"
                );
                previous_end = correction.last_sample_end();
            }
        }
    }

    #[test]
    fn test_playback_rate_scales_correction() {
        let mut correction = fresh(stereo_f32_48k());
        correction.new_segment(2.0);

        // At 2x rate, 10,000 ticks of lead time is 96 source frames.
        let sample = frames_sample(100, 0.5).with_times(10_000, 30_000);
        let chunk = correction.process(&sample);
        assert_eq!(chunk.frame_count(), 100 + 96);
    }
}
