//! Time-stretch for playback rates other than 1.0.
//!
//! A WSOLA (waveform-similarity overlap-add) stretcher: the input is cut
//! into 40 ms sequences, each sequence is re-anchored inside a 15 ms seek
//! window by cross-correlating against the previous output tail, and
//! neighbouring sequences are blended over an 8 ms linear overlap. Pitch is
//! preserved; only the playback duration changes.

use salida_core::{Chunk, SampleFormat};

use crate::stage::{Stage, StageParams};

const SEQUENCE_MS: usize = 40;
const SEEK_WINDOW_MS: usize = 15;
const OVERLAP_MS: usize = 8;

/// The tempo (time-stretch) stage.
#[derive(Default)]
pub struct TempoStretch {
    active: bool,
    tempo: f64,
    rate: u32,
    channels: usize,
    seq: usize,
    seek: usize,
    overlap: usize,
    /// Interleaved input fifo.
    input: Vec<f32>,
    /// Fractional read position in `input`, in frames.
    pos: f64,
    /// Tail of the previous output window, `overlap` frames.
    tail: Vec<f32>,
    has_tail: bool,
}

impl TempoStretch {
    /// An uninitialized (inactive) stretcher.
    pub fn new() -> TempoStretch {
        TempoStretch::default()
    }

    /// Configure for a playback rate. A tempo of 1.0 deactivates the stage.
    pub fn initialize(&mut self, tempo: f64, rate: u32, channels: u32) {
        *self = TempoStretch {
            active: tempo != 1.0,
            tempo,
            rate,
            channels: channels as usize,
            seq: (rate as usize * SEQUENCE_MS / 1000).max(4),
            seek: (rate as usize * SEEK_WINDOW_MS / 1000).max(1),
            overlap: (rate as usize * OVERLAP_MS / 1000).max(1),
            ..TempoStretch::default()
        };
    }

    fn fifo_frames(&self) -> usize {
        self.input.len() / self.channels
    }

    fn mono(&self, frame: usize) -> f32 {
        let start = frame * self.channels;
        self.input[start..start + self.channels].iter().sum::<f32>() / self.channels as f32
    }

    /// Seek offset with the best waveform similarity to the previous tail.
    fn best_offset(&self, base: usize) -> usize {
        let mut best = 0;
        let mut best_score = f32::MIN;
        for offset in 0..self.seek {
            let mut dot = 0.0_f32;
            let mut energy = 1e-9_f32;
            for i in 0..self.overlap {
                let tail = self.tail[i * self.channels..(i + 1) * self.channels]
                    .iter()
                    .sum::<f32>()
                    / self.channels as f32;
                let cand = self.mono(base + offset + i);
                dot += tail * cand;
                energy += cand * cand;
            }
            let score = dot / energy.sqrt();
            if score > best_score {
                best_score = score;
                best = offset;
            }
        }
        best
    }

    /// Emit one re-anchored sequence into `out`.
    fn emit_sequence(&mut self, seg: usize, out: &mut Vec<f32>) {
        let ch = self.channels;

        if self.has_tail {
            // Blend the previous tail into the new segment's head.
            for i in 0..self.overlap {
                let m = i as f32 / self.overlap as f32;
                for c in 0..ch {
                    let new = self.input[(seg + i) * ch + c];
                    let old = self.tail[i * ch + c];
                    out.push(old * (1.0 - m) + new * m);
                }
            }
        } else {
            out.extend_from_slice(&self.input[seg * ch..(seg + self.overlap) * ch]);
        }

        // Middle of the sequence passes through unblended.
        out.extend_from_slice(
            &self.input[(seg + self.overlap) * ch..(seg + self.seq - self.overlap) * ch],
        );

        // Keep the sequence tail for the next blend.
        self.tail.clear();
        self.tail
            .extend_from_slice(&self.input[(seg + self.seq - self.overlap) * ch..(seg + self.seq) * ch]);
        self.has_tail = true;
    }

    fn stretch(&mut self, out: &mut Vec<f32>) {
        loop {
            let base = self.pos.floor() as usize;
            if base + self.seek + self.seq > self.fifo_frames() {
                break;
            }

            let offset = if self.has_tail { self.best_offset(base) } else { 0 };
            self.emit_sequence(base + offset, out);

            self.pos += (self.seq - self.overlap) as f64 * self.tempo;

            // Drop consumed input.
            let drop = (self.pos.floor() as usize).min(self.fifo_frames());
            if drop > 0 {
                self.input.drain(..drop * self.channels);
                self.pos -= drop as f64;
            }
        }
    }
}

impl Stage for TempoStretch {
    fn name(&self) -> &'static str {
        "tempo"
    }

    fn active(&self) -> bool {
        self.active
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        if !self.active || chunk.is_empty() {
            return;
        }
        chunk.to_float();
        self.input.extend_from_slice(chunk.samples_f32());

        let mut out = Vec::new();
        self.stretch(&mut out);

        let frames = out.len() / self.channels;
        let mut output = Chunk::new(SampleFormat::Float32, self.channels as u32, frames, self.rate);
        if frames > 0 {
            output.samples_f32_mut().copy_from_slice(&out);
        }
        *chunk = output;
    }

    fn finish(&mut self, chunk: &mut Chunk, params: &StageParams) {
        if !self.active {
            return;
        }
        self.process(chunk, params);

        // Flush: whatever input remains plays out unstretched.
        let base = (self.pos.floor() as usize).min(self.fifo_frames());
        let rest = &self.input[base * self.channels..];
        if !rest.is_empty() {
            let frames = rest.len() / self.channels;
            let mut residue =
                Chunk::new(SampleFormat::Float32, self.channels as u32, frames, self.rate);
            residue.samples_f32_mut().copy_from_slice(rest);
            chunk.append(residue);
        }
        self.input.clear();
        self.pos = 0.0;
        self.has_tail = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_chunk(frames: usize, channels: u32, seed: u32) -> Chunk {
        let mut chunk = Chunk::new(SampleFormat::Float32, channels, frames, 48_000);
        let mut state = seed.wrapping_mul(747_796_405).wrapping_add(1);
        for sample in chunk.samples_f32_mut() {
            state = state.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
            *sample = (state >> 9) as f32 / (1 << 23) as f32 - 1.0;
        }
        chunk
    }

    #[test]
    fn test_unity_tempo_is_inactive() {
        let mut tempo = TempoStretch::new();
        tempo.initialize(1.0, 48_000, 2);
        assert!(!tempo.active());

        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 64, 48_000);
        tempo.process(&mut chunk, &StageParams::default());
        assert_eq!(chunk.frame_count(), 64);
        assert_eq!(chunk.format(), SampleFormat::Pcm16);
    }

    #[test]
    fn test_double_speed_halves_duration() {
        let mut tempo = TempoStretch::new();
        tempo.initialize(2.0, 48_000, 1);
        assert!(tempo.active());

        let params = StageParams::default();
        let input_frames = 96_000;
        let mut total = 0;
        for i in 0..20 {
            let mut chunk = noise_chunk(input_frames / 20, 1, i);
            tempo.process(&mut chunk, &params);
            total += chunk.frame_count();
        }
        let mut tail = Chunk::empty();
        tempo.finish(&mut tail, &params);
        total += tail.frame_count();

        let expected = input_frames / 2;
        let slack = 3 * 48 * SEQUENCE_MS; // a few sequences of tolerance
        assert!(
            (total as i64 - expected as i64).unsigned_abs() as usize <= slack,
            "stretched {input_frames} frames to {total}, expected ~{expected}"
        );
    }

    #[test]
    fn test_half_speed_doubles_duration() {
        let mut tempo = TempoStretch::new();
        tempo.initialize(0.5, 48_000, 2);

        let params = StageParams::default();
        let input_frames = 48_000;
        let mut total = 0;
        for i in 0..10 {
            let mut chunk = noise_chunk(input_frames / 10, 2, 100 + i);
            tempo.process(&mut chunk, &params);
            total += chunk.frame_count();
        }
        let mut tail = Chunk::empty();
        tempo.finish(&mut tail, &params);
        total += tail.frame_count();

        let expected = input_frames * 2;
        let slack = 3 * 48 * SEQUENCE_MS;
        assert!(
            (total as i64 - expected as i64).unsigned_abs() as usize <= slack,
            "stretched {input_frames} frames to {total}, expected ~{expected}"
        );
    }
}
