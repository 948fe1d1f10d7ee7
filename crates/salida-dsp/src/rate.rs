//! Sample rate conversion with seamless mode transitions.
//!
//! The converter runs in one of three states:
//!
//! - **Passthrough** - input and output rates match and no drift correction
//!   has been requested; chunks flow through untouched.
//! - **Constant** - a fixed-ratio sinc resampler bridges differing rates.
//! - **Variable** - an adjustable-ratio resampler absorbs clock drift in
//!   realtime mode. [`RateConverter::adjust`] accumulates drift and the
//!   effective ratio is clamped to ±5 cents of nominal.
//!
//! Entering the variable state while audio is flowing must be inaudible, so
//! the converter keeps both backends alive during the switch, produces from
//! both, aligns the old stream by the constant backend's group delay, and
//! cross-fades linearly over 1 ms at the output rate. The new variable
//! backend is aligned at creation by discarding its reported output delay.

use std::collections::VecDeque;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use salida_core::{time, Chunk, RefTime, SampleFormat, TICKS_PER_SEC};

use crate::stage::{Stage, StageParams};
use crate::{Error, Result};

const CHUNK_FRAMES: usize = 1024;

/// Effective relative ratio window: ±5 cents.
const RATIO_MIN: f64 = 0.997;
const RATIO_MAX: f64 = 1.003;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Passthrough,
    Constant,
    Variable,
}

/// Drift-corrected relative ratio for an accumulated adjustment, clamped to
/// the ±5-cent window.
fn drift_ratio(adjust: RefTime, nominal_ratio: f64) -> f64 {
    (1.0 + adjust as f64 / TICKS_PER_SEC as f64 / nominal_ratio).clamp(RATIO_MIN, RATIO_MAX)
}

/// Linear cross-fade of the leading `frames` of `to` from `from`.
///
/// A linear curve is right for highly-correlated signals, which these are:
/// both backends resample the same input.
fn crossfade(to: &mut Chunk, from: &mut Chunk, frames: usize) {
    debug_assert!(to.frame_count() >= frames && from.frame_count() >= frames);
    let channels = to.channels() as usize;
    let from_data = from.samples_f32().to_vec();
    let to_data = to.samples_f32_mut();
    for frame in 0..frames {
        let m = frame as f32 / (frames + 1) as f32;
        for channel in 0..channels {
            let i = frame * channels + channel;
            to_data[i] = to_data[i] * m + from_data[i] * (1.0 - m);
        }
    }
}

/// One sinc resampler plus the input fifo that adapts arbitrary chunk sizes
/// to rubato's fixed input blocks.
struct Backend {
    resampler: SincFixedIn<f32>,
    channels: usize,
    input_rate: u32,
    output_rate: u32,
    /// Output frames still to discard for delay alignment.
    pending_skip: usize,
    /// What `pending_skip` started as; output accounting excludes it.
    initial_skip: u64,
    fifo: Vec<VecDeque<f32>>,
    input_frames: u64,
    output_frames: u64,
}

impl Backend {
    fn new(input_rate: u32, output_rate: u32, channels: usize, align: bool) -> Result<Backend> {
        let parameters = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::new(
            f64::from(output_rate) / f64::from(input_rate),
            1.1,
            parameters,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| Error::Resampler(e.to_string()))?;

        let skip = if align { resampler.output_delay() } else { 0 };
        Ok(Backend {
            resampler,
            channels,
            input_rate,
            output_rate,
            pending_skip: skip,
            initial_skip: skip as u64,
            fifo: vec![VecDeque::new(); channels],
            input_frames: 0,
            output_frames: 0,
        })
    }

    fn delay(&self) -> usize {
        self.resampler.output_delay()
    }

    fn set_relative_ratio(&mut self, ratio: f64) -> Result<()> {
        self.resampler
            .set_resample_ratio_relative(ratio, true)
            .map_err(|e| Error::Resampler(e.to_string()))
    }

    fn collect(&mut self, produced: Vec<Vec<f32>>, out: &mut Chunk) {
        let frames = produced.first().map_or(0, |w| w.len());
        let skip = self.pending_skip.min(frames);
        self.pending_skip -= skip;
        let kept = frames - skip;
        self.output_frames += kept as u64;
        if kept == 0 {
            return;
        }

        let mut chunk = Chunk::new(
            SampleFormat::Float32,
            self.channels as u32,
            kept,
            self.output_rate,
        );
        let data = chunk.samples_f32_mut();
        for (channel, wave) in produced.iter().enumerate() {
            for (frame, sample) in wave[skip..].iter().enumerate() {
                data[frame * self.channels + channel] = *sample;
            }
        }
        out.append(chunk);
    }

    /// Feed a float chunk, returning whatever full blocks produced.
    fn feed(&mut self, input: &mut Chunk) -> Result<Chunk> {
        let frames = input.frame_count();
        let channels = self.channels;
        {
            let samples = input.samples_f32();
            for (channel, fifo) in self.fifo.iter_mut().enumerate() {
                fifo.extend(samples.iter().skip(channel).step_by(channels));
            }
        }
        self.input_frames += frames as u64;

        let mut out = Chunk::empty();
        while self.fifo[0].len() >= CHUNK_FRAMES {
            let block: Vec<Vec<f32>> = self
                .fifo
                .iter_mut()
                .map(|fifo| fifo.drain(..CHUNK_FRAMES).collect())
                .collect();
            let produced = self
                .resampler
                .process(&block, None)
                .map_err(|e| Error::Resampler(e.to_string()))?;
            self.collect(produced, &mut out);
        }
        Ok(out)
    }

    /// Flush the fifo and the filter tail so that the total output reaches
    /// the ideal `input * output_rate / input_rate` frame count.
    fn drain(&mut self) -> Result<Chunk> {
        let mut out = Chunk::empty();

        if !self.fifo[0].is_empty() {
            let block: Vec<Vec<f32>> = self
                .fifo
                .iter_mut()
                .map(|fifo| fifo.drain(..).collect())
                .collect();
            let produced = self
                .resampler
                .process_partial(Some(&block), None)
                .map_err(|e| Error::Resampler(e.to_string()))?;
            self.collect(produced, &mut out);
        }

        let target = (time::mul_div(
            self.input_frames as i64,
            i64::from(self.output_rate),
            i64::from(self.input_rate),
        ) - self.initial_skip as i64)
            .max(0) as u64;

        for _ in 0..1024 {
            if self.output_frames >= target {
                break;
            }
            let produced = self
                .resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(|e| Error::Resampler(e.to_string()))?;
            if produced.first().map_or(0, |w| w.len()) == 0 {
                break;
            }
            self.collect(produced, &mut out);
        }

        if self.output_frames > target {
            let excess = (self.output_frames - target) as usize;
            let kept = out.frame_count().saturating_sub(excess);
            out.shrink_tail(kept);
            self.output_frames = target;
        }

        Ok(out)
    }
}

/// The rate conversion stage.
pub struct RateConverter {
    state: State,
    variable_capable: bool,
    input_rate: u32,
    output_rate: u32,
    channels: u32,
    constant: Option<Backend>,
    variable: Option<Backend>,
    in_transition: bool,
    correlation: Option<usize>,
    fade_new: Chunk,
    fade_old: Chunk,
    adjust_time: RefTime,
    failed: bool,
}

impl Default for RateConverter {
    fn default() -> RateConverter {
        RateConverter {
            state: State::Passthrough,
            variable_capable: false,
            input_rate: 0,
            output_rate: 0,
            channels: 0,
            constant: None,
            variable: None,
            in_transition: false,
            correlation: None,
            fade_new: Chunk::empty(),
            fade_old: Chunk::empty(),
            adjust_time: 0,
            failed: false,
        }
    }
}

impl RateConverter {
    /// An uninitialized (pass-through) converter.
    pub fn new() -> RateConverter {
        RateConverter::default()
    }

    /// Configure for a new stream.
    ///
    /// `variable` marks a realtime stream whose clock drift may need
    /// absorbing: differing rates start in the variable state immediately,
    /// matching rates stay in pass-through until [`adjust`](Self::adjust)
    /// reports drift. Without `variable`, differing rates get the
    /// constant-ratio backend.
    pub fn initialize(
        &mut self,
        variable: bool,
        input_rate: u32,
        output_rate: u32,
        channels: u32,
    ) -> Result<()> {
        *self = RateConverter {
            state: State::Passthrough,
            variable_capable: variable,
            input_rate,
            output_rate,
            channels,
            ..RateConverter::default()
        };

        if input_rate != output_rate {
            if variable {
                self.variable = Some(Backend::new(
                    input_rate,
                    output_rate,
                    channels as usize,
                    true,
                )?);
                self.state = State::Variable;
            } else {
                self.constant = Some(Backend::new(
                    input_rate,
                    output_rate,
                    channels as usize,
                    false,
                )?);
                self.state = State::Constant;
            }
        }
        Ok(())
    }

    /// Accumulate a drift correction in 100-ns ticks.
    ///
    /// The first call on a pass-through or constant-state converter starts
    /// the cross-faded switch into the variable state.
    pub fn adjust(&mut self, time: RefTime) {
        if !self.variable_capable || self.failed {
            return;
        }
        self.adjust_time += time;

        if self.state != State::Variable {
            match Backend::new(
                self.input_rate,
                self.output_rate,
                self.channels as usize,
                true,
            ) {
                Ok(mut backend) => {
                    // Seed the new backend with whatever input the constant
                    // backend is still buffering, so both streams continue
                    // from the same input position.
                    if let Some(constant) = &self.constant {
                        backend.fifo = constant.fifo.clone();
                        backend.input_frames = constant.fifo[0].len() as u64;
                    }
                    tracing::debug!(
                        input_rate = self.input_rate,
                        output_rate = self.output_rate,
                        "switching to variable rate conversion"
                    );
                    self.variable = Some(backend);
                    self.in_transition = true;
                    self.correlation = None;
                    self.state = State::Variable;
                }
                Err(error) => {
                    tracing::error!(%error, "variable resampler creation failed");
                }
            }
        }
    }

    fn update_variable_ratio(&mut self) {
        let adjust = self.adjust_time;
        let output_rate = self.output_rate;
        let input_rate = self.input_rate;
        let Some(backend) = self.variable.as_mut() else {
            return;
        };

        let mut total = adjust;
        if backend.input_frames > backend.initial_skip {
            let expected = time::mul_div(
                backend.input_frames as i64,
                i64::from(output_rate),
                i64::from(input_rate),
            ) - backend.initial_skip as i64;
            let adjusted_frames = expected - backend.output_frames as i64;
            total += time::mul_div(adjusted_frames, TICKS_PER_SEC, i64::from(output_rate));
        }

        let nominal = f64::from(output_rate) / f64::from(input_rate);
        let ratio = drift_ratio(total, nominal);
        if let Err(error) = backend.set_relative_ratio(ratio) {
            tracing::error!(%error, "resample ratio update failed");
        }
    }

    fn run(&mut self, input: &mut Chunk, eos: bool) -> Result<Chunk> {
        let backend = match self.state {
            State::Constant => self.constant.as_mut(),
            State::Variable => self.variable.as_mut(),
            State::Passthrough => None,
        };

        let mut produced = Chunk::empty();
        if let Some(backend) = backend {
            if !input.is_empty() {
                produced = backend.feed(input)?;
            }
            if eos {
                produced.append(backend.drain()?);
            }
        } else {
            return Ok(input.take());
        }

        if self.in_transition {
            let carried = input.take();
            self.finish_transition(&mut produced, carried, eos)?;
        }
        Ok(produced)
    }

    fn finish_transition(
        &mut self,
        produced: &mut Chunk,
        mut input: Chunk,
        eos: bool,
    ) -> Result<()> {
        self.fade_new.append(produced.take());

        if let Some(constant) = self.constant.as_mut() {
            // Switching away from constant-rate conversion: align its stream
            // by dropping its group delay once the fade window is covered.
            if self.correlation.is_none() {
                self.correlation = Some(constant.delay());
            }
            let mut old = Chunk::empty();
            if !input.is_empty() {
                old = constant.feed(&mut input)?;
            }
            if eos {
                old.append(constant.drain()?);
            }
            self.fade_old.append(old);
        } else {
            // Switching away from pass-through: the old stream is the input
            // itself and needs no alignment.
            self.correlation.get_or_insert(0);
            self.fade_old.append(input);
        }

        let fade_frames = (self.output_rate / 1000).max(1) as usize;
        let correlation = self.correlation.unwrap_or(0);

        if self.fade_new.frame_count() >= fade_frames
            && self.fade_old.frame_count() >= correlation + fade_frames
        {
            let old_count = self.fade_old.frame_count();
            self.fade_old.shrink_head(old_count - correlation);
            crossfade(&mut self.fade_new, &mut self.fade_old, fade_frames);
            *produced = self.fade_new.take();
            self.in_transition = false;
        } else if eos {
            *produced = self.fade_old.take();
            self.in_transition = false;
        }

        if !self.in_transition {
            self.fade_new = Chunk::empty();
            self.fade_old = Chunk::empty();
            self.correlation = None;
            self.constant = None;
            tracing::debug!("rate transition complete");
        }
        Ok(())
    }
}

impl Stage for RateConverter {
    fn name(&self) -> &'static str {
        "rate"
    }

    fn active(&self) -> bool {
        self.state != State::Passthrough || self.in_transition
    }

    fn process(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        if self.failed || !self.active() {
            return;
        }
        if chunk.is_empty() && !self.in_transition {
            return;
        }

        chunk.to_float();
        if self.state == State::Variable {
            self.update_variable_ratio();
        }

        let mut input = chunk.take();
        match self.run(&mut input, false) {
            Ok(produced) => *chunk = produced,
            Err(error) => {
                tracing::error!(%error, "rate conversion failed; passing audio through");
                self.failed = true;
                *chunk = input;
            }
        }
    }

    fn finish(&mut self, chunk: &mut Chunk, _params: &StageParams) {
        if self.failed || !self.active() {
            return;
        }

        chunk.to_float();
        let mut input = chunk.take();
        match self.run(&mut input, true) {
            Ok(produced) => *chunk = produced,
            Err(error) => {
                tracing::error!(%error, "rate drain failed");
                self.failed = true;
                *chunk = input;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_chunk(frames: usize, rate: u32, freq: f32, amplitude: f32, phase0: usize) -> Chunk {
        let mut chunk = Chunk::new(SampleFormat::Float32, 1, frames, rate);
        for (i, sample) in chunk.samples_f32_mut().iter_mut().enumerate() {
            let t = (phase0 + i) as f32 / rate as f32;
            *sample = amplitude * (2.0 * std::f32::consts::PI * freq * t).sin();
        }
        chunk
    }

    #[test]
    fn test_passthrough_is_inactive() {
        let mut rate = RateConverter::new();
        rate.initialize(false, 48_000, 48_000, 2).unwrap();
        assert!(!rate.active());

        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 64, 48_000);
        rate.process(&mut chunk, &StageParams::default());
        assert_eq!(chunk.format(), SampleFormat::Pcm16);
        assert_eq!(chunk.frame_count(), 64);
    }

    #[test]
    fn test_constant_conversion_exact_length() {
        let mut rate = RateConverter::new();
        rate.initialize(false, 44_100, 48_000, 1).unwrap();
        assert!(rate.active());

        let params = StageParams::default();
        let mut total = 0_usize;
        for i in 0..10 {
            let mut chunk = sine_chunk(4410, 44_100, 1000.0, 0.5, i * 4410);
            rate.process(&mut chunk, &params);
            assert!(chunk.is_empty() || chunk.rate() == 48_000);
            total += chunk.frame_count();
        }
        let mut tail = Chunk::empty();
        rate.finish(&mut tail, &params);
        total += tail.frame_count();

        // One second in, one second out.
        assert_eq!(total, 48_000);
    }

    #[test]
    fn test_constant_conversion_preserves_level() {
        let mut rate = RateConverter::new();
        rate.initialize(false, 44_100, 48_000, 1).unwrap();

        let params = StageParams::default();
        let mut output = Chunk::empty();
        for i in 0..10 {
            let mut chunk = sine_chunk(4410, 44_100, 1000.0, 0.5, i * 4410);
            rate.process(&mut chunk, &params);
            output.append(chunk);
        }
        let mut tail = Chunk::empty();
        rate.finish(&mut tail, &params);
        output.append(tail);

        // Skip the filter's leading transient, then check RMS ~ 0.5/sqrt(2).
        let samples = output.samples_f32();
        let steady = &samples[4800..samples.len() - 4800];
        let rms = (steady.iter().map(|s| s * s).sum::<f32>() / steady.len() as f32).sqrt();
        assert!((rms - 0.3536).abs() < 0.02, "rms {rms}");
    }

    #[test]
    fn test_drift_ratio_clamps_to_five_cents() {
        assert_eq!(drift_ratio(TICKS_PER_SEC, 1.0), RATIO_MAX);
        assert_eq!(drift_ratio(-TICKS_PER_SEC, 1.0), RATIO_MIN);
        let mild = drift_ratio(10_000, 1.0); // 1 ms of drift
        assert!(mild > 1.0 && mild < RATIO_MAX);
    }

    #[test]
    fn test_transition_to_variable_has_no_discontinuity() {
        let mut rate = RateConverter::new();
        rate.initialize(true, 48_000, 48_000, 1).unwrap();
        assert!(!rate.active(), "equal rates start in pass-through");

        let params = StageParams::default();
        let amplitude = 0.5_f32;
        let mut output = Chunk::empty();

        for i in 0..10 {
            let mut chunk = sine_chunk(480, 48_000, 1000.0, amplitude, i * 480);
            rate.process(&mut chunk, &params);
            output.append(chunk);
        }

        // 1 ms of drift: switches to the variable state via a cross-fade.
        rate.adjust(10_000);
        assert!(rate.active());

        for i in 10..60 {
            let mut chunk = sine_chunk(480, 48_000, 1000.0, amplitude, i * 480);
            rate.process(&mut chunk, &params);
            output.append(chunk);
        }
        let mut tail = Chunk::empty();
        rate.finish(&mut tail, &params);
        output.append(tail);

        // A 1 kHz sine at 48 kHz moves at most 2*pi*1000/48000 * amplitude
        // per sample. The cross-fade adds a bounded blend increment; a hard
        // switch would show a jump up to twice the amplitude.
        let samples = output.samples_f32();
        let max_step = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f32, f32::max);
        assert!(max_step < 0.1, "discontinuity {max_step}");

        // The stream kept flowing: ratio is clamped within 0.3%, so the
        // total can lag the input by at most the fade and filter windows.
        assert!(samples.len() > 26_000, "only {} frames emitted", samples.len());
    }
}
