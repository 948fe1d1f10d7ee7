//! The renderer orchestrator.
//!
//! Owns the DSP pipeline, one feeder, the timing-correction state, and the
//! graph clock, and drives them from the sample source's calls. The state
//! machine is `{Stopped, Paused, Running}`; a device and DSP configuration
//! exist only after `set_format`, and mid-stream format changes pass
//! through `Stopped` before restoring the previous state.
//!
//! Locking: the renderer mutex covers the DSP stack, the feeder handle,
//! and the timing state. The blocking part of `enqueue`/`finish` (waiting
//! for device buffer space) happens *outside* the mutex, pacing on the
//! flush event, so `begin_flush` can always interrupt from any thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use salida_config::SettingsStore;
use salida_core::{Chunk, RefTime, SharedWaveFormat, WaveFormat, TICKS_PER_MS};
use salida_device::{
    CreateParams, DeviceDescriptor, DeviceManager, EndpointProvider, Event, Feeder,
};
use salida_dsp::{
    Balance, ChannelMatrix, Crossfeed, Dither, PeakLimiter, RateConverter, Stage, StageParams,
    TempoStretch, Volume,
};

use crate::clock::GraphClock;
use crate::correction::SampleCorrection;
use crate::sample::Sample;
use crate::{Error, Result};

/// Renderer playback state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    /// No playback; the backend is released.
    Stopped,
    /// Device open, clock free-running.
    Paused,
    /// Device running, graph clock slaved.
    Running,
}

/// The fixed-order DSP stack.
#[derive(Default)]
struct Pipeline {
    matrix: ChannelMatrix,
    rate: RateConverter,
    tempo: TempoStretch,
    crossfeed: Crossfeed,
    volume: Volume,
    balance: Balance,
    limiter: PeakLimiter,
    dither: Dither,
}

impl Pipeline {
    fn process(&mut self, chunk: &mut Chunk, params: &StageParams) {
        self.matrix.process(chunk, params);
        self.rate.process(chunk, params);
        self.tempo.process(chunk, params);
        self.crossfeed.process(chunk, params);
        self.volume.process(chunk, params);
        self.balance.process(chunk, params);
        self.limiter.process(chunk, params);
        self.dither.process(chunk, params);
    }

    fn finish(&mut self, chunk: &mut Chunk, params: &StageParams) {
        self.matrix.finish(chunk, params);
        self.rate.finish(chunk, params);
        self.tempo.finish(chunk, params);
        self.crossfeed.finish(chunk, params);
        self.volume.finish(chunk, params);
        self.balance.finish(chunk, params);
        self.limiter.finish(chunk, params);
        self.dither.finish(chunk, params);
    }
}

struct RendererInner {
    state: PlayState,
    input_format: Option<SharedWaveFormat>,
    feeder: Option<Feeder>,
    correction: SampleCorrection,
    pipeline: Pipeline,
    playback_rate: f64,
    volume: f32,
    balance: f32,
    realtime: bool,
    settings_serial: u32,
    device_serial: u32,
    last_timings_error: RefTime,
}

/// The audio renderer. See the module docs for the threading contract.
pub struct Renderer {
    inner: Mutex<RendererInner>,
    flush: Event,
    buffer_filled: Event,
    clock: Arc<GraphClock>,
    manager: DeviceManager,
    settings: Arc<SettingsStore>,
}

impl Renderer {
    /// Create a renderer over an endpoint provider and a settings store.
    ///
    /// The provider moves onto the device-manager worker; its
    /// default-device notifications are subscribed here and torn down when
    /// the renderer drops.
    pub fn new(provider: Box<dyn EndpointProvider>, settings: Arc<SettingsStore>) -> Renderer {
        Renderer {
            inner: Mutex::new(RendererInner {
                state: PlayState::Stopped,
                input_format: None,
                feeder: None,
                correction: SampleCorrection::new(),
                pipeline: Pipeline::default(),
                playback_rate: 1.0,
                volume: 1.0,
                balance: 0.0,
                realtime: false,
                settings_serial: 0,
                device_serial: 0,
                last_timings_error: 0,
            }),
            flush: Event::manual_reset(),
            buffer_filled: Event::manual_reset(),
            clock: Arc::new(GraphClock::new()),
            manager: DeviceManager::new(provider),
            settings,
        }
    }

    /// The graph reference clock.
    pub fn graph_clock(&self) -> Arc<GraphClock> {
        Arc::clone(&self.clock)
    }

    /// Current playback state.
    pub fn state(&self) -> PlayState {
        self.inner.lock().state
    }

    /// The configured input format, if any.
    pub fn input_format(&self) -> Option<SharedWaveFormat> {
        self.inner.lock().input_format.clone()
    }

    /// The open device's negotiated properties, if any.
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.inner
            .lock()
            .feeder
            .as_ref()
            .map(|feeder| feeder.descriptor().clone())
    }

    /// Master volume in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Set the master volume.
    pub fn set_volume(&self, volume: f32) {
        self.inner.lock().volume = volume.clamp(0.0, 1.0);
    }

    /// Stereo balance in `[-1, 1]`.
    pub fn balance(&self) -> f32 {
        self.inner.lock().balance
    }

    /// Set the stereo balance.
    pub fn set_balance(&self, balance: f32) {
        self.inner.lock().balance = balance.clamp(-1.0, 1.0);
    }

    /// Whether the default render endpoint changed since the current
    /// backend was created.
    pub fn default_device_changed(&self) -> bool {
        let inner = self.inner.lock();
        inner.feeder.is_some() && inner.device_serial != self.manager.default_device_serial()
    }

    /// Whether the sample source may deliver `format`.
    ///
    /// PCM and float families are always accepted; bitstream formats need
    /// the settings opt-in and an endpoint that takes them exclusively.
    pub fn check_format(&self, format: &WaveFormat) -> Result<()> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(salida_device::Error::UnsupportedFormat.into());
        }
        if format.is_bitstream() && !self.bitstream_supported(format) {
            return Err(salida_device::Error::UnsupportedFormat.into());
        }
        Ok(())
    }

    /// Whether `format` can be bitstreamed to the configured endpoint.
    pub fn bitstream_supported(&self, format: &WaveFormat) -> bool {
        if !self.settings.allow_bitstreaming() {
            return false;
        }
        let (endpoint_id, _, _) = self.settings.output_device();
        self.manager.bitstream_supported(endpoint_id, format.clone())
    }

    /// Open a device for `format` and configure the DSP stack.
    ///
    /// Only valid outside `Running`. `realtime` marks a live source and
    /// enables the drift-corrected feed path.
    pub fn set_format(&self, format: WaveFormat, realtime: bool) -> Result<()> {
        self.set_format_shared(Arc::new(format), realtime)
    }

    fn set_format_shared(&self, format: SharedWaveFormat, realtime: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == PlayState::Running {
            return Err(Error::InvalidState("format change while running"));
        }
        if format.is_bitstream() && !self.settings.allow_bitstreaming() {
            return Err(salida_device::Error::UnsupportedFormat.into());
        }

        let (endpoint_id, exclusive, buffer_ms) = self.settings.output_device();
        let params = CreateParams {
            endpoint_id,
            exclusive,
            buffer_ms,
            realtime,
            force_poll: false,
        };

        // Release the previous backend before opening the next one.
        inner.feeder = None;

        let backend = self.manager.create_device(params, (*format).clone())?;
        inner.device_serial = self.manager.default_device_serial();
        inner.feeder = Some(Feeder::new(backend)?);
        inner.input_format = Some(Arc::clone(&format));
        inner.realtime = realtime;
        inner.correction.new_format(format);
        inner.correction.new_buffer();

        self.initialize_pipeline(&mut inner)
    }

    fn initialize_pipeline(&self, inner: &mut RendererInner) -> Result<()> {
        inner.settings_serial = self.settings.serial();
        inner.last_timings_error = 0;

        let Some(input) = inner.input_format.clone() else {
            return Ok(());
        };
        let Some(feeder) = inner.feeder.as_ref() else {
            return Ok(());
        };
        let descriptor = feeder.descriptor().clone();
        if descriptor.bitstream {
            return Ok(());
        }

        let output = descriptor.wave_format;
        let input_mask = input.layout();
        let output_mask = output.layout();

        inner.pipeline.matrix.initialize(
            input.channels,
            input_mask,
            output.channels,
            output_mask,
        );
        inner.pipeline.rate.initialize(
            descriptor.realtime,
            input.sample_rate,
            output.sample_rate,
            output.channels,
        )?;
        inner
            .pipeline
            .tempo
            .initialize(inner.playback_rate, output.sample_rate, output.channels);

        let crossfeed = self.settings.crossfeed();
        inner.pipeline.crossfeed.initialize(
            crossfeed.enabled,
            crossfeed.cutoff_hz,
            crossfeed.level,
            output.sample_rate,
            output.channels,
            output_mask,
        );
        inner.pipeline.limiter.initialize(
            output.sample_rate,
            descriptor.exclusive,
            self.settings.peak_limiter_shared_mode(),
        );
        inner.pipeline.dither.initialize(descriptor.dsp_format);
        Ok(())
    }

    fn refresh_settings(&self, inner: &mut RendererInner, descriptor: &DeviceDescriptor) {
        let serial = self.settings.serial();
        if serial == inner.settings_serial {
            return;
        }
        inner.settings_serial = serial;

        let crossfeed = self.settings.crossfeed();
        let output = &descriptor.wave_format;
        inner.pipeline.crossfeed.initialize(
            crossfeed.enabled,
            crossfeed.cutoff_hz,
            crossfeed.level,
            output.sample_rate,
            output.channels,
            output.layout(),
        );
        tracing::debug!(serial, "settings refreshed");
    }

    /// Begin a playback segment at `rate`. Resets timing correction and
    /// re-initializes the rate and tempo stages; the rest of the DSP stack
    /// keeps its state.
    pub fn new_segment(&self, rate: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.playback_rate = rate;
        inner.correction.new_segment(rate);
        inner.last_timings_error = 0;

        let descriptor = inner.feeder.as_ref().map(|f| f.descriptor().clone());
        if let (Some(input), Some(descriptor)) = (inner.input_format.clone(), descriptor) {
            if !descriptor.bitstream {
                let output = descriptor.wave_format;
                inner.pipeline.rate.initialize(
                    descriptor.realtime,
                    input.sample_rate,
                    output.sample_rate,
                    output.channels,
                )?;
                inner
                    .pipeline
                    .tempo
                    .initialize(rate, output.sample_rate, output.channels);
            }
        }
        Ok(())
    }

    /// Run one sample through correction and the DSP pipeline, then hand
    /// the result to the feeder.
    ///
    /// Returns `Ok(false)` when interrupted by a pending flush. A
    /// `format_changed` sample must carry the new format; the renderer
    /// drains, reopens the device, and restores the previous play state.
    pub fn enqueue(&self, sample: Sample) -> Result<bool> {
        if self.flush.is_set() {
            return Ok(false);
        }

        if sample.format_changed {
            match sample.new_format.clone() {
                Some(format) => self.change_format(format)?,
                None => {
                    return Err(Error::InvalidState(
                        "format-change sample carries no media format",
                    ))
                }
            }
        }

        let (chunk, buffer_ms) = {
            let mut inner = self.inner.lock();
            if inner.state == PlayState::Stopped {
                return Err(Error::InvalidState("enqueue while stopped"));
            }
            let descriptor = match inner.feeder.as_ref() {
                Some(feeder) => feeder.descriptor().clone(),
                None => return Err(Error::InvalidState("no format set")),
            };

            self.refresh_settings(&mut inner, &descriptor);

            let mut chunk = inner.correction.process(&sample);

            // Live sources: feed stamp drift into the variable-rate stage.
            if descriptor.realtime {
                let error = inner.correction.timings_error();
                let delta = error - inner.last_timings_error;
                if delta != 0 {
                    inner.last_timings_error = error;
                    inner.pipeline.rate.adjust(delta);
                }
            }

            if chunk.is_empty() {
                return Ok(true);
            }
            if !descriptor.bitstream {
                let params = StageParams {
                    volume: inner.volume,
                    balance: inner.balance,
                };
                inner.pipeline.process(&mut chunk, &params);
                chunk.to_format(descriptor.dsp_format);
            }
            (chunk, descriptor.buffer_duration_ms)
        };

        self.push_chunk(chunk, buffer_ms)
    }

    fn push_chunk(&self, mut chunk: Chunk, buffer_ms: u32) -> Result<bool> {
        let mut first = true;
        loop {
            if chunk.is_empty() {
                return Ok(true);
            }

            // The device buffer was full on the previous pass: sleep until
            // it may have drained, unless a flush interrupts.
            if !first {
                let pause = Duration::from_millis(u64::from((buffer_ms / 4).max(1)));
                if self.flush.wait_timeout(pause) {
                    return Ok(false);
                }
            }
            first = false;

            let inner = self.inner.lock();
            let Some(feeder) = inner.feeder.as_ref() else {
                return Ok(false);
            };
            feeder.push(&mut chunk, Some(&self.buffer_filled))?;
        }
    }

    /// Flush the DSP stack into the device and mark end-of-stream.
    ///
    /// With `block_until_end`, waits until the device has played
    /// everything; returns `Ok(false)` when a flush interrupts either
    /// phase.
    pub fn finish(&self, block_until_end: bool) -> Result<bool> {
        if self.flush.is_set() {
            return Ok(false);
        }

        let (chunk, buffer_ms) = {
            let mut inner = self.inner.lock();
            if inner.state == PlayState::Stopped {
                return Err(Error::InvalidState("finish while stopped"));
            }
            let descriptor = match inner.feeder.as_ref() {
                Some(feeder) => feeder.descriptor().clone(),
                None => return Err(Error::InvalidState("no format set")),
            };

            let mut chunk = Chunk::empty();
            if !descriptor.bitstream {
                let params = StageParams {
                    volume: inner.volume,
                    balance: inner.balance,
                };
                inner.pipeline.finish(&mut chunk, &params);
                chunk.to_format(descriptor.dsp_format);
            }
            (chunk, descriptor.buffer_duration_ms)
        };

        if !self.push_chunk(chunk, buffer_ms)? {
            return Ok(false);
        }

        let target = {
            let mut inner = self.inner.lock();
            match inner.feeder.as_mut() {
                Some(feeder) => {
                    feeder.finish(Some(&self.buffer_filled))?;
                    feeder.end_of_stream_position()
                }
                None => 0,
            }
        };

        if block_until_end {
            self.block_until_end(target)
        } else {
            Ok(true)
        }
    }

    /// Poll the device position until it reaches the end-of-stream mark.
    /// The silence feed keeps pushing past the mark, so the comparison is
    /// against the captured target, not the growing feed position.
    fn block_until_end(&self, target: RefTime) -> Result<bool> {
        self.clock.unslave();
        loop {
            let position = {
                let inner = self.inner.lock();
                let Some(feeder) = inner.feeder.as_ref() else {
                    return Ok(true);
                };
                feeder.position()?
            };
            if position >= target {
                return Ok(true);
            }

            let wait = ((target - position) / TICKS_PER_MS).max(1) as u64;
            if self.flush.wait_timeout(Duration::from_millis(wait)) {
                return Ok(false);
            }
        }
    }

    /// Signal a flush: every blocking wait returns false promptly. Never
    /// fails; safe from any thread.
    pub fn begin_flush(&self) {
        self.flush.set();
    }

    /// Complete a flush: reset the device, drop buffered DSP state, and
    /// re-arm for new samples.
    pub fn end_flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !self.flush.is_set() {
            return Err(Error::InvalidState("end_flush without begin_flush"));
        }

        if let Some(feeder) = inner.feeder.as_mut() {
            feeder.reset()?;
        }
        self.buffer_filled.reset();
        inner.correction.new_buffer();
        self.initialize_pipeline(&mut inner)?;
        self.flush.reset();
        Ok(())
    }

    /// Start playback: slave the graph clock to the device clock at
    /// `start_time` and start the device.
    pub fn play(&self, start_time: RefTime) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == PlayState::Running {
            return Err(Error::InvalidState("already running"));
        }
        let Some(feeder) = inner.feeder.as_ref() else {
            return Err(Error::InvalidState("no format set"));
        };

        self.clock.slave(feeder.clock(), start_time);
        feeder.start()?;
        inner.state = PlayState::Running;
        tracing::info!(start_time, "playback running");
        Ok(())
    }

    /// Pause playback: unslave the clock and stop the device, keeping its
    /// buffer.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.clock.unslave();
        if let Some(feeder) = inner.feeder.as_ref() {
            feeder.stop()?;
        }
        inner.state = PlayState::Paused;
        tracing::info!("playback paused");
        Ok(())
    }

    /// Stop playback. Implies a flush, tears down the feeder worker, and
    /// releases the backend; `set_format` re-arms the renderer.
    pub fn stop(&self) -> Result<()> {
        // Break any blocking push before taking the lock.
        self.flush.set();

        let mut inner = self.inner.lock();
        self.clock.unslave();
        if let Some(feeder) = inner.feeder.take() {
            let _ = feeder.stop();
        }
        inner.state = PlayState::Stopped;

        let format = inner.input_format.clone();
        inner.correction = SampleCorrection::new();
        if let Some(format) = format {
            inner.correction.new_format(format);
        }
        inner.last_timings_error = 0;

        self.buffer_filled.reset();
        self.flush.reset();
        tracing::info!("playback stopped");
        Ok(())
    }

    fn change_format(&self, format: SharedWaveFormat) -> Result<()> {
        let (previous, realtime) = {
            let inner = self.inner.lock();
            (inner.state, inner.realtime)
        };
        tracing::info!(?previous, "mid-stream format change");

        // Drain whatever the DSP stack holds into the old device.
        let _ = self.finish(false)?;
        if previous != PlayState::Stopped {
            self.stop()?;
        }
        self.set_format_shared(format, realtime)?;

        match previous {
            PlayState::Running => self.play(self.clock.time()),
            PlayState::Paused => {
                self.inner.lock().state = PlayState::Paused;
                Ok(())
            }
            PlayState::Stopped => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let stopped = self.inner.lock().state == PlayState::Stopped;
        if !stopped {
            let _ = self.stop();
        }
    }
}
