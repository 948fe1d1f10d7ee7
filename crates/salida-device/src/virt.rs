//! A deterministic in-memory endpoint.
//!
//! The virtual endpoint implements the full endpoint contract without any
//! platform audio API: the device buffer is a counter, the device clock
//! only moves when a test calls [`VirtualDevice::advance`], and the
//! accepted exclusive formats are scriptable. Feeder and renderer tests
//! run against it with completely reproducible timing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use salida_core::{time, RefTime, SampleFormat, WaveFormat};

use crate::endpoint::{
    EndpointClient, EndpointClock, EndpointInfo, EndpointProvider, EndpointState, ShareMode,
};
use crate::sync::Event;
use crate::{Error, Result};

#[derive(Default)]
struct VirtualState {
    initialized: bool,
    exclusive: bool,
    rate: u32,
    frame_size: usize,
    buffer_frames: u32,
    padding: u32,
    position: u64,
    started: bool,
    data_frames: u64,
    silence_frames: u64,
    captured: Vec<u8>,
    wake: Option<Arc<Event>>,
}

/// One scriptable virtual render device.
pub struct VirtualDevice {
    mix: WaveFormat,
    event_capable: bool,
    accept_bitstream: AtomicBool,
    /// `None` accepts every PCM format; otherwise only the listed
    /// `(format, rate)` pairs pass the exclusive probe.
    exclusive_formats: Mutex<Option<Vec<(SampleFormat, u32)>>>,
    state: Mutex<VirtualState>,
}

impl VirtualDevice {
    fn with_mix(mix: WaveFormat, event_capable: bool) -> Arc<VirtualDevice> {
        Arc::new(VirtualDevice {
            mix,
            event_capable,
            accept_bitstream: AtomicBool::new(false),
            exclusive_formats: Mutex::new(None),
            state: Mutex::new(VirtualState::default()),
        })
    }

    /// A device whose mixer runs stereo float at `rate`.
    pub fn stereo_float(rate: u32) -> Arc<VirtualDevice> {
        VirtualDevice::with_mix(
            WaveFormat::new(
                SampleFormat::Float32,
                rate,
                2,
                salida_core::ChannelMask::STEREO,
            ),
            false,
        )
    }

    /// Like [`stereo_float`](Self::stereo_float) but signalling buffer
    /// readiness through an event.
    pub fn stereo_float_event(rate: u32) -> Arc<VirtualDevice> {
        VirtualDevice::with_mix(
            WaveFormat::new(
                SampleFormat::Float32,
                rate,
                2,
                salida_core::ChannelMask::STEREO,
            ),
            true,
        )
    }

    /// Restrict the exclusive-mode probe to the given `(format, rate)`
    /// pairs. An empty list rejects everything.
    pub fn set_exclusive_formats(&self, formats: &[(SampleFormat, u32)]) {
        *self.exclusive_formats.lock() = Some(formats.to_vec());
    }

    /// Accept bitstream formats in exclusive mode.
    pub fn set_accept_bitstream(&self, accept: bool) {
        self.accept_bitstream.store(accept, Ordering::Release);
    }

    /// Consume up to `frames` from the device buffer, advancing the device
    /// clock and firing the wake event.
    pub fn advance(&self, frames: u32) {
        let wake = {
            let mut state = self.state.lock();
            let consumed = state.padding.min(frames);
            state.padding -= consumed;
            state.position += u64::from(consumed);
            state.wake.clone()
        };
        if let Some(wake) = wake {
            wake.set();
        }
    }

    /// Fire the wake event without consuming anything.
    pub fn signal(&self) {
        if let Some(wake) = self.state.lock().wake.clone() {
            wake.set();
        }
    }

    /// Frames currently queued in the device buffer.
    pub fn padding(&self) -> u32 {
        self.state.lock().padding
    }

    /// Device buffer size in frames (0 before initialization).
    pub fn buffer_frames(&self) -> u32 {
        self.state.lock().buffer_frames
    }

    /// Frames the device clock has consumed.
    pub fn position_frames(&self) -> u64 {
        self.state.lock().position
    }

    /// Total data frames submitted (excludes silence).
    pub fn data_frames(&self) -> u64 {
        self.state.lock().data_frames
    }

    /// Total silent frames submitted.
    pub fn silence_frames(&self) -> u64 {
        self.state.lock().silence_frames
    }

    /// Every data byte submitted so far, across resets.
    pub fn captured(&self) -> Vec<u8> {
        self.state.lock().captured.clone()
    }

    /// Whether the stream is started.
    pub fn started(&self) -> bool {
        self.state.lock().started
    }
}

struct VirtualClient {
    device: Arc<VirtualDevice>,
    staging: Vec<u8>,
    staged_frames: u32,
}

impl EndpointClient for VirtualClient {
    fn mix_format(&self) -> Result<WaveFormat> {
        Ok(self.device.mix.clone())
    }

    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> Result<bool> {
        match mode {
            ShareMode::Shared => Ok(*format == self.device.mix),
            ShareMode::Exclusive => {
                if format.is_bitstream() {
                    return Ok(self.device.accept_bitstream.load(Ordering::Acquire));
                }
                Ok(match &*self.device.exclusive_formats.lock() {
                    None => format.format.is_pcm(),
                    Some(list) => list.contains(&(format.format, format.sample_rate)),
                })
            }
        }
    }

    fn event_capable(&self) -> bool {
        self.device.event_capable
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        event_driven: bool,
        buffer_duration: RefTime,
        format: &WaveFormat,
    ) -> Result<()> {
        if event_driven && !self.device.event_capable {
            return Err(Error::InvalidState("endpoint has no event support"));
        }
        let mut state = self.device.state.lock();
        if state.initialized {
            return Err(Error::InvalidState("endpoint already initialized"));
        }
        state.initialized = true;
        state.exclusive = mode == ShareMode::Exclusive;
        state.rate = format.sample_rate;
        state.frame_size = format.frame_size();
        state.buffer_frames = time::ticks_to_frames(buffer_duration, format.sample_rate) as u32;
        state.padding = 0;
        state.position = 0;
        Ok(())
    }

    fn set_event(&mut self, event: Arc<Event>) -> Result<()> {
        self.device.state.lock().wake = Some(event);
        Ok(())
    }

    fn buffer_size(&self) -> Result<u32> {
        let state = self.device.state.lock();
        if !state.initialized {
            return Err(Error::InvalidState("endpoint not initialized"));
        }
        Ok(state.buffer_frames)
    }

    fn current_padding(&self) -> Result<u32> {
        Ok(self.device.state.lock().padding)
    }

    fn render_buffer(&mut self, frames: u32) -> Result<&mut [u8]> {
        let state = self.device.state.lock();
        if !state.initialized {
            return Err(Error::InvalidState("endpoint not initialized"));
        }
        if !state.exclusive && state.padding + frames > state.buffer_frames {
            return Err(Error::Endpoint("device buffer overrun".to_string()));
        }
        let bytes = frames as usize * state.frame_size;
        drop(state);
        self.staging.clear();
        self.staging.resize(bytes, 0);
        self.staged_frames = frames;
        Ok(&mut self.staging)
    }

    fn release_buffer(&mut self, frames: u32, silent: bool) -> Result<()> {
        if frames > self.staged_frames {
            return Err(Error::InvalidState("releasing more frames than acquired"));
        }
        let mut state = self.device.state.lock();
        if silent {
            state.silence_frames += u64::from(frames);
        } else {
            let bytes = frames as usize * state.frame_size;
            let staged = &self.staging[..bytes];
            state.captured.extend_from_slice(staged);
            state.data_frames += u64::from(frames);
        }
        state.padding = (state.padding + frames).min(state.buffer_frames);
        drop(state);
        self.staged_frames = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.device.state.lock().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.device.state.lock().started = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut state = self.device.state.lock();
        state.padding = 0;
        state.position = 0;
        Ok(())
    }

    fn stream_latency(&self) -> Result<RefTime> {
        Ok(5 * salida_core::TICKS_PER_MS)
    }

    fn clock(&self) -> Result<Arc<dyn EndpointClock>> {
        Ok(Arc::new(VirtualClock {
            device: Arc::clone(&self.device),
        }))
    }
}

struct VirtualClock {
    device: Arc<VirtualDevice>,
}

impl EndpointClock for VirtualClock {
    fn frequency(&self) -> Result<u64> {
        let state = self.device.state.lock();
        if state.rate == 0 {
            return Err(Error::InvalidState("endpoint not initialized"));
        }
        Ok(u64::from(state.rate))
    }

    fn position(&self) -> Result<(u64, RefTime)> {
        Ok((self.device.state.lock().position, time::counter()))
    }
}

/// A provider over one or more virtual devices.
pub struct VirtualProvider {
    devices: Vec<(EndpointInfo, Arc<VirtualDevice>)>,
    default_id: String,
    default_serial: Mutex<Option<Arc<AtomicU32>>>,
}

impl VirtualProvider {
    /// A provider exposing `device` as the only (and default) endpoint.
    pub fn single(device: Arc<VirtualDevice>) -> VirtualProvider {
        let info = EndpointInfo {
            id: "virtual-0".to_string(),
            adapter_name: "Virtual Audio".to_string(),
            endpoint_name: "Virtual Output".to_string(),
            state: EndpointState::Active,
        };
        VirtualProvider {
            default_id: info.id.clone(),
            devices: vec![(info, device)],
            default_serial: Mutex::new(None),
        }
    }

    /// Simulate a default-device change notification.
    pub fn bump_default(&self) {
        if let Some(serial) = &*self.default_serial.lock() {
            serial.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl EndpointProvider for Arc<VirtualProvider> {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        (**self).endpoints()
    }

    fn default_endpoint_id(&self) -> Result<String> {
        (**self).default_endpoint_id()
    }

    fn activate(&self, id: &str) -> Result<Box<dyn EndpointClient>> {
        (**self).activate(id)
    }

    fn watch_default_changes(&self, serial: Arc<AtomicU32>) {
        (**self).watch_default_changes(serial);
    }
}

impl EndpointProvider for VirtualProvider {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        Ok(self.devices.iter().map(|(info, _)| info.clone()).collect())
    }

    fn default_endpoint_id(&self) -> Result<String> {
        Ok(self.default_id.clone())
    }

    fn activate(&self, id: &str) -> Result<Box<dyn EndpointClient>> {
        let device = self
            .devices
            .iter()
            .find(|(info, _)| info.id == id)
            .map(|(_, device)| Arc::clone(device))
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        Ok(Box::new(VirtualClient {
            device,
            staging: Vec::new(),
            staged_frames: 0,
        }))
    }

    fn watch_default_changes(&self, serial: Arc<AtomicU32>) {
        *self.default_serial.lock() = Some(serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_consumes_padding() {
        let device = VirtualDevice::stereo_float(48_000);
        let provider = VirtualProvider::single(Arc::clone(&device));
        let mut client = provider.activate("virtual-0").unwrap();

        let format = device.mix.clone();
        client
            .initialize(ShareMode::Shared, false, 100 * salida_core::TICKS_PER_MS, &format)
            .unwrap();
        assert_eq!(client.buffer_size().unwrap(), 4800);

        let buffer = client.render_buffer(480).unwrap();
        assert_eq!(buffer.len(), 480 * 8);
        client.release_buffer(480, false).unwrap();
        assert_eq!(device.padding(), 480);

        device.advance(100);
        assert_eq!(device.padding(), 380);
        assert_eq!(device.position_frames(), 100);
    }

    #[test]
    fn test_overrun_rejected_in_shared_mode() {
        let device = VirtualDevice::stereo_float(48_000);
        let provider = VirtualProvider::single(Arc::clone(&device));
        let mut client = provider.activate("virtual-0").unwrap();
        let format = device.mix.clone();
        client
            .initialize(ShareMode::Shared, false, 10 * salida_core::TICKS_PER_MS, &format)
            .unwrap();

        // Buffer is 480 frames; writing 481 must fail.
        assert!(client.render_buffer(481).is_err());
    }

    #[test]
    fn test_silent_release_counts_separately() {
        let device = VirtualDevice::stereo_float(48_000);
        let provider = VirtualProvider::single(Arc::clone(&device));
        let mut client = provider.activate("virtual-0").unwrap();
        let format = device.mix.clone();
        client
            .initialize(ShareMode::Shared, false, 100 * salida_core::TICKS_PER_MS, &format)
            .unwrap();

        client.render_buffer(100).unwrap();
        client.release_buffer(100, true).unwrap();
        assert_eq!(device.silence_frames(), 100);
        assert_eq!(device.data_frames(), 0);
        assert!(device.captured().is_empty());
    }
}
