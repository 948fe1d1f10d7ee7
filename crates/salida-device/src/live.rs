//! A live (hardware) endpoint over cpal.
//!
//! Implements the endpoint contract for real output devices in shared
//! mode: the device buffer is a ring the feeder writes into and the cpal
//! output callback drains. Exclusive mode, bitstreaming, and event-driven
//! feeding have no cpal equivalent and are rejected, which routes this
//! endpoint through the polling feeder.
//!
//! cpal streams are not movable between threads on every platform, so each
//! client hosts its stream on a dedicated thread and drives it through a
//! command channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use salida_core::{time, ChannelMask, RefTime, SampleFormat, WaveFormat, TICKS_PER_MS};

use crate::endpoint::{
    EndpointClient, EndpointClock, EndpointInfo, EndpointProvider, EndpointState, ShareMode,
};
use crate::sync::Event;
use crate::{Error, Result};

fn stream_error(error: impl std::fmt::Display) -> Error {
    Error::Endpoint(error.to_string())
}

/// A provider over the platform's cpal output devices.
pub struct CpalProvider {
    host: cpal::Host,
}

impl CpalProvider {
    /// Use the platform's default audio host.
    pub fn new() -> CpalProvider {
        let host = cpal::default_host();
        tracing::info!(host = host.id().name(), "cpal endpoint provider");
        CpalProvider { host }
    }
}

impl Default for CpalProvider {
    fn default() -> CpalProvider {
        CpalProvider::new()
    }
}

impl EndpointProvider for CpalProvider {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        let adapter = self.host.id().name().to_string();
        let devices = self.host.output_devices().map_err(stream_error)?;
        Ok(devices
            .filter_map(|device| device.name().ok())
            .map(|name| EndpointInfo {
                id: name.clone(),
                adapter_name: adapter.clone(),
                endpoint_name: name,
                state: EndpointState::Active,
            })
            .collect())
    }

    fn default_endpoint_id(&self) -> Result<String> {
        self.host
            .default_output_device()
            .and_then(|device| device.name().ok())
            .ok_or(Error::DeviceNotFound("no default output device".to_string()))
    }

    fn activate(&self, id: &str) -> Result<Box<dyn EndpointClient>> {
        let device = self
            .host
            .output_devices()
            .map_err(stream_error)?
            .find(|device| device.name().map(|name| name == id).unwrap_or(false))
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

        let config = device.default_output_config().map_err(stream_error)?;
        let mix = WaveFormat::new(
            SampleFormat::Float32,
            config.sample_rate(),
            u32::from(config.channels()),
            ChannelMask::default_for(u32::from(config.channels())),
        );

        Ok(Box::new(CpalClient {
            device_name: id.to_string(),
            mix,
            format: None,
            capacity_frames: 0,
            ring: Arc::new(Mutex::new(VecDeque::new())),
            consumed: Arc::new(AtomicU64::new(0)),
            commands: None,
            thread: None,
            staging: Vec::new(),
            staged_frames: 0,
        }))
    }
}

enum StreamCommand {
    Play,
    Pause,
    Exit,
}

struct CpalClient {
    device_name: String,
    mix: WaveFormat,
    format: Option<WaveFormat>,
    capacity_frames: u32,
    /// Interleaved f32 samples queued for the output callback.
    ring: Arc<Mutex<VecDeque<f32>>>,
    /// Frames the callback has consumed (the device clock).
    consumed: Arc<AtomicU64>,
    commands: Option<Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
    staging: Vec<u8>,
    staged_frames: u32,
}

fn host_stream(
    device_name: String,
    format: WaveFormat,
    ring: Arc<Mutex<VecDeque<f32>>>,
    consumed: Arc<AtomicU64>,
    ready: Sender<std::result::Result<(), String>>,
    commands: crossbeam_channel::Receiver<StreamCommand>,
) {
    let channels = format.channels as usize;

    let build = (|| -> std::result::Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| e.to_string())?
            .find(|device| {
                device
                    .name()
                    .map(|name| name == device_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| format!("device '{device_name}' disappeared"))?;

        let config = cpal::StreamConfig {
            channels: format.channels as u16,
            sample_rate: format.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut ring = ring.lock();
                    let take = data.len().min(ring.len());
                    for sample in &mut data[..take] {
                        *sample = ring.pop_front().unwrap_or(0.0);
                    }
                    data[take..].fill(0.0);
                    consumed.fetch_add((data.len() / channels) as u64, Ordering::AcqRel);
                },
                |error| tracing::error!(%error, "cpal stream error"),
                None,
            )
            .map_err(|e| e.to_string())
    })();

    let stream = match build {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(message) => {
            let _ = ready.send(Err(message));
            return;
        }
    };

    for command in commands {
        let result = match command {
            StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
            StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
            StreamCommand::Exit => break,
        };
        if let Err(error) = result {
            tracing::error!(%error, "cpal stream command failed");
        }
    }
}

impl CpalClient {
    fn send(&self, command: StreamCommand) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?
            .send(command)
            .map_err(|_| Error::Endpoint("stream host thread is gone".to_string()))
    }
}

impl EndpointClient for CpalClient {
    fn mix_format(&self) -> Result<WaveFormat> {
        Ok(self.mix.clone())
    }

    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> Result<bool> {
        Ok(mode == ShareMode::Shared && *format == self.mix)
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        event_driven: bool,
        buffer_duration: RefTime,
        format: &WaveFormat,
    ) -> Result<()> {
        if mode != ShareMode::Shared {
            return Err(Error::InvalidState("cpal endpoint is shared-mode only"));
        }
        if event_driven {
            return Err(Error::InvalidState("cpal endpoint has no event support"));
        }
        if self.thread.is_some() {
            return Err(Error::InvalidState("endpoint already initialized"));
        }
        if format.format != SampleFormat::Float32 {
            return Err(Error::UnsupportedFormat);
        }

        self.capacity_frames =
            time::ticks_to_frames(buffer_duration, format.sample_rate).max(1) as u32;
        self.format = Some(format.clone());

        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = bounded(16);
        let thread = {
            let device_name = self.device_name.clone();
            let format = format.clone();
            let ring = Arc::clone(&self.ring);
            let consumed = Arc::clone(&self.consumed);
            std::thread::spawn(move || {
                host_stream(device_name, format, ring, consumed, ready_tx, command_rx);
            })
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.commands = Some(command_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(Error::Endpoint(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Endpoint("stream host thread died".to_string()))
            }
        }
    }

    fn set_event(&mut self, _event: Arc<Event>) -> Result<()> {
        Err(Error::InvalidState("cpal endpoint has no event support"))
    }

    fn buffer_size(&self) -> Result<u32> {
        if self.format.is_none() {
            return Err(Error::InvalidState("endpoint not initialized"));
        }
        Ok(self.capacity_frames)
    }

    fn current_padding(&self) -> Result<u32> {
        let format = self
            .format
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        Ok((self.ring.lock().len() / format.channels as usize) as u32)
    }

    fn render_buffer(&mut self, frames: u32) -> Result<&mut [u8]> {
        let format = self
            .format
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        let bytes = frames as usize * format.frame_size();
        self.staging.clear();
        self.staging.resize(bytes, 0);
        self.staged_frames = frames;
        Ok(&mut self.staging)
    }

    fn release_buffer(&mut self, frames: u32, silent: bool) -> Result<()> {
        if frames > self.staged_frames {
            return Err(Error::InvalidState("releasing more frames than acquired"));
        }
        let format = self
            .format
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        let channels = format.channels as usize;
        let samples = frames as usize * channels;
        let capacity = self.capacity_frames as usize * channels;

        let mut ring = self.ring.lock();
        if silent {
            for _ in 0..samples {
                if ring.len() >= capacity {
                    break;
                }
                ring.push_back(0.0);
            }
        } else {
            for raw in self.staging[..samples * 4].chunks_exact(4) {
                if ring.len() >= capacity {
                    break;
                }
                ring.push_back(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]));
            }
        }
        drop(ring);
        self.staged_frames = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.send(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<()> {
        self.send(StreamCommand::Pause)
    }

    fn reset(&mut self) -> Result<()> {
        self.ring.lock().clear();
        self.consumed.store(0, Ordering::Release);
        Ok(())
    }

    fn stream_latency(&self) -> Result<RefTime> {
        Ok(10 * TICKS_PER_MS)
    }

    fn clock(&self) -> Result<Arc<dyn EndpointClock>> {
        let format = self
            .format
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        Ok(Arc::new(CpalClock {
            consumed: Arc::clone(&self.consumed),
            rate: format.sample_rate,
        }))
    }
}

impl Drop for CpalClient {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(StreamCommand::Exit);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct CpalClock {
    consumed: Arc<AtomicU64>,
    rate: u32,
}

impl EndpointClock for CpalClock {
    fn frequency(&self) -> Result<u64> {
        Ok(u64::from(self.rate))
    }

    fn position(&self) -> Result<(u64, RefTime)> {
        Ok((self.consumed.load(Ordering::Acquire), time::counter()))
    }
}
