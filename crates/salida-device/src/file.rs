//! A WAV-file endpoint.
//!
//! Renders to a file instead of hardware: the "device" consumes frames the
//! moment they are released, so the feeder drains whole chunks in one
//! pass and the device clock tracks exactly what has been written. Useful
//! for offline rendering and for end-to-end tests that want to inspect
//! the audio that actually reached the endpoint.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use salida_core::{time, RefTime, SampleFormat, WaveFormat};

use crate::endpoint::{
    EndpointClient, EndpointClock, EndpointInfo, EndpointProvider, EndpointState, ShareMode,
};
use crate::sync::Event;
use crate::{Error, Result};

fn wav_error(error: hound::Error) -> Error {
    Error::Endpoint(format!("wav: {error}"))
}

/// A provider exposing one endpoint that writes a WAV file.
pub struct WavFileProvider {
    path: PathBuf,
    mix: WaveFormat,
}

impl WavFileProvider {
    /// Render into `path` with the given mixer format (the format shared
    /// mode adopts). Only float32 and 16-bit PCM are supported.
    pub fn new(path: impl AsRef<Path>, mix: WaveFormat) -> WavFileProvider {
        WavFileProvider {
            path: path.as_ref().to_path_buf(),
            mix,
        }
    }
}

impl EndpointProvider for WavFileProvider {
    fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        Ok(vec![EndpointInfo {
            id: "wav-file".to_string(),
            adapter_name: "File".to_string(),
            endpoint_name: self.path.display().to_string(),
            state: EndpointState::Active,
        }])
    }

    fn default_endpoint_id(&self) -> Result<String> {
        Ok("wav-file".to_string())
    }

    fn activate(&self, id: &str) -> Result<Box<dyn EndpointClient>> {
        if id != "wav-file" {
            return Err(Error::DeviceNotFound(id.to_string()));
        }
        Ok(Box::new(WavFileClient {
            path: self.path.clone(),
            mix: self.mix.clone(),
            writer: None,
            format: None,
            buffer_frames: 0,
            staging: Vec::new(),
            staged_frames: 0,
            written: Arc::new(AtomicU64::new(0)),
            started: false,
        }))
    }
}

struct WavFileClient {
    path: PathBuf,
    mix: WaveFormat,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    format: Option<WaveFormat>,
    buffer_frames: u32,
    staging: Vec<u8>,
    staged_frames: u32,
    written: Arc<AtomicU64>,
    started: bool,
}

impl WavFileClient {
    fn write_frames(&mut self, frames: u32, silent: bool) -> Result<()> {
        let format = self
            .format
            .clone()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        let writer = self
            .writer
            .as_mut()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;

        let samples = frames as usize * format.channels as usize;
        match format.format {
            SampleFormat::Float32 => {
                for i in 0..samples {
                    let sample = if silent {
                        0.0
                    } else {
                        let raw = &self.staging[i * 4..i * 4 + 4];
                        f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])
                    };
                    writer.write_sample(sample).map_err(wav_error)?;
                }
            }
            SampleFormat::Pcm16 => {
                for i in 0..samples {
                    let sample = if silent {
                        0
                    } else {
                        let raw = &self.staging[i * 2..i * 2 + 2];
                        i16::from_ne_bytes([raw[0], raw[1]])
                    };
                    writer.write_sample(sample).map_err(wav_error)?;
                }
            }
            _ => return Err(Error::UnsupportedFormat),
        }

        self.written.fetch_add(u64::from(frames), Ordering::AcqRel);
        Ok(())
    }
}

impl EndpointClient for WavFileClient {
    fn mix_format(&self) -> Result<WaveFormat> {
        Ok(self.mix.clone())
    }

    fn is_format_supported(&self, _mode: ShareMode, format: &WaveFormat) -> Result<bool> {
        Ok(matches!(
            format.format,
            SampleFormat::Float32 | SampleFormat::Pcm16
        ))
    }

    fn initialize(
        &mut self,
        _mode: ShareMode,
        _event_driven: bool,
        buffer_duration: RefTime,
        format: &WaveFormat,
    ) -> Result<()> {
        if self.writer.is_some() {
            return Err(Error::InvalidState("endpoint already initialized"));
        }
        let spec = hound::WavSpec {
            channels: format.channels as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample as u16,
            sample_format: match format.format {
                SampleFormat::Float32 => hound::SampleFormat::Float,
                SampleFormat::Pcm16 => hound::SampleFormat::Int,
                _ => return Err(Error::UnsupportedFormat),
            },
        };
        self.writer = Some(hound::WavWriter::create(&self.path, spec).map_err(wav_error)?);
        self.format = Some(format.clone());
        self.buffer_frames =
            time::ticks_to_frames(buffer_duration, format.sample_rate).max(1) as u32;
        Ok(())
    }

    fn set_event(&mut self, _event: Arc<Event>) -> Result<()> {
        Err(Error::InvalidState("file endpoint has no event support"))
    }

    fn buffer_size(&self) -> Result<u32> {
        Ok(self.buffer_frames)
    }

    fn current_padding(&self) -> Result<u32> {
        // The file consumes instantly.
        Ok(0)
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
        self.staged_frames = 0;
        self.write_frames(frames, silent)
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        // Rewinding a file render is meaningless; just reset the clock.
        self.written.store(0, Ordering::Release);
        Ok(())
    }

    fn stream_latency(&self) -> Result<RefTime> {
        Ok(0)
    }

    fn clock(&self) -> Result<Arc<dyn EndpointClock>> {
        let format = self
            .format
            .as_ref()
            .ok_or(Error::InvalidState("endpoint not initialized"))?;
        Ok(Arc::new(FileClock {
            written: Arc::clone(&self.written),
            rate: format.sample_rate,
        }))
    }
}

impl Drop for WavFileClient {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(error) = writer.finalize() {
                tracing::error!(%error, "wav finalize failed");
            }
        }
    }
}

struct FileClock {
    written: Arc<AtomicU64>,
    rate: u32,
}

impl EndpointClock for FileClock {
    fn frequency(&self) -> Result<u64> {
        Ok(u64::from(self.rate))
    }

    fn position(&self) -> Result<(u64, RefTime)> {
        Ok((self.written.load(Ordering::Acquire), time::counter()))
    }
}
