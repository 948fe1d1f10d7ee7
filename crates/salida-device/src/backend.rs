//! Device backend creation and wave-format negotiation.

use std::sync::Arc;

use salida_core::{ChannelMask, RefTime, SampleFormat, SharedWaveFormat, WaveFormat, TICKS_PER_MS};

use crate::endpoint::{EndpointClient, EndpointClock, EndpointProvider, ShareMode};
use crate::{Error, Result};

/// Everything known about an open device except its live handles.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    /// Resolved endpoint identifier.
    pub id: String,
    /// Audio adapter friendly name.
    pub adapter_name: String,
    /// Endpoint friendly name.
    pub endpoint_name: String,
    /// The platform mixer format at creation time.
    pub mix_format: SharedWaveFormat,
    /// The negotiated device wave format.
    pub wave_format: SharedWaveFormat,
    /// The format the DSP pipeline must deliver.
    pub dsp_format: SampleFormat,
    /// Requested device buffer duration in milliseconds.
    pub buffer_duration_ms: u32,
    /// Stream latency reported by the endpoint, in 100-ns ticks.
    pub latency: RefTime,
    /// Opened in exclusive mode.
    pub exclusive: bool,
    /// Fed by the event worker rather than the polling worker.
    pub event_driven: bool,
    /// Realtime (live) source; drives the low-latency feed path.
    pub realtime: bool,
    /// Opaque bitstream passthrough.
    pub bitstream: bool,
}

/// An open device: descriptor plus the live endpoint handles.
///
/// Owned exclusively by one feeder for its lifetime.
pub struct DeviceBackend {
    /// Negotiated device properties.
    pub descriptor: DeviceDescriptor,
    /// The activated endpoint client.
    pub client: Box<dyn EndpointClient>,
    /// The endpoint's position clock.
    pub clock: Arc<dyn EndpointClock>,
}

/// Inputs to backend creation, taken from the settings snapshot.
#[derive(Clone, Debug, Default)]
pub struct CreateParams {
    /// Endpoint to open; `None` selects the default render endpoint.
    pub endpoint_id: Option<String>,
    /// Open exclusively.
    pub exclusive: bool,
    /// Requested device buffer duration in milliseconds.
    pub buffer_ms: u32,
    /// The source is live; prefer the drift-corrected feed path.
    pub realtime: bool,
    /// Force the polling feeder even on event-capable endpoints.
    pub force_poll: bool,
}

fn resolve_endpoint(
    provider: &dyn EndpointProvider,
    requested: Option<&str>,
) -> Result<(String, String, String)> {
    let id = match requested {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => provider.default_endpoint_id()?,
    };

    let info = provider
        .endpoints()?
        .into_iter()
        .find(|e| e.id == id)
        .ok_or_else(|| Error::DeviceNotFound(id.clone()))?;

    Ok((info.id, info.adapter_name, info.endpoint_name))
}

/// The exclusive-mode probe list: preferred encodings at the input rate,
/// then at the mix rate, all on the mixer's channel layout, with packed
/// 16-bit PCM as the final fallback.
fn exclusive_candidates(input_rate: u32, mix: &WaveFormat) -> Vec<WaveFormat> {
    let mix_rate = mix.sample_rate;
    let channels = mix.channels;
    let mask = mix.layout();

    let mut rates = vec![input_rate];
    if mix_rate != input_rate {
        rates.push(mix_rate);
    }

    let mut candidates = Vec::new();
    for &rate in &rates {
        candidates.push(WaveFormat::new(SampleFormat::Float32, rate, channels, mask));
        candidates.push(WaveFormat::new(SampleFormat::Pcm32, rate, channels, mask));
        candidates.push(WaveFormat::new(SampleFormat::Pcm24, rate, channels, mask));
        candidates.push(WaveFormat::with_valid_bits(
            SampleFormat::Pcm32,
            24,
            rate,
            channels,
            mask,
        ));
        candidates.push(WaveFormat::new(SampleFormat::Pcm16, rate, channels, mask));
    }
    for &rate in &rates {
        // Plain (non-extensible) 16-bit PCM carries no speaker mask.
        candidates.push(WaveFormat::new(
            SampleFormat::Pcm16,
            rate,
            channels,
            ChannelMask(0),
        ));
    }
    candidates
}

/// Open an endpoint for `format` according to `params`.
///
/// Resolves the endpoint (falling back to the default render endpoint),
/// negotiates a wave format, and initializes the client with the requested
/// buffer duration. Bitstream formats require exclusive mode and are
/// offered to the endpoint as-is; exclusive PCM probes the priority list;
/// shared mode always adopts the mixer's format with a float DSP path.
pub fn create_backend(
    provider: &dyn EndpointProvider,
    params: &CreateParams,
    format: &WaveFormat,
) -> Result<DeviceBackend> {
    let (id, adapter_name, endpoint_name) = resolve_endpoint(provider, params.endpoint_id.as_deref())?;
    let mut client = provider.activate(&id)?;
    let mix_format = client.mix_format()?;

    let bitstream = format.is_bitstream();
    let (wave_format, dsp_format) = if bitstream {
        if !params.exclusive {
            return Err(Error::InvalidState("bitstreaming requires exclusive mode"));
        }
        if !client.is_format_supported(ShareMode::Exclusive, format)? {
            return Err(Error::UnsupportedFormat);
        }
        (format.clone(), SampleFormat::Bitstream)
    } else if params.exclusive {
        let mut selected = None;
        for candidate in exclusive_candidates(format.sample_rate, &mix_format) {
            if client.is_format_supported(ShareMode::Exclusive, &candidate)? {
                tracing::debug!(
                    format = ?candidate.format,
                    rate = candidate.sample_rate,
                    valid_bits = candidate.valid_bits,
                    "exclusive format accepted"
                );
                selected = Some(candidate);
                break;
            }
        }
        let wave = selected.ok_or(Error::UnsupportedFormat)?;
        let dsp = wave.format;
        (wave, dsp)
    } else {
        (mix_format.clone(), SampleFormat::Float32)
    };

    let mode = if params.exclusive {
        ShareMode::Exclusive
    } else {
        ShareMode::Shared
    };
    let event_driven = client.event_capable() && !params.force_poll;

    client.initialize(
        mode,
        event_driven,
        RefTime::from(params.buffer_ms) * TICKS_PER_MS,
        &wave_format,
    )?;
    let latency = client.stream_latency()?;
    let clock = client.clock()?;

    tracing::info!(
        endpoint = %endpoint_name,
        adapter = %adapter_name,
        format = ?wave_format.format,
        rate = wave_format.sample_rate,
        channels = wave_format.channels,
        exclusive = params.exclusive,
        event_driven,
        bitstream,
        buffer_ms = params.buffer_ms,
        "device backend created"
    );

    Ok(DeviceBackend {
        descriptor: DeviceDescriptor {
            id,
            adapter_name,
            endpoint_name,
            mix_format: Arc::new(mix_format),
            wave_format: Arc::new(wave_format),
            dsp_format,
            buffer_duration_ms: params.buffer_ms,
            latency,
            exclusive: params.exclusive,
            event_driven,
            realtime: params.realtime,
            bitstream,
        },
        client,
        clock,
    })
}
