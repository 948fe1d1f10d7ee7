//! The opaque endpoint-layer contract.
//!
//! The renderer never talks to a platform audio API directly; it consumes
//! these traits. An [`EndpointProvider`] enumerates and activates render
//! endpoints, an [`EndpointClient`] is one activated endpoint with a
//! device buffer, and an [`EndpointClock`] is the hardware position clock
//! the graph clock slaves to.
//!
//! The contract mirrors the WASAPI surface shape (mix format query,
//! format-support probing, shared/exclusive initialization with a
//! requested buffer duration, get/release buffer, padding and position)
//! without naming the platform: the [`virt`](crate::virt),
//! [`file`](crate::file), and [`live`](crate::live) modules all implement
//! it.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use salida_core::{RefTime, WaveFormat};

use crate::sync::Event;
use crate::Result;

/// How a client opens an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareMode {
    /// Write the platform mixer's format alongside other clients.
    Shared,
    /// Own the endpoint; fixed wave format, lowest latency.
    Exclusive,
}

/// Whether an endpoint can currently render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    /// Present and usable.
    Active,
    /// Known but disconnected.
    Unplugged,
}

/// One enumerated render endpoint.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    /// Stable endpoint identifier.
    pub id: String,
    /// Friendly name of the audio adapter.
    pub adapter_name: String,
    /// Friendly name of the endpoint itself.
    pub endpoint_name: String,
    /// Current availability.
    pub state: EndpointState,
}

/// The device position clock of an activated endpoint.
///
/// Shared between a feeder (position queries) and the graph clock (while
/// slaved), so implementations must be thread-safe.
pub trait EndpointClock: Send + Sync {
    /// Device clock frequency in position units per second.
    fn frequency(&self) -> Result<u64>;

    /// Current position and the host counter value
    /// ([`salida_core::time::counter`]) at which it was captured.
    fn position(&self) -> Result<(u64, RefTime)>;
}

/// An activated render endpoint.
pub trait EndpointClient: Send {
    /// The platform mixer's current format.
    fn mix_format(&self) -> Result<WaveFormat>;

    /// Whether the endpoint accepts `format` in `mode`.
    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> Result<bool>;

    /// Whether the endpoint can signal buffer completion through an event.
    fn event_capable(&self) -> bool {
        false
    }

    /// Open the stream. `buffer_duration` is the requested device buffer in
    /// 100-ns ticks; `event_driven` registers for buffer-ready signalling
    /// (the event itself arrives via [`set_event`](Self::set_event)).
    fn initialize(
        &mut self,
        mode: ShareMode,
        event_driven: bool,
        buffer_duration: RefTime,
        format: &WaveFormat,
    ) -> Result<()>;

    /// Register the event the endpoint fires when buffer space is ready.
    fn set_event(&mut self, event: Arc<Event>) -> Result<()>;

    /// Total device buffer size in frames.
    fn buffer_size(&self) -> Result<u32>;

    /// Frames currently queued in the device buffer.
    fn current_padding(&self) -> Result<u32>;

    /// Borrow `frames` worth of device buffer to fill.
    fn render_buffer(&mut self, frames: u32) -> Result<&mut [u8]>;

    /// Submit the previously borrowed buffer. With `silent`, the endpoint
    /// renders silence and the buffer contents are ignored.
    fn release_buffer(&mut self, frames: u32, silent: bool) -> Result<()>;

    /// Start consuming.
    fn start(&mut self) -> Result<()>;

    /// Stop consuming; queued frames stay in the buffer.
    fn stop(&mut self) -> Result<()>;

    /// Drop queued frames and rewind the stream position.
    fn reset(&mut self) -> Result<()>;

    /// Stream latency in 100-ns ticks.
    fn stream_latency(&self) -> Result<RefTime>;

    /// The endpoint's position clock.
    fn clock(&self) -> Result<Arc<dyn EndpointClock>>;
}

/// Enumerates render endpoints and activates clients on them.
pub trait EndpointProvider: Send {
    /// All known render endpoints.
    fn endpoints(&self) -> Result<Vec<EndpointInfo>>;

    /// Identifier of the current default render endpoint.
    fn default_endpoint_id(&self) -> Result<String>;

    /// Activate a client on the endpoint with `id`.
    fn activate(&self, id: &str) -> Result<Box<dyn EndpointClient>>;

    /// Ask the provider to bump `serial` whenever the default render
    /// endpoint changes. Called once, by the device manager.
    fn watch_default_changes(&self, serial: Arc<AtomicU32>) {
        let _ = serial;
    }
}
