//! Salida Device - endpoint contract, backends, and feeders
//!
//! This crate owns everything between the DSP pipeline and the platform
//! audio API:
//!
//! - the opaque **endpoint contract** ([`EndpointProvider`],
//!   [`EndpointClient`], [`EndpointClock`]) the renderer is written
//!   against;
//! - **backend creation** ([`backend`]): resolving an endpoint, probing
//!   wave formats for exclusive mode, and initializing the client;
//! - the **device manager** ([`DeviceManager`]): a worker-thread actor that
//!   serializes every provider call and watches default-device changes;
//! - two **feeders** ([`PushFeeder`], [`EventFeeder`]) that own the worker
//!   threads talking to the device, wrapped in the [`Feeder`] variant;
//! - endpoint implementations: a deterministic [`virt`] endpoint for
//!   tests, a [`file`] endpoint rendering to WAV, and a [`live`] endpoint
//!   over cpal.

pub mod backend;
pub mod endpoint;
pub mod event;
pub mod feeder;
pub mod file;
pub mod live;
pub mod manager;
pub mod push;
pub mod sync;
pub mod virt;

pub use backend::{create_backend, CreateParams, DeviceBackend, DeviceDescriptor};
pub use endpoint::{
    EndpointClient, EndpointClock, EndpointInfo, EndpointProvider, EndpointState, ShareMode,
};
pub use event::EventFeeder;
pub use feeder::Feeder;
pub use manager::DeviceManager;
pub use push::PushFeeder;
pub use sync::Event;

/// Errors from endpoint and feeder operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform endpoint layer reported a failure.
    #[error("endpoint failure: {0}")]
    Endpoint(String),

    /// The requested endpoint does not exist or is unplugged.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The format probe produced no acceptable device format.
    #[error("no acceptable device format")]
    UnsupportedFormat,

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A blocking operation observed the flush event.
    #[error("interrupted by flush")]
    Interrupted,

    /// The device manager worker has exited.
    #[error("device manager worker is gone")]
    ManagerGone,
}

/// Convenience result type for device operations.
pub type Result<T> = std::result::Result<T, Error>;
