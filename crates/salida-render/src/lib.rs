//! Salida Render - the renderer core
//!
//! Ties the pieces together: inbound media samples go through timing
//! correction ([`SampleCorrection`]), the DSP pipeline, and a device
//! feeder, while the graph reference clock ([`GraphClock`]) slaves to the
//! device clock during playback. The [`Renderer`] owns all of it and
//! exposes the sample-source contract: `set_format`, `new_segment`,
//! `enqueue`, `finish`, flush, and the play/pause/stop state machine.

pub mod clock;
pub mod correction;
pub mod renderer;
pub mod sample;

pub use clock::GraphClock;
pub use correction::SampleCorrection;
pub use renderer::{PlayState, Renderer};
pub use sample::Sample;

/// Errors surfaced by the renderer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device layer failed.
    #[error(transparent)]
    Device(#[from] salida_device::Error),

    /// A DSP stage rejected its configuration.
    #[error(transparent)]
    Dsp(#[from] salida_dsp::Error),

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Convenience result type for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;
