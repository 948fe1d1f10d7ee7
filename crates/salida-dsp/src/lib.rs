//! Salida DSP - the renderer's audio pipeline stages
//!
//! Chunks flow through the stages in a fixed order:
//!
//! ```text
//! ChannelMatrix -> RateConverter -> TempoStretch -> Crossfeed
//!     -> Volume -> Balance -> PeakLimiter -> Dither
//! ```
//!
//! Every stage implements [`Stage`]: it rewrites a [`salida_core::Chunk`]
//! in place, possibly replacing it with one of a different size or format,
//! and flushes held-back frames on `finish`. Stages convert lazily to
//! 32-bit float on first need, so pass-through configurations move bytes
//! untouched from the source to the device.
//!
//! Bitstream chunks never enter any stage; the renderer routes them
//! straight to the device.

pub mod balance;
pub mod crossfeed;
pub mod dither;
pub mod limiter;
pub mod matrix;
pub mod rate;
pub mod stage;
pub mod tempo;
pub mod volume;

pub use balance::Balance;
pub use crossfeed::Crossfeed;
pub use dither::Dither;
pub use limiter::PeakLimiter;
pub use matrix::ChannelMatrix;
pub use rate::RateConverter;
pub use stage::{Stage, StageParams};
pub use tempo::TempoStretch;
pub use volume::Volume;

/// Errors from DSP stage configuration or processing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The resampler backend rejected its configuration or input.
    #[error("resampler error: {0}")]
    Resampler(String),
}

/// Convenience result type for DSP operations.
pub type Result<T> = std::result::Result<T, Error>;
