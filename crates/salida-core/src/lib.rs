//! Salida Core - wave formats, chunks, and sample conversion
//!
//! This crate provides the data model shared by every layer of the salida
//! audio renderer:
//!
//! - [`WaveFormat`] - an immutable wave format descriptor (rate, channels,
//!   speaker mask, sample encoding, container/valid bits)
//! - [`Chunk`] - a contiguous block of interleaved frames traversing the
//!   pipeline, with zero-copy views over producer-owned buffers
//! - Sample conversion between all PCM and float encodings, with the exact
//!   scaling rules the device path depends on
//! - 100-ns tick arithmetic ([`time`]) used for every timestamp in the
//!   renderer
//!
//! # Example
//!
//! ```rust
//! use salida_core::{Chunk, SampleFormat};
//!
//! // A second of silent stereo float audio.
//! let mut chunk = Chunk::new(SampleFormat::Float32, 2, 48000, 48000);
//! assert_eq!(chunk.frame_count(), 48000);
//!
//! // Convert it to the device's 16-bit format in place.
//! chunk.to_format(SampleFormat::Pcm16);
//! assert_eq!(chunk.size(), 48000 * 2 * 2);
//! ```

pub mod chunk;
pub mod convert;
pub mod format;
pub mod time;

pub use chunk::Chunk;
pub use format::{ChannelMask, SampleFormat, SharedWaveFormat, Speaker, WaveFormat, SPEAKERS};
pub use time::{RefTime, TICKS_PER_MS, TICKS_PER_SEC};
