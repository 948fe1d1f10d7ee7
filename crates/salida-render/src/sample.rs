//! Inbound media samples.

use std::sync::Arc;

use salida_core::{RefTime, SharedWaveFormat};

/// One timestamped buffer pushed by the sample source.
///
/// The payload is borrowed: the renderer holds the `Arc` only until the
/// data is copied (first DSP mutation, or queueing into a feeder), so the
/// source can recycle its buffer as soon as the `Arc` drops.
#[derive(Clone, Debug)]
pub struct Sample {
    /// The source-owned payload.
    pub buffer: Arc<[u8]>,
    /// Start of the payload region within `buffer`.
    pub offset: usize,
    /// Length of the payload region in bytes.
    pub len: usize,
    /// Presentation start time in 100-ns ticks, if stamped.
    pub start: Option<RefTime>,
    /// Presentation stop time in 100-ns ticks, if stamped.
    pub stop: Option<RefTime>,
    /// The stream has a gap before this sample.
    pub discontinuity: bool,
    /// The sample carries (or announces) a new media format.
    pub format_changed: bool,
    /// Safe point to begin decoding a bitstream.
    pub splice_point: bool,
    /// The new format accompanying `format_changed`.
    pub new_format: Option<SharedWaveFormat>,
}

impl Sample {
    /// A plain, unstamped sample covering the whole buffer.
    pub fn new(buffer: Arc<[u8]>) -> Sample {
        let len = buffer.len();
        Sample {
            buffer,
            offset: 0,
            len,
            start: None,
            stop: None,
            discontinuity: false,
            format_changed: false,
            splice_point: false,
            new_format: None,
        }
    }

    /// The same sample with presentation timestamps.
    pub fn with_times(mut self, start: RefTime, stop: RefTime) -> Sample {
        self.start = Some(start);
        self.stop = Some(stop);
        self
    }
}
