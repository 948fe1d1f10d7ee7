//! Interleaved audio chunks with deferred-copy payloads.
//!
//! A [`Chunk`] owns a contiguous block of interleaved frames moving through
//! the pipeline. Chunks created from a producer's media buffer start out
//! *borrowed*: they hold a keep-alive reference to the producer's allocation
//! and defer copying until the first mutable access. Every DSP stage that
//! rewrites samples therefore pays for at most one copy, and chunks that
//! pass through untouched (bitstream, pass-through configurations) never
//! copy at all.

use std::sync::Arc;

use crate::format::{SampleFormat, WaveFormat};

/// Owned payload storage, 8-byte aligned so float views are always valid.
#[derive(Default)]
struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> AlignedBuf {
        AlignedBuf {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    #[inline]
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

enum Payload {
    Empty,
    Owned(AlignedBuf),
    /// A view over a producer-owned buffer. The `Arc` keeps the producer's
    /// allocation alive; `base` is where this chunk's region starts in it.
    Borrowed {
        keepalive: Arc<[u8]>,
        base: usize,
    },
}

/// A contiguous block of interleaved audio frames.
///
/// Invariants: `size()` is always a whole number of frames; an empty chunk
/// reports zero frames regardless of format. The head offset lets
/// [`shrink_head`](Chunk::shrink_head) drop leading frames without moving
/// data.
pub struct Chunk {
    format: SampleFormat,
    sample_bytes: usize,
    channels: u32,
    rate: u32,
    head: usize,
    len: usize,
    payload: Payload,
}

impl Default for Chunk {
    fn default() -> Chunk {
        Chunk {
            format: SampleFormat::Bitstream,
            sample_bytes: 1,
            channels: 1,
            rate: 1,
            head: 0,
            len: 0,
            payload: Payload::Empty,
        }
    }
}

impl Chunk {
    /// An empty chunk.
    pub fn empty() -> Chunk {
        Chunk::default()
    }

    /// Allocate a zero-filled owned chunk.
    ///
    /// # Panics
    ///
    /// Panics if `format` is [`SampleFormat::Bitstream`]; bitstream chunks
    /// only come from producer buffers via [`Chunk::from_shared`].
    pub fn new(format: SampleFormat, channels: u32, frames: usize, rate: u32) -> Chunk {
        assert!(format.is_pcm());
        let sample_bytes = format.bytes();
        let len = sample_bytes * channels as usize * frames;
        Chunk {
            format,
            sample_bytes,
            channels,
            rate,
            head: 0,
            len,
            payload: if len == 0 {
                Payload::Empty
            } else {
                Payload::Owned(AlignedBuf::zeroed(len))
            },
        }
    }

    /// Borrow a region of a producer-owned buffer as a chunk.
    ///
    /// The chunk holds `buffer` alive until it is dropped or materialized.
    /// `len` is truncated to a whole number of frames; the format (and, for
    /// bitstream, the container width) comes from `wave_format`.
    pub fn from_shared(
        buffer: Arc<[u8]>,
        offset: usize,
        len: usize,
        wave_format: &WaveFormat,
    ) -> Chunk {
        assert!(offset + len <= buffer.len());
        let sample_bytes = wave_format.sample_bytes();
        let frame_size = sample_bytes * wave_format.channels as usize;
        let len = len - len % frame_size;
        Chunk {
            format: wave_format.format,
            sample_bytes,
            channels: wave_format.channels,
            rate: wave_format.sample_rate,
            head: 0,
            len,
            payload: if len == 0 {
                Payload::Empty
            } else {
                Payload::Borrowed {
                    keepalive: buffer,
                    base: offset,
                }
            },
        }
    }

    /// Whether the chunk holds no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sample encoding.
    #[inline]
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Container bytes per sample.
    #[inline]
    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    /// Interleaved channel count.
    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Bytes per frame.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.sample_bytes * self.channels as usize
    }

    /// Sample rate in Hz.
    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }

    /// Number of samples (frames x channels).
    #[inline]
    pub fn sample_count(&self) -> usize {
        self.len / self.sample_bytes
    }

    /// Number of frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.sample_count() / self.channels as usize
    }

    /// Read access to the payload without materializing a borrowed view.
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Empty => &[],
            Payload::Owned(buf) => &buf.as_bytes()[self.head..self.head + self.len],
            Payload::Borrowed { keepalive, base } => {
                &keepalive[base + self.head..base + self.head + self.len]
            }
        }
    }

    /// Mutable access to the payload.
    ///
    /// The first call on a borrowed chunk copies the producer's data into an
    /// owned allocation; afterwards the chunk behaves as owned.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.materialize();
        match &mut self.payload {
            Payload::Owned(buf) => &mut buf.as_bytes_mut()[self.head..self.head + self.len],
            _ => &mut [],
        }
    }

    /// Release the keep-alive reference to the producer's buffer by copying
    /// the data now. Called before a chunk is parked in a feeder queue so
    /// the producer can recycle its buffer.
    pub fn materialize(&mut self) {
        if let Payload::Borrowed { keepalive, base } = &self.payload {
            if self.len == 0 {
                self.payload = Payload::Empty;
                return;
            }
            let mut buf = AlignedBuf::zeroed(self.head + self.len);
            buf.as_bytes_mut()
                .copy_from_slice(&keepalive[*base..*base + self.head + self.len]);
            self.payload = Payload::Owned(buf);
        }
    }

    /// The float samples of a `Float32` chunk.
    ///
    /// Takes `&mut self` because a borrowed payload must be materialized to
    /// guarantee alignment.
    ///
    /// # Panics
    ///
    /// Panics if the chunk format is not [`SampleFormat::Float32`].
    pub fn samples_f32(&mut self) -> &[f32] {
        assert_eq!(self.format, SampleFormat::Float32);
        bytemuck::cast_slice(self.bytes_mut())
    }

    /// Mutable float samples of a `Float32` chunk.
    ///
    /// # Panics
    ///
    /// Panics if the chunk format is not [`SampleFormat::Float32`].
    pub fn samples_f32_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.format, SampleFormat::Float32);
        bytemuck::cast_slice_mut(self.bytes_mut())
    }

    /// Shrink to `frames` by dropping frames from the front. No-op when the
    /// chunk is already that small. No reallocation.
    pub fn shrink_head(&mut self, frames: usize) {
        let count = self.frame_count();
        if frames < count {
            let bytes = (count - frames) * self.frame_size();
            self.head += bytes;
            self.len -= bytes;
            if self.len == 0 {
                self.payload = Payload::Empty;
                self.head = 0;
            }
        }
    }

    /// Shrink to `frames` by dropping frames from the back. No-op when the
    /// chunk is already that small. No reallocation.
    pub fn shrink_tail(&mut self, frames: usize) {
        if frames < self.frame_count() {
            self.len = frames * self.frame_size();
            if self.len == 0 {
                self.payload = Payload::Empty;
                self.head = 0;
            }
        }
    }

    /// Append another chunk's frames, concatenating into a fresh owned
    /// allocation. An empty side is free: the other side is moved.
    ///
    /// # Panics
    ///
    /// Panics if both chunks are non-empty and disagree on format, channel
    /// count, or rate.
    pub fn append(&mut self, other: Chunk) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        assert_eq!(self.format, other.format);
        assert_eq!(self.channels, other.channels);
        assert_eq!(self.rate, other.rate);

        let mut buf = AlignedBuf::zeroed(self.len + other.len);
        buf.as_bytes_mut()[..self.len].copy_from_slice(self.bytes());
        buf.as_bytes_mut()[self.len..].copy_from_slice(other.bytes());
        self.head = 0;
        self.len = buf.len;
        self.payload = Payload::Owned(buf);
    }

    /// Move the chunk out, leaving an empty one behind.
    pub fn take(&mut self) -> Chunk {
        std::mem::take(self)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("format", &self.format)
            .field("channels", &self.channels)
            .field("rate", &self.rate)
            .field("frames", &self.frame_count())
            .field(
                "borrowed",
                &matches!(self.payload, Payload::Borrowed { .. }),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelMask;

    fn stereo_f32(rate: u32) -> WaveFormat {
        WaveFormat::new(SampleFormat::Float32, rate, 2, ChannelMask::STEREO)
    }

    #[test]
    fn test_new_is_zeroed() {
        let mut chunk = Chunk::new(SampleFormat::Float32, 2, 16, 48_000);
        assert_eq!(chunk.frame_count(), 16);
        assert!(chunk.samples_f32().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_borrowed_copies_on_write() {
        let producer: Arc<[u8]> = vec![1_u8; 64].into();
        let mut chunk = Chunk::from_shared(Arc::clone(&producer), 0, 64, &stereo_f32(48_000));
        assert_eq!(chunk.frame_count(), 8);
        // Read access does not copy.
        assert_eq!(chunk.bytes()[0], 1);
        // Mutation copies; the producer's buffer stays untouched.
        chunk.bytes_mut()[0] = 7;
        assert_eq!(producer[0], 1);
        assert_eq!(chunk.bytes()[0], 7);
    }

    #[test]
    fn test_from_shared_truncates_partial_frame() {
        let producer: Arc<[u8]> = vec![0_u8; 21].into();
        let chunk = Chunk::from_shared(producer, 0, 21, &stereo_f32(48_000));
        // 21 bytes is 2 whole stereo float frames plus change.
        assert_eq!(chunk.frame_count(), 2);
        assert_eq!(chunk.size(), 16);
    }

    #[test]
    fn test_shrink_head_drops_leading_frames() {
        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 4, 48_000);
        {
            let data = chunk.bytes_mut();
            data[0] = 0xAA; // first frame
            data[12] = 0xBB; // last frame
        }
        chunk.shrink_head(1);
        assert_eq!(chunk.frame_count(), 1);
        assert_eq!(chunk.bytes()[0], 0xBB);
    }

    #[test]
    fn test_shrink_tail_keeps_leading_frames() {
        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 4, 48_000);
        chunk.bytes_mut()[0] = 0xAA;
        chunk.shrink_tail(2);
        assert_eq!(chunk.frame_count(), 2);
        assert_eq!(chunk.bytes()[0], 0xAA);
    }

    #[test]
    fn test_shrink_to_larger_is_noop() {
        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 4, 48_000);
        chunk.shrink_head(10);
        chunk.shrink_tail(10);
        assert_eq!(chunk.frame_count(), 4);
    }

    #[test]
    fn test_append() {
        let mut a = Chunk::new(SampleFormat::Float32, 1, 2, 48_000);
        a.samples_f32_mut().copy_from_slice(&[1.0, 2.0]);
        let mut b = Chunk::new(SampleFormat::Float32, 1, 2, 48_000);
        b.samples_f32_mut().copy_from_slice(&[3.0, 4.0]);

        a.append(b);
        assert_eq!(a.samples_f32(), &[1.0, 2.0, 3.0, 4.0]);

        let mut empty = Chunk::empty();
        empty.append(a.take());
        assert_eq!(empty.frame_count(), 4);
    }

    #[test]
    fn test_bitstream_sample_size_from_container() {
        let fmt = WaveFormat::bitstream(48_000, 2, 16);
        let producer: Arc<[u8]> = vec![0_u8; 32].into();
        let chunk = Chunk::from_shared(producer, 0, 32, &fmt);
        assert_eq!(chunk.format(), SampleFormat::Bitstream);
        assert_eq!(chunk.frame_size(), 4);
        assert_eq!(chunk.frame_count(), 8);
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut chunk = Chunk::new(SampleFormat::Pcm16, 2, 4, 48_000);
        let taken = chunk.take();
        assert_eq!(taken.frame_count(), 4);
        assert!(chunk.is_empty());
    }
}
