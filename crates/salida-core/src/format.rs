//! Wave format descriptors and speaker layouts.

use std::fmt;
use std::sync::Arc;

/// Sample encoding of interleaved audio data.
///
/// The six PCM/float encodings participate in DSP; [`Bitstream`] marks an
/// opaque compressed payload (AC3, DTS, ...) that passes through the
/// pipeline untouched and never enters any DSP stage.
///
/// [`Bitstream`]: SampleFormat::Bitstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 8-bit PCM.
    Pcm8,
    /// Signed 16-bit PCM.
    Pcm16,
    /// Signed 24-bit PCM, packed little-endian in 3 bytes.
    Pcm24,
    /// Signed 32-bit PCM.
    Pcm32,
    /// IEEE 32-bit float.
    Float32,
    /// IEEE 64-bit float.
    Float64,
    /// Opaque bitstream passthrough; excluded from DSP.
    Bitstream,
}

impl SampleFormat {
    /// Container size of one sample in bytes.
    ///
    /// For [`SampleFormat::Bitstream`] the size comes from the wave format's
    /// container bits instead; this returns 0.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::Pcm8 => 1,
            SampleFormat::Pcm16 => 2,
            SampleFormat::Pcm24 => 3,
            SampleFormat::Pcm32 | SampleFormat::Float32 => 4,
            SampleFormat::Float64 => 8,
            SampleFormat::Bitstream => 0,
        }
    }

    /// Whether this encoding can enter the DSP pipeline.
    #[inline]
    pub fn is_pcm(self) -> bool {
        self != SampleFormat::Bitstream
    }
}

/// One spatial channel position.
///
/// The ordinal of each variant is its interleaving position: a frame carries
/// the present speakers in ascending variant order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Speaker {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
}

/// All speakers in interleaving order.
pub const SPEAKERS: [Speaker; 18] = [
    Speaker::FrontLeft,
    Speaker::FrontRight,
    Speaker::FrontCenter,
    Speaker::LowFrequency,
    Speaker::BackLeft,
    Speaker::BackRight,
    Speaker::FrontLeftOfCenter,
    Speaker::FrontRightOfCenter,
    Speaker::BackCenter,
    Speaker::SideLeft,
    Speaker::SideRight,
    Speaker::TopCenter,
    Speaker::TopFrontLeft,
    Speaker::TopFrontCenter,
    Speaker::TopFrontRight,
    Speaker::TopBackLeft,
    Speaker::TopBackCenter,
    Speaker::TopBackRight,
];

impl Speaker {
    /// Index of this speaker in interleaving order (0..18).
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The mask bit for this speaker.
    #[inline]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// An 18-bit bitmap of the spatial channels present in a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    /// Single center channel.
    pub const MONO: ChannelMask = ChannelMask(0x4);
    /// Front left + front right.
    pub const STEREO: ChannelMask = ChannelMask(0x3);
    /// Stereo + back pair.
    pub const QUAD: ChannelMask = ChannelMask(0x33);
    /// Stereo + front center + back center.
    pub const SURROUND: ChannelMask = ChannelMask(0x107);
    /// Standard 5.1 layout.
    pub const FIVE_POINT_ONE: ChannelMask = ChannelMask(0x3F);
    /// Standard 7.1 layout (5.1 + front-of-center pair).
    pub const SEVEN_POINT_ONE: ChannelMask = ChannelMask(0xFF);

    /// Whether `speaker` is present.
    #[inline]
    pub fn contains(self, speaker: Speaker) -> bool {
        self.0 & speaker.bit() != 0
    }

    /// Number of channels described by the mask.
    #[inline]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Speakers present, in interleaving order.
    pub fn speakers(self) -> impl Iterator<Item = Speaker> {
        SPEAKERS.into_iter().filter(move |s| self.contains(*s))
    }

    /// The conventional mask for a channel count, used when a source format
    /// does not carry one.
    pub fn default_for(channels: u32) -> ChannelMask {
        match channels {
            1 => ChannelMask::MONO,
            2 => ChannelMask::STEREO,
            3 => ChannelMask(ChannelMask::STEREO.0 | Speaker::FrontCenter.bit()),
            4 => ChannelMask::SURROUND,
            5 => ChannelMask(ChannelMask::QUAD.0 | Speaker::FrontCenter.bit()),
            6 => ChannelMask::FIVE_POINT_ONE,
            7 => ChannelMask(ChannelMask::FIVE_POINT_ONE.0 | Speaker::BackCenter.bit()),
            8 => ChannelMask::SEVEN_POINT_ONE,
            _ => ChannelMask(0),
        }
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Immutable wave format descriptor.
///
/// Shared by reference ([`SharedWaveFormat`]) between the renderer, the
/// device backend, and timing correction; never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u32,
    /// Speaker layout. May be empty for formats without positional data.
    pub channel_mask: ChannelMask,
    /// Sample encoding.
    pub format: SampleFormat,
    /// Container bits per sample (what the device consumes per sample).
    pub bits_per_sample: u32,
    /// Valid (significant) bits per sample, `<= bits_per_sample`.
    pub valid_bits: u32,
}

/// A wave format shared by reference.
pub type SharedWaveFormat = Arc<WaveFormat>;

impl WaveFormat {
    /// A PCM or float format with matching container and valid bits.
    pub fn new(
        format: SampleFormat,
        sample_rate: u32,
        channels: u32,
        channel_mask: ChannelMask,
    ) -> WaveFormat {
        let bits = (format.bytes() * 8) as u32;
        WaveFormat {
            sample_rate,
            channels,
            channel_mask,
            format,
            bits_per_sample: bits,
            valid_bits: bits,
        }
    }

    /// A format whose container is wider than its valid bits
    /// (e.g. 24 valid bits carried in 32-bit containers).
    pub fn with_valid_bits(
        format: SampleFormat,
        valid_bits: u32,
        sample_rate: u32,
        channels: u32,
        channel_mask: ChannelMask,
    ) -> WaveFormat {
        let mut fmt = WaveFormat::new(format, sample_rate, channels, channel_mask);
        fmt.valid_bits = valid_bits;
        fmt
    }

    /// An opaque bitstream format with an explicit container width.
    pub fn bitstream(sample_rate: u32, channels: u32, bits_per_sample: u32) -> WaveFormat {
        WaveFormat {
            sample_rate,
            channels,
            channel_mask: ChannelMask(0),
            format: SampleFormat::Bitstream,
            bits_per_sample,
            valid_bits: bits_per_sample,
        }
    }

    /// Container bytes per sample.
    #[inline]
    pub fn sample_bytes(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Bytes per frame (one sample per channel).
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.sample_bytes() * self.channels as usize
    }

    /// Whether this format is an opaque bitstream.
    #[inline]
    pub fn is_bitstream(&self) -> bool {
        self.format == SampleFormat::Bitstream
    }

    /// The speaker layout, falling back to the conventional mask for the
    /// channel count when none was specified.
    pub fn layout(&self) -> ChannelMask {
        if self.channel_mask.0 != 0 {
            self.channel_mask
        } else {
            ChannelMask::default_for(self.channels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(SampleFormat::Pcm8.bytes(), 1);
        assert_eq!(SampleFormat::Pcm16.bytes(), 2);
        assert_eq!(SampleFormat::Pcm24.bytes(), 3);
        assert_eq!(SampleFormat::Pcm32.bytes(), 4);
        assert_eq!(SampleFormat::Float32.bytes(), 4);
        assert_eq!(SampleFormat::Float64.bytes(), 8);
    }

    #[test]
    fn test_default_masks_match_channel_counts() {
        for channels in 1..=8 {
            assert_eq!(ChannelMask::default_for(channels).count(), channels);
        }
        assert_eq!(ChannelMask::default_for(9).0, 0);
    }

    #[test]
    fn test_speaker_order() {
        let mask = ChannelMask::FIVE_POINT_ONE;
        let speakers: Vec<Speaker> = mask.speakers().collect();
        assert_eq!(
            speakers,
            [
                Speaker::FrontLeft,
                Speaker::FrontRight,
                Speaker::FrontCenter,
                Speaker::LowFrequency,
                Speaker::BackLeft,
                Speaker::BackRight,
            ]
        );
    }

    #[test]
    fn test_wave_format_frame_size() {
        let fmt = WaveFormat::new(SampleFormat::Pcm24, 48_000, 6, ChannelMask::FIVE_POINT_ONE);
        assert_eq!(fmt.frame_size(), 18);
        assert_eq!(fmt.valid_bits, 24);
    }

    #[test]
    fn test_valid_bits_container() {
        let fmt =
            WaveFormat::with_valid_bits(SampleFormat::Pcm32, 24, 44_100, 2, ChannelMask::STEREO);
        assert_eq!(fmt.bits_per_sample, 32);
        assert_eq!(fmt.valid_bits, 24);
        assert_eq!(fmt.frame_size(), 8);
    }

    #[test]
    fn test_layout_fallback() {
        let fmt = WaveFormat::new(SampleFormat::Pcm16, 48_000, 2, ChannelMask(0));
        assert_eq!(fmt.layout(), ChannelMask::STEREO);
    }
}
