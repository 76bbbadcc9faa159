//! Core types shared by the demuxer, the decode engines and the facade.

use std::time::Duration;

use bytes::Bytes;

use crate::DecodeError;

/// Video codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Codec {
    /// H.264/AVC codec.
    #[default]
    H264,
}

impl Codec {
    /// Map an ISO-BMFF sample entry type to a codec.
    #[must_use]
    pub fn from_sample_entry(entry: &[u8; 4]) -> Option<Self> {
        match entry {
            b"avc1" | b"avc3" => Some(Self::H264),
            _ => None,
        }
    }
}

/// Pixel layout of decoded surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8-bit YUV 4:2:0, planar Y + interleaved UV.
    #[default]
    Nv12,
    /// 10-bit YUV 4:2:0 in 16-bit little-endian words, planar Y + interleaved UV.
    P010,
}

impl PixelFormat {
    /// Bytes used by one luma sample.
    #[must_use]
    pub fn bytes_per_component(&self) -> usize {
        match self {
            Self::Nv12 => 1,
            Self::P010 => 2,
        }
    }

    /// Bits of precision per component.
    #[must_use]
    pub fn bit_depth(&self) -> u8 {
        match self {
            Self::Nv12 => 8,
            Self::P010 => 10,
        }
    }
}

/// Configuration for opening a decoder.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Use the hardware engine when one is available.
    pub hardware_acceleration: bool,
    /// Pixel format requested from the engine (default: NV12).
    pub preferred_format: Option<PixelFormat>,
    /// Hand frames to the GPU without a CPU copy when the engine allows it.
    pub zero_copy: bool,
    /// Maximum submitted-but-not-completed samples.
    pub in_flight_limit: usize,
    /// Capacity of the presentation reorder buffer, counting in-flight decodes.
    pub reorder_capacity: usize,
    /// Bound on every blocking wait (completions, reads, drains).
    pub decode_timeout: Duration,
    /// Length of the time range covered by one sample reader.
    pub seek_window: Duration,
    /// Forward distance beyond which a request triggers an implicit seek.
    pub seek_threshold: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            hardware_acceleration: true,
            preferred_format: None,
            zero_copy: true,
            in_flight_limit: 4,
            reorder_capacity: 8,
            decode_timeout: Duration::from_secs(2),
            seek_window: Duration::from_secs(2),
            seek_threshold: Duration::from_secs(1),
        }
    }
}

impl DecoderConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the hardware engine.
    #[must_use]
    pub fn hardware_acceleration(mut self, enable: bool) -> Self {
        self.hardware_acceleration = enable;
        self
    }

    /// Set the preferred output pixel format.
    #[must_use]
    pub fn preferred_format(mut self, format: PixelFormat) -> Self {
        self.preferred_format = Some(format);
        self
    }

    /// Enable or disable zero-copy export.
    #[must_use]
    pub fn zero_copy(mut self, enable: bool) -> Self {
        self.zero_copy = enable;
        self
    }

    /// Set the in-flight submission cap.
    #[must_use]
    pub fn in_flight_limit(mut self, limit: usize) -> Self {
        self.in_flight_limit = limit;
        self
    }

    /// Set the reorder buffer capacity.
    #[must_use]
    pub fn reorder_capacity(mut self, capacity: usize) -> Self {
        self.reorder_capacity = capacity;
        self
    }

    /// Set the bound on blocking waits.
    #[must_use]
    pub fn decode_timeout(mut self, timeout: Duration) -> Self {
        self.decode_timeout = timeout;
        self
    }

    /// Set the time range read per sample reader.
    #[must_use]
    pub fn seek_window(mut self, window: Duration) -> Self {
        self.seek_window = window;
        self
    }

    /// Set the forward distance that triggers an implicit seek.
    #[must_use]
    pub fn seek_threshold(mut self, threshold: Duration) -> Self {
        self.seek_threshold = threshold;
        self
    }

    /// Configure for interactive scrubbing: few frames in flight, short waits.
    #[must_use]
    pub fn for_scrubbing(mut self) -> Self {
        self.in_flight_limit = 2;
        self.reorder_capacity = 6;
        self.decode_timeout = Duration::from_millis(500);
        self.seek_window = Duration::from_secs(1);
        self.seek_threshold = Duration::from_millis(500);
        self
    }

    /// Configure for continuous playback: deeper pipeline, long reads.
    #[must_use]
    pub fn for_playback(mut self) -> Self {
        self.in_flight_limit = 8;
        self.reorder_capacity = 16;
        self.seek_window = Duration::from_secs(5);
        self.seek_threshold = Duration::from_secs(3);
        self
    }

    /// Pixel format the engine should produce.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.preferred_format.unwrap_or_default()
    }

    /// Check the limits are usable together.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.in_flight_limit == 0 {
            return Err(DecodeError::InvalidConfig(
                "in_flight_limit must be at least 1".into(),
            ));
        }
        if self.reorder_capacity < self.in_flight_limit {
            return Err(DecodeError::InvalidConfig(format!(
                "reorder_capacity ({}) must be >= in_flight_limit ({})",
                self.reorder_capacity, self.in_flight_limit
            )));
        }
        if self.decode_timeout.is_zero() {
            return Err(DecodeError::InvalidConfig(
                "decode_timeout must be non-zero".into(),
            ));
        }
        if self.seek_window.is_zero() {
            return Err(DecodeError::InvalidConfig(
                "seek_window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Static description of the selected video track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    /// Container track id.
    pub track_id: u32,
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// Ticks per second for every timestamp of this track.
    pub timescale: u32,
    /// Track duration in ticks.
    pub duration: i64,
    /// Number of samples in the track.
    pub sample_count: usize,
    /// Duration of one frame at the nominal rate, in ticks.
    pub frame_duration: i64,
    /// Smallest `pts - dts` over all samples (negative with edit-list shifts).
    pub min_composition_offset: i64,
}

impl TrackInfo {
    /// Nominal frame rate in frames per second.
    #[must_use]
    pub fn frame_rate(&self) -> f64 {
        if self.frame_duration <= 0 {
            return 0.0;
        }
        self.timescale as f64 / self.frame_duration as f64
    }

    /// Track duration in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.ticks_to_seconds(self.duration)
    }

    /// Convert seconds to track ticks, rounding to the nearest tick.
    #[must_use]
    pub fn seconds_to_ticks(&self, seconds: f64) -> i64 {
        (seconds * self.timescale as f64).round() as i64
    }

    /// Convert track ticks to seconds.
    #[must_use]
    pub fn ticks_to_seconds(&self, ticks: i64) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        ticks as f64 / self.timescale as f64
    }
}

/// Codec configuration needed to build a decode session for one track.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatConfig {
    /// Codec family.
    pub codec: Codec,
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// Ticks per second of sample timestamps.
    pub timescale: u32,
    /// Raw decoder configuration record (the `avcC` payload for H.264).
    pub parameter_blob: Bytes,
    /// Sequence parameter sets, without length prefix or start code.
    pub sps: Vec<Bytes>,
    /// Picture parameter sets, without length prefix or start code.
    pub pps: Vec<Bytes>,
    /// Size of the NAL length prefix in samples (1, 2 or 4).
    pub nal_length_size: u8,
}

/// One compressed sample as produced by a sample reader.
#[derive(Debug, Clone)]
pub struct RawSample {
    /// Length-prefixed NAL units.
    pub data: Bytes,
    /// Presentation timestamp in track ticks.
    pub pts: i64,
    /// Decode timestamp in track ticks.
    pub dts: i64,
    /// Sample duration in track ticks.
    pub duration: u32,
    /// Whether the sample is a sync (random access) sample.
    pub keyframe: bool,
}

/// A compressed sample stamped by the demux session.
#[derive(Debug, Clone)]
pub struct CompressedSample {
    /// Length-prefixed NAL units.
    pub data: Bytes,
    /// Presentation timestamp in track ticks.
    pub pts: i64,
    /// Decode timestamp in track ticks.
    pub dts: i64,
    /// Sample duration in track ticks.
    pub duration: u32,
    /// Ticks per second.
    pub timescale: u32,
    /// Monotonically increasing decode sequence number.
    pub sequence: u64,
    /// Seek epoch the sample was read in.
    pub epoch: u64,
    /// Whether the sample is a sync sample.
    pub keyframe: bool,
}

impl CompressedSample {
    /// Stamp a reader sample with its sequence number and epoch.
    #[must_use]
    pub fn from_raw(raw: RawSample, timescale: u32, sequence: u64, epoch: u64) -> Self {
        Self {
            data: raw.data,
            pts: raw.pts,
            dts: raw.dts,
            duration: raw.duration,
            timescale,
            sequence,
            epoch,
            keyframe: raw.keyframe,
        }
    }

    /// Presentation time in seconds.
    #[must_use]
    pub fn pts_seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.pts as f64 / self.timescale as f64
    }
}

/// User-facing properties of an opened video.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProperties {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Duration in seconds.
    pub duration: f64,
    /// Nominal frame rate.
    pub frame_rate: f64,
    /// Pixel format of decoded frames.
    pub format: PixelFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pixel_format(), PixelFormat::Nv12);
        assert!(DecoderConfig::new().for_scrubbing().validate().is_ok());
        assert!(DecoderConfig::new().for_playback().validate().is_ok());
    }

    #[test]
    fn test_reorder_capacity_must_cover_in_flight() {
        let config = DecoderConfig::new().in_flight_limit(8).reorder_capacity(4);
        assert!(matches!(
            config.validate(),
            Err(DecodeError::InvalidConfig(_))
        ));

        let config = DecoderConfig::new().in_flight_limit(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_track_time_conversions() {
        let track = TrackInfo {
            track_id: 1,
            width: 1920,
            height: 1080,
            timescale: 30000,
            duration: 300_000,
            sample_count: 300,
            frame_duration: 1000,
            min_composition_offset: 0,
        };
        assert!((track.frame_rate() - 30.0).abs() < 1e-9);
        assert!((track.duration_seconds() - 10.0).abs() < 1e-9);
        assert_eq!(track.seconds_to_ticks(1.5), 45_000);
        assert!((track.ticks_to_seconds(15_000) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_codec_from_sample_entry() {
        assert_eq!(Codec::from_sample_entry(b"avc1"), Some(Codec::H264));
        assert_eq!(Codec::from_sample_entry(b"avc3"), Some(Codec::H264));
        assert_eq!(Codec::from_sample_entry(b"hvc1"), None);
    }

    #[test]
    fn test_p010_layout() {
        assert_eq!(PixelFormat::P010.bytes_per_component(), 2);
        assert_eq!(PixelFormat::P010.bit_depth(), 10);
        assert_eq!(PixelFormat::Nv12.bytes_per_component(), 1);
    }
}
