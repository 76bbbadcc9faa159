//! Platform seams: media sources, sample readers and decode engines.
//!
//! The pipeline talks to the operating system through three groups of calls:
//! opening a container and reading samples ([`MediaSource`], [`SampleReader`]),
//! running an asynchronous decompression session ([`DecodeEngine`],
//! [`EngineSession`]) and handing decoded memory to a GPU ([`PlatformBuffer`]).
//! Each backend implements these traits; everything above them is portable.

use std::fmt;
use std::time::Duration;

use crate::{CompressedSample, CpuImage, DecodeError, FormatConfig, PixelFormat, RawSample, TrackInfo};

/// Codec description stored with a track, before any parameter parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDescription {
    /// Sample entry four-character code (e.g. `avc1`).
    pub entry_type: [u8; 4],
    /// Coded width from the sample entry.
    pub width: u32,
    /// Coded height from the sample entry.
    pub height: u32,
    /// Decoder configuration record payload (`avcC`), if present.
    pub config_record: Option<bytes::Bytes>,
}

/// An opened container with one selected video track.
pub trait MediaSource: Send {
    /// The selected video track.
    fn track(&self) -> &TrackInfo;

    /// Track-level codec description. Must not require reading samples.
    fn sample_description(&self) -> Result<SampleDescription, DecodeError>;

    /// PTS of the latest sync sample at or before `pts` (or the first sample).
    fn sync_point(&self, pts: i64) -> i64;

    /// Construct a fresh reader covering the sync sample at or before `start`
    /// up to the first sync sample at or after `end`.
    fn open_range(&self, start: i64, end: i64) -> Result<Box<dyn SampleReader>, DecodeError>;
}

/// State of a sample reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStatus {
    /// Samples may still be produced.
    Reading,
    /// The range has been fully read.
    Completed,
    /// The reader hit an unrecoverable error.
    Failed(String),
    /// The reader was cancelled.
    Cancelled,
}

/// Outcome of one read attempt.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// The next sample in decode order.
    Sample(RawSample),
    /// Nothing available within the wait; try again.
    Pending,
    /// The range is done. `resume` is the PTS to open the next range at,
    /// or `None` at the end of the track.
    Exhausted { resume: Option<i64> },
}

/// A forward-only reader over a range of samples. Readers never rewind;
/// repositioning means cancelling this one and opening another.
pub trait SampleReader: Send {
    /// Current reader state, checked before every read.
    fn status(&self) -> ReaderStatus;

    /// Read the next sample, waiting at most `wait`.
    fn read(&mut self, wait: Duration) -> Result<ReadOutcome, DecodeError>;

    /// Stop the reader. Further reads fail.
    fn cancel(&mut self);
}

/// Identifies one submitted sample across the asynchronous decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken {
    /// Decode session the sample was submitted to.
    pub session: u64,
    /// Seek epoch of the sample.
    pub epoch: u64,
    /// Decode sequence number.
    pub sequence: u64,
    /// Presentation timestamp in track ticks.
    pub pts: i64,
}

/// A decode result reported by an engine.
pub struct Completion {
    /// Token of the submitted sample.
    pub token: FrameToken,
    /// Decoded image, or the per-sample failure.
    pub result: Result<Box<dyn PlatformBuffer>, DecodeError>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

/// Routes completions back to the owning session.
///
/// The sink carries only the session id and a plain function; the receiving
/// side resolves the id through its registry, so a completion for a session
/// that has been torn down finds nothing and is dropped.
#[derive(Clone, Copy)]
pub struct CompletionSink {
    session: u64,
    deliver: fn(u64, Completion),
}

impl CompletionSink {
    /// Create a sink for a session id.
    #[must_use]
    pub fn new(session: u64, deliver: fn(u64, Completion)) -> Self {
        Self { session, deliver }
    }

    /// The session id this sink delivers to.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Deliver one completion.
    pub fn deliver(&self, completion: Completion) {
        (self.deliver)(self.session, completion);
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink")
            .field("session", &self.session)
            .finish()
    }
}

/// Native handle of a GPU-importable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeTexture {
    /// macOS IOSurface, importable as a Metal texture per plane.
    IoSurface { surface_id: u32, planes: u32 },
    /// Backend-specific handle.
    Opaque(u64),
}

/// Decoded image memory owned by a platform.
///
/// Dropping the value releases the platform's reference.
pub trait PlatformBuffer: Send + Sync {
    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// Pixel format of the planes.
    fn pixel_format(&self) -> PixelFormat;

    /// Native handle for GPU import, or `UnsupportedZeroCopy`.
    fn export_native(&self) -> Result<NativeTexture, DecodeError>;

    /// Copy the planes into system memory.
    fn read_planes(&self) -> Result<CpuImage, DecodeError>;
}

/// A decompression engine (VideoToolbox, software, ...).
pub trait DecodeEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether decoded buffers can be exported without a copy.
    fn supports_zero_copy(&self) -> bool;

    /// Create a session bound to one format. Completions go to `sink`.
    fn create_session(
        &self,
        format: &FormatConfig,
        pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError>;
}

/// One running decompression session.
pub trait EngineSession: Send {
    /// Queue a sample for asynchronous decode. Exactly one completion must
    /// eventually be delivered for every accepted sample, unless the session
    /// is invalidated first.
    fn submit(&mut self, token: FrameToken, sample: &CompressedSample) -> Result<(), DecodeError>;

    /// Emit any delayed frames and block until every accepted sample has
    /// produced its completion.
    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError>;

    /// Tear the session down. Completions that still arrive afterwards are
    /// discarded by the receiving side.
    fn invalidate(&mut self);
}
