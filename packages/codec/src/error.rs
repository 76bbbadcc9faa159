//! Error types for the decode pipeline.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while demuxing, decoding or exporting frames.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The container could not be opened or is not a supported file.
    #[error("failed to open {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// The container has no video track.
    #[error("no video track found")]
    TrackNotFound,

    /// A sample reader could not be constructed for the requested range.
    #[error("failed to start sample reader: {0}")]
    ReaderStartFailed(String),

    /// Pulling the next sample from the reader failed.
    #[error("failed to read sample: {0}")]
    ReadFailed(String),

    /// Track-level codec configuration is missing or malformed.
    #[error("format extraction failed: {0}")]
    FormatExtractionFailed(String),

    /// The decode engine refused to create a session.
    #[error("failed to create decode session: {0}")]
    SessionCreateFailed(String),

    /// A sample could not be handed to the decode engine.
    #[error("failed to submit sample {sequence}: {reason}")]
    DecodeSubmitFailed { sequence: u64, reason: String },

    /// The engine reported a failure for one sample.
    #[error("decode failed for sample {sequence}: {reason}")]
    DecodeFailed { sequence: u64, reason: String },

    /// Repositioning the reader failed.
    #[error("seek to {target:.3}s failed: {reason}")]
    SeekFailed { target: f64, reason: String },

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The decoded surface cannot be handed to the GPU without a copy.
    #[error("zero-copy export is not supported for this surface")]
    UnsupportedZeroCopy,

    /// A result tagged with an older epoch was dropped.
    #[error("discarded result from stale epoch {stale} (current {current})")]
    StaleEpochDiscard { stale: u64, current: u64 },

    /// No frame exists at or after the requested time.
    #[error("end of stream")]
    EndOfStream,

    /// The decoder was closed, or poisoned by an earlier terminal error.
    #[error("decoder is closed")]
    Closed,

    /// The decoder configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DecodeError {
    /// Create an OpenFailed error for a path.
    pub fn open_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OpenFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a ReaderStartFailed error with a message.
    pub fn reader_start(msg: impl Into<String>) -> Self {
        Self::ReaderStartFailed(msg.into())
    }

    /// Create a ReadFailed error with a message.
    pub fn read_failed(msg: impl Into<String>) -> Self {
        Self::ReadFailed(msg.into())
    }

    /// Create a FormatExtractionFailed error with a message.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::FormatExtractionFailed(msg.into())
    }

    /// Create a SessionCreateFailed error with a message.
    pub fn session_create(msg: impl Into<String>) -> Self {
        Self::SessionCreateFailed(msg.into())
    }

    /// Create a DecodeSubmitFailed error for a sample.
    pub fn submit_failed(sequence: u64, reason: impl Into<String>) -> Self {
        Self::DecodeSubmitFailed {
            sequence,
            reason: reason.into(),
        }
    }

    /// Create a DecodeFailed error for a sample.
    pub fn decode_failed(sequence: u64, reason: impl Into<String>) -> Self {
        Self::DecodeFailed {
            sequence,
            reason: reason.into(),
        }
    }

    /// Create a SeekFailed error for a target time in seconds.
    pub fn seek_failed(target: f64, reason: impl Into<String>) -> Self {
        Self::SeekFailed {
            target,
            reason: reason.into(),
        }
    }

    /// Errors after which the same call may simply be repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DecodeFailed { .. })
    }

    /// Errors that leave the decoder instance unusable until it is reopened.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OpenFailed { .. } | Self::TrackNotFound | Self::SessionCreateFailed(_)
        )
    }
}

/// Run a call into platform code, turning an escaping panic into a typed error.
///
/// `on_panic` receives the panic message and picks the error variant that fits
/// the call site (a panicking `submit` is a `DecodeSubmitFailed`, and so on).
pub fn catch_platform<T, F, P>(f: F, on_panic: P) -> Result<T, DecodeError>
where
    F: FnOnce() -> Result<T, DecodeError>,
    P: FnOnce(String) -> DecodeError,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!("[platform] caught panic at engine boundary: {msg}");
            Err(on_panic(format!("platform panic: {msg}")))
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
