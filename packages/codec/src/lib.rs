//! Platform-neutral building blocks for the vpreview decode pipeline.
//!
//! This crate holds everything the pipeline shares with its platform
//! backends:
//!
//! - **Errors** ([`DecodeError`]): the full failure taxonomy, with
//!   retryable/terminal classification and a panic-catching boundary helper.
//! - **Types**: [`DecoderConfig`], [`FormatConfig`], [`TrackInfo`],
//!   [`CompressedSample`], [`VideoProperties`] and friends.
//! - **Traits**: [`MediaSource`] / [`SampleReader`] for demuxing,
//!   [`DecodeEngine`] / [`EngineSession`] for asynchronous decompression and
//!   [`PlatformBuffer`] for decoded memory.
//! - **CPU frames** ([`CpuImage`]) and plane conversion helpers used by the
//!   copy fallback.
//!
//! # Quick Start (Configuration)
//!
//! ```
//! use vpreview_codec::{DecoderConfig, PixelFormat};
//!
//! let config = DecoderConfig::new()
//!     .preferred_format(PixelFormat::Nv12)
//!     .for_scrubbing();
//! assert!(config.validate().is_ok());
//! ```

mod error;
mod frame;
mod traits;
mod types;

pub use error::{catch_platform, panic_message, DecodeError};
pub use frame::{copy_plane, expected_frame_size, i420_to_nv12, plane_sizes, CpuImage, I420Strides};
pub use traits::{
    Completion, CompletionSink, DecodeEngine, EngineSession, FrameToken, MediaSource,
    NativeTexture, PlatformBuffer, ReadOutcome, ReaderStatus, SampleDescription, SampleReader,
};
pub use types::{
    Codec, CompressedSample, DecoderConfig, FormatConfig, PixelFormat, RawSample, TrackInfo,
    VideoProperties,
};
