//! vpreview - random-access H.264 decoding for scrubbable previews.
//!
//! Frames are decoded asynchronously by a platform engine and handed out as
//! reference-counted surfaces that can be imported into a GPU API without
//! copying, or copied into system memory when zero-copy is unavailable.
//!
//! # Pipeline
//!
//! - [`mp4`]: MP4 sample tables and forward-only range readers.
//! - [`demux`]: compressed samples in decode order, seek by epoch.
//! - [`format`]: H.264 decoder configuration from the sample description.
//! - [`session`]: one asynchronous decode session with completion routing.
//! - [`reorder`]: display-order release of decoded surfaces.
//! - [`decoder`]: the [`Decoder`] facade tying it all together.
//!
//! # Example
//!
//! ```no_run
//! use vpreview::{Decoder, DecoderConfig};
//!
//! let mut decoder = Decoder::open("clip.mp4", DecoderConfig::new().for_scrubbing())?;
//! let frame = decoder.decode_frame_zero_copy(2.5)?;
//! println!("{}x{} at {:.3}s", frame.width, frame.height, frame.pts);
//! decoder.close();
//! # Ok::<(), vpreview::DecodeError>(())
//! ```

pub mod decoder;
pub mod demux;
pub mod engine;
pub mod format;
pub mod mp4;
pub mod nal;
pub mod reorder;
pub mod session;
pub mod surface;

#[cfg(test)]
mod testing;

pub use vpreview_codec as codec;

pub use decoder::{Decoder, DecoderStats, Frame, FrameData};
pub use engine::{default_engine, is_hardware_decoding_available};
pub use surface::{DecodedSurface, ExternalTextureHandle};
pub use vpreview_codec::{
    CpuImage, DecodeError, DecoderConfig, FormatConfig, NativeTexture, PixelFormat,
    VideoProperties,
};
