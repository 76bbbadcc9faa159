//! Decode engine selection.
//!
//! Backends: videotoolbox (macOS, zero-copy IOSurface output) and openh264
//! (software fallback, CPU frames only). Both are feature-gated.

use std::sync::Arc;

use vpreview_codec::{DecodeEngine, DecodeError, DecoderConfig};

#[cfg(feature = "openh264")]
pub mod software;
#[cfg(all(target_os = "macos", feature = "videotoolbox"))]
pub mod videotoolbox;

/// Whether a hardware H.264 decoder is usable on this machine.
pub fn is_hardware_decoding_available() -> bool {
    #[cfg(all(target_os = "macos", feature = "videotoolbox"))]
    {
        return videotoolbox::is_available();
    }
    #[allow(unreachable_code)]
    false
}

/// Pick the engine for `config`.
///
/// Hardware is used when it is requested and available; otherwise the
/// software engine, if compiled in.
pub fn default_engine(config: &DecoderConfig) -> Result<Arc<dyn DecodeEngine>, DecodeError> {
    if config.hardware_acceleration && is_hardware_decoding_available() {
        #[cfg(all(target_os = "macos", feature = "videotoolbox"))]
        {
            tracing::info!("[engine] using VideoToolbox");
            return Ok(Arc::new(videotoolbox::VideoToolboxEngine::new()));
        }
    }
    if config.hardware_acceleration {
        tracing::warn!("[engine] hardware decoding unavailable, falling back to software");
    }
    software_engine(config)
}

#[cfg(feature = "openh264")]
fn software_engine(_config: &DecoderConfig) -> Result<Arc<dyn DecodeEngine>, DecodeError> {
    tracing::info!("[engine] using openh264");
    Ok(Arc::new(software::SoftwareEngine::new()))
}

#[cfg(not(feature = "openh264"))]
fn software_engine(_config: &DecoderConfig) -> Result<Arc<dyn DecodeEngine>, DecodeError> {
    Err(DecodeError::session_create(
        "no decode engine available (enable the `videotoolbox` or `openh264` feature)",
    ))
}
