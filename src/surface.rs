//! Decoded surfaces: shared, refcounted platform images.
//!
//! A [`DecodedSurface`] wraps one platform buffer. Clones share the buffer;
//! the platform reference is released exactly once, when the last clone or
//! exported [`ExternalTextureHandle`] is dropped, on whatever thread that
//! happens to be.

use std::fmt;
use std::sync::{Arc, OnceLock};

use vpreview_codec::{CpuImage, DecodeError, NativeTexture, PixelFormat, PlatformBuffer};

struct SurfaceInner {
    buffer: Box<dyn PlatformBuffer>,
    pts: i64,
    timescale: u32,
    sequence: u64,
    epoch: u64,
    exported: OnceLock<Result<NativeTexture, DecodeError>>,
}

/// A decoded image with its presentation timestamp.
#[derive(Clone)]
pub struct DecodedSurface {
    inner: Arc<SurfaceInner>,
}

impl DecodedSurface {
    pub fn new(
        buffer: Box<dyn PlatformBuffer>,
        pts: i64,
        timescale: u32,
        sequence: u64,
        epoch: u64,
    ) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                buffer,
                pts,
                timescale,
                sequence,
                epoch,
                exported: OnceLock::new(),
            }),
        }
    }

    /// Presentation timestamp in track ticks.
    pub fn pts(&self) -> i64 {
        self.inner.pts
    }

    /// Presentation timestamp in seconds.
    pub fn pts_seconds(&self) -> f64 {
        if self.inner.timescale == 0 {
            return 0.0;
        }
        self.inner.pts as f64 / self.inner.timescale as f64
    }

    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn width(&self) -> u32 {
        self.inner.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.buffer.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.inner.buffer.pixel_format()
    }

    /// Take another reference. Same as `clone`.
    pub fn acquire(&self) -> Self {
        self.clone()
    }

    /// Drop this reference. The platform buffer goes when the last one does.
    pub fn release(self) {}

    /// Number of live references (clones plus exported handles).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Export the surface for GPU import without copying.
    ///
    /// The platform export runs at most once per surface; later calls return
    /// the same native handle (or the same failure). The handle keeps the
    /// surface alive until it is dropped.
    pub fn export_for_gpu(&self) -> Result<ExternalTextureHandle, DecodeError> {
        let exported = self
            .inner
            .exported
            .get_or_init(|| self.inner.buffer.export_native());
        let texture = exported.clone()?;
        Ok(ExternalTextureHandle {
            surface: self.clone(),
            texture,
        })
    }

    /// Copy the planes into system memory.
    pub fn copy_to_cpu(&self) -> Result<CpuImage, DecodeError> {
        self.inner.buffer.read_planes().map_err(|e| match e {
            DecodeError::DecodeFailed { reason, .. } => {
                DecodeError::decode_failed(self.inner.sequence, reason)
            }
            other => other,
        })
    }
}

impl fmt::Debug for DecodedSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedSurface")
            .field("pts", &self.inner.pts)
            .field("sequence", &self.inner.sequence)
            .field("epoch", &self.inner.epoch)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.pixel_format())
            .finish()
    }
}

/// A GPU-importable view of a decoded surface.
///
/// Holding the handle keeps the underlying platform image alive.
#[derive(Debug, Clone)]
pub struct ExternalTextureHandle {
    surface: DecodedSurface,
    texture: NativeTexture,
}

impl ExternalTextureHandle {
    /// The native handle (e.g. an IOSurface id) to import.
    pub fn texture(&self) -> NativeTexture {
        self.texture
    }

    pub fn surface(&self) -> &DecodedSurface {
        &self.surface
    }

    pub fn width(&self) -> u32 {
        self.surface.width()
    }

    pub fn height(&self) -> u32 {
        self.surface.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.surface.pixel_format()
    }
}
