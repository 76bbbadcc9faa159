//! CPU-side frame storage and plane conversions.

use crate::{DecodeError, PixelFormat};

/// A decoded frame copied into system memory.
///
/// Planes are tightly packed: `y_plane` holds `height` rows of
/// `width * bytes_per_component` bytes and `uv_plane` holds `height / 2` rows
/// of interleaved chroma of the same row length.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuImage {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format of both planes.
    pub format: PixelFormat,
    /// Luma plane.
    pub y_plane: Vec<u8>,
    /// Interleaved chroma plane.
    pub uv_plane: Vec<u8>,
}

impl CpuImage {
    /// Create an image from packed planes, checking their sizes.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        y_plane: Vec<u8>,
        uv_plane: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        let (y_len, uv_len) = plane_sizes(width, height, format);
        if y_plane.len() != y_len || uv_plane.len() != uv_len {
            return Err(DecodeError::decode_failed(
                0,
                format!(
                    "{format:?} {width}x{height} plane size mismatch: expected {y_len}+{uv_len}, got {}+{}",
                    y_plane.len(),
                    uv_plane.len()
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            y_plane,
            uv_plane,
        })
    }

    /// An image filled with a constant luma value and neutral chroma.
    #[must_use]
    pub fn filled(width: u32, height: u32, format: PixelFormat, luma: u8) -> Self {
        let (y_len, uv_len) = plane_sizes(width, height, format);
        let neutral = match format {
            PixelFormat::Nv12 => vec![128u8; uv_len],
            // 512 << 6, little-endian
            PixelFormat::P010 => [0x00u8, 0x80].repeat(uv_len / 2),
        };
        let y_plane = match format {
            PixelFormat::Nv12 => vec![luma; y_len],
            PixelFormat::P010 => ((luma as u16) << 8).to_le_bytes().repeat(y_len / 2),
        };
        Self {
            width,
            height,
            format,
            y_plane,
            uv_plane: neutral,
        }
    }

    /// Total byte size of both planes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.y_plane.len() + self.uv_plane.len()
    }

    /// Concatenate both planes into one contiguous buffer.
    #[must_use]
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        out.extend_from_slice(&self.y_plane);
        out.extend_from_slice(&self.uv_plane);
        out
    }
}

/// Packed luma and chroma plane sizes in bytes.
#[must_use]
pub fn plane_sizes(width: u32, height: u32, format: PixelFormat) -> (usize, usize) {
    let bpc = format.bytes_per_component();
    let w = width as usize;
    let h = height as usize;
    let chroma_rows = h.div_ceil(2);
    let chroma_row_bytes = w.div_ceil(2) * 2 * bpc;
    (w * h * bpc, chroma_rows * chroma_row_bytes)
}

/// Calculate expected frame size for given dimensions and format.
#[must_use]
pub fn expected_frame_size(width: u32, height: u32, format: PixelFormat) -> usize {
    let (y, uv) = plane_sizes(width, height, format);
    y + uv
}

/// Copy `rows` rows of `row_bytes` bytes out of a strided plane.
pub fn copy_plane(
    src: &[u8],
    stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<Vec<u8>, DecodeError> {
    if stride < row_bytes {
        return Err(DecodeError::decode_failed(
            0,
            format!("plane stride {stride} shorter than row {row_bytes}"),
        ));
    }
    let needed = if rows == 0 {
        0
    } else {
        stride * (rows - 1) + row_bytes
    };
    if src.len() < needed {
        return Err(DecodeError::decode_failed(
            0,
            format!("plane too small: expected {needed}, got {}", src.len()),
        ));
    }

    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + row_bytes]);
    }
    Ok(out)
}

/// Strides of the three I420 planes.
#[derive(Debug, Clone, Copy)]
pub struct I420Strides {
    pub y: usize,
    pub u: usize,
    pub v: usize,
}

/// Convert strided I420 planes into a packed NV12 image.
pub fn i420_to_nv12(
    y: &[u8],
    u: &[u8],
    v: &[u8],
    strides: I420Strides,
    width: u32,
    height: u32,
) -> Result<CpuImage, DecodeError> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let y_plane = copy_plane(y, strides.y, w, h)?;
    let u_plane = copy_plane(u, strides.u, cw, ch)?;
    let v_plane = copy_plane(v, strides.v, cw, ch)?;

    // Interleave U and V planes
    let mut uv_plane = vec![0u8; cw * ch * 2];
    for i in 0..cw * ch {
        uv_plane[i * 2] = u_plane[i];
        uv_plane[i * 2 + 1] = v_plane[i];
    }

    CpuImage::new(width, height, PixelFormat::Nv12, y_plane, uv_plane)
}
