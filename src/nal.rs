//! H.264 NAL unit helpers: length-prefixed (AVCC) to Annex B conversion.

use vpreview_codec::DecodeError;

/// H.264 NAL unit type constants.
pub mod nal_unit_type {
    /// IDR slice (keyframe)
    pub const IDR_SLICE: u8 = 5;
}

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type of a raw NAL (first byte & 0x1F).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Split a length-prefixed sample into its NAL units.
pub fn split_length_prefixed(data: &[u8], length_size: u8) -> Result<Vec<&[u8]>, DecodeError> {
    let len_size = length_size as usize;
    if !matches!(len_size, 1 | 2 | 4) {
        return Err(DecodeError::format(format!(
            "unsupported NAL length size {length_size}"
        )));
    }

    let mut nals = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + len_size > data.len() {
            return Err(DecodeError::read_failed(format!(
                "truncated NAL length at offset {pos}"
            )));
        }
        let len = data[pos..pos + len_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += len_size;
        if pos + len > data.len() {
            return Err(DecodeError::read_failed(format!(
                "NAL of {len} bytes overruns sample at offset {pos}"
            )));
        }
        if len > 0 {
            nals.push(&data[pos..pos + len]);
        }
        pos += len;
    }
    Ok(nals)
}

/// Convert a length-prefixed sample to Annex B (0x00000001 start codes).
pub fn avcc_to_annex_b(data: &[u8], length_size: u8) -> Result<Vec<u8>, DecodeError> {
    let nals = split_length_prefixed(data, length_size)?;
    let mut out = Vec::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    Ok(out)
}

/// Join parameter sets into one Annex B buffer.
pub fn parameter_sets_annex_b<'a>(sets: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for set in sets {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(set);
    }
    out
}

/// Whether a length-prefixed sample contains an IDR slice.
pub fn contains_idr(data: &[u8], length_size: u8) -> bool {
    split_length_prefixed(data, length_size)
        .map(|nals| {
            nals.iter()
                .any(|n| nal_type(n) == Some(nal_unit_type::IDR_SLICE))
        })
        .unwrap_or(false)
}
