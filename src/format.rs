//! Format descriptor: track-level codec configuration for session creation.
//!
//! Extraction reads only the sample description of the track, never sample
//! data, and is idempotent.

use bytes::Bytes;
use vpreview_codec::{Codec, DecodeError, FormatConfig, MediaSource};

/// Parsed `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub nal_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

/// Parse an `avcC` payload.
pub fn parse_avc_config(record: &Bytes) -> Result<AvcDecoderConfig, DecodeError> {
    let truncated = || DecodeError::format("avcC record truncated");
    if record.len() < 7 {
        return Err(truncated());
    }
    if record[0] != 1 {
        return Err(DecodeError::format(format!(
            "unsupported avcC version {}",
            record[0]
        )));
    }
    let nal_length_size = (record[4] & 0x03) + 1;
    if nal_length_size == 3 {
        return Err(DecodeError::format("NAL length size 3 is not valid"));
    }

    let mut pos = 5;
    let read_sets = |count: usize, pos: &mut usize| -> Result<Vec<Bytes>, DecodeError> {
        let mut sets = Vec::with_capacity(count);
        for _ in 0..count {
            let hdr = record.get(*pos..*pos + 2).ok_or_else(truncated)?;
            let len = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
            *pos += 2;
            if *pos + len > record.len() {
                return Err(truncated());
            }
            sets.push(record.slice(*pos..*pos + len));
            *pos += len;
        }
        Ok(sets)
    };

    let num_sps = (record[pos] & 0x1F) as usize;
    pos += 1;
    let sps = read_sets(num_sps, &mut pos)?;
    let num_pps = *record.get(pos).ok_or_else(truncated)? as usize;
    pos += 1;
    let pps = read_sets(num_pps, &mut pos)?;

    Ok(AvcDecoderConfig {
        profile: record[1],
        compatibility: record[2],
        level: record[3],
        nal_length_size,
        sps,
        pps,
    })
}

/// Extract the decode configuration of a source's selected track.
pub fn extract(source: &dyn MediaSource) -> Result<FormatConfig, DecodeError> {
    let track = source.track();
    let desc = source.sample_description()?;
    let codec = Codec::from_sample_entry(&desc.entry_type).ok_or_else(|| {
        DecodeError::format(format!(
            "unsupported sample entry '{}'",
            String::from_utf8_lossy(&desc.entry_type)
        ))
    })?;
    let record = desc
        .config_record
        .ok_or_else(|| DecodeError::format("sample entry has no avcC box"))?;
    let avc = parse_avc_config(&record)?;
    if avc.sps.is_empty() || avc.pps.is_empty() {
        return Err(DecodeError::format(
            "avcC carries no SPS/PPS (in-band parameter sets are not supported)",
        ));
    }

    let width = if desc.width > 0 { desc.width } else { track.width };
    let height = if desc.height > 0 { desc.height } else { track.height };
    if width == 0 || height == 0 {
        return Err(DecodeError::format("track has no dimensions"));
    }

    tracing::debug!(
        "[format] avc profile={} level={} nal_len={} sps={} pps={}",
        avc.profile,
        avc.level,
        avc.nal_length_size,
        avc.sps.len(),
        avc.pps.len()
    );
    Ok(FormatConfig {
        codec,
        width,
        height,
        timescale: track.timescale,
        parameter_blob: record,
        sps: avc.sps,
        pps: avc.pps,
        nal_length_size: avc.nal_length_size,
    })
}
