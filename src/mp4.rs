//! Pure-Rust ISO-BMFF (MP4/MOV) demuxer for progressive files.
//!
//! Only the `moov` box is loaded into memory. Sample payloads are read on
//! demand from the file by offset, so opening a multi-gigabyte clip costs the
//! size of its sample tables.
//!
//! # Structure
//!
//! ```text
//! moov
//!   trak
//!     tkhd                    track id
//!     edts/elst               presentation shift
//!     mdia
//!       mdhd                  timescale, duration
//!       hdlr                  'vide'
//!       minf/stbl
//!         stsd/avc1/avcC      codec description
//!         stts ctts           decode deltas, composition offsets
//!         stss                sync samples
//!         stsc stsz stco/co64 sample -> chunk -> file offset
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vpreview_codec::{
    DecodeError, MediaSource, RawSample, ReadOutcome, ReaderStatus, SampleDescription,
    SampleReader, TrackInfo,
};

/// Upper bound on the in-memory `moov` payload.
const MAX_MOOV_SIZE: u64 = 256 * 1024 * 1024;

// ============================================================================
// Box parser
// ============================================================================

/// Parsed box header from an ISO-BMFF byte stream.
#[derive(Debug, Clone)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    pub offset: usize,
    pub size: usize,
    pub header_size: usize,
}

impl BoxHeader {
    /// Returns the content bytes (after the header) within the given data slice.
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + self.header_size;
        let end = (self.offset + self.size).min(data.len());
        if start >= end {
            &[]
        } else {
            &data[start..end]
        }
    }
}

/// Iterate over the boxes at one nesting level of a byte slice.
///
/// Handles 64-bit `largesize` headers and size 0 ("extends to the end").
pub fn iter_boxes(data: &[u8]) -> Vec<BoxHeader> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let Some(size32) = be_u32(data, offset) else {
            break;
        };
        let box_type: [u8; 4] = [
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ];
        let (size, header_size) = match size32 {
            0 => (data.len() - offset, 8),
            1 => match be_u64(data, offset + 8) {
                Some(large) => (usize::try_from(large).unwrap_or(usize::MAX), 16),
                None => break,
            },
            n => (n as usize, 8),
        };
        if size < header_size {
            break;
        }
        boxes.push(BoxHeader {
            box_type,
            offset,
            size: size.min(data.len() - offset),
            header_size,
        });
        match offset.checked_add(size) {
            Some(next) => offset = next,
            None => break,
        }
    }
    boxes
}

/// Find a specific box by type (non-recursive, searches one level only).
pub fn find_box(data: &[u8], box_type: &[u8; 4]) -> Option<BoxHeader> {
    iter_boxes(data)
        .into_iter()
        .find(|b| &b.box_type == box_type)
}

/// Find a box by navigating a path of nested container boxes.
/// Returns the content bytes of the final box in the path.
pub fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    if path.is_empty() {
        return Some(data);
    }
    let header = find_box(data, path[0])?;
    let content = header.content(data);
    if path.len() == 1 {
        Some(content)
    } else {
        find_box_path(content, &path[1..])
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes = data.get(at..at + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(u64::from_be_bytes(buf))
}

// ============================================================================
// Sample tables
// ============================================================================

/// Location and timing of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    /// Absolute file offset of the payload.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Decode timestamp in track ticks.
    pub dts: i64,
    /// Presentation timestamp in track ticks.
    pub pts: i64,
    /// Decode duration in track ticks.
    pub duration: u32,
    /// Random access point.
    pub sync: bool,
}

/// All samples of a track in decode order.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    samples: Vec<SampleEntry>,
    sync_indices: Vec<usize>,
}

impl SampleTable {
    fn new(samples: Vec<SampleEntry>) -> Self {
        let sync_indices = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i)
            .collect();
        Self {
            samples,
            sync_indices,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the track has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at a decode index.
    pub fn get(&self, index: usize) -> Option<&SampleEntry> {
        self.samples.get(index)
    }

    /// All samples in decode order.
    pub fn samples(&self) -> &[SampleEntry] {
        &self.samples
    }

    /// Decode indices of sync samples.
    pub fn sync_indices(&self) -> &[usize] {
        &self.sync_indices
    }

    /// Decode index of the sync sample with the greatest PTS at or before `pts`,
    /// falling back to the first sync sample.
    pub fn sync_at_or_before(&self, pts: i64) -> usize {
        let mut best: Option<usize> = None;
        for &idx in &self.sync_indices {
            let candidate = self.samples[idx].pts;
            if candidate > pts {
                continue;
            }
            match best {
                Some(b) if self.samples[b].pts > candidate => {}
                _ => best = Some(idx),
            }
        }
        best.or_else(|| self.sync_indices.first().copied())
            .unwrap_or(0)
    }

    /// First sync sample after decode index `from` whose PTS is at or after `pts`.
    pub fn next_sync_at_or_after(&self, from: usize, pts: i64) -> Option<usize> {
        self.sync_indices
            .iter()
            .copied()
            .find(|&idx| idx > from && self.samples[idx].pts >= pts)
    }
}

/// Parsed video track.
#[derive(Debug, Clone)]
pub struct Mp4Track {
    pub info: TrackInfo,
    pub description: SampleDescription,
    pub table: SampleTable,
}

/// Parse the content of a `moov` box and select the first video track.
///
/// `file_len` bounds the sample tables: no track can index more sample
/// bytes than the file holds.
pub fn parse_moov(moov: &[u8], file_len: u64) -> Result<Option<Mp4Track>, String> {
    for trak in iter_boxes(moov).iter().filter(|b| &b.box_type == b"trak") {
        if let Some(track) = parse_trak(trak.content(moov), file_len)? {
            return Ok(Some(track));
        }
    }
    Ok(None)
}

fn parse_trak(trak: &[u8], file_len: u64) -> Result<Option<Mp4Track>, String> {
    let hdlr = find_box_path(trak, &[b"mdia", b"hdlr"]).ok_or("missing hdlr box")?;
    if hdlr.get(8..12) != Some(b"vide".as_slice()) {
        return Ok(None);
    }

    let track_id = find_box(trak, b"tkhd")
        .map(|b| b.content(trak))
        .and_then(|tkhd| match tkhd.first() {
            Some(1) => be_u32(tkhd, 20),
            Some(_) => be_u32(tkhd, 12),
            None => None,
        })
        .unwrap_or(0);

    let mdhd = find_box_path(trak, &[b"mdia", b"mdhd"]).ok_or("missing mdhd box")?;
    let (timescale, mdhd_duration) = match mdhd.first() {
        Some(1) => (be_u32(mdhd, 20), be_u64(mdhd, 24)),
        Some(_) => (be_u32(mdhd, 12), be_u32(mdhd, 16).map(u64::from)),
        None => (None, None),
    };
    let timescale = timescale.filter(|t| *t > 0).ok_or("invalid mdhd timescale")?;

    let stbl = find_box_path(trak, &[b"mdia", b"minf", b"stbl"]).ok_or("missing stbl box")?;
    let description = parse_stsd(stbl)?;
    let edit_shift = find_box_path(trak, &[b"edts", b"elst"])
        .and_then(parse_elst)
        .unwrap_or(0);
    let samples = build_samples(stbl, edit_shift, file_len)?;

    let decode_end = samples
        .last()
        .map(|s| s.dts + s.duration as i64)
        .unwrap_or(0);
    let duration = match mdhd_duration {
        Some(d) if d > 0 && d != u32::MAX as u64 && d != u64::MAX => d as i64,
        _ => decode_end,
    };
    let min_composition_offset = samples.iter().map(|s| s.pts - s.dts).min().unwrap_or(0);
    let frame_duration = nominal_frame_duration(stbl).unwrap_or(0);

    let info = TrackInfo {
        track_id,
        width: description.width,
        height: description.height,
        timescale,
        duration,
        sample_count: samples.len(),
        frame_duration,
        min_composition_offset,
    };
    Ok(Some(Mp4Track {
        info,
        description,
        table: SampleTable::new(samples),
    }))
}

fn parse_stsd(stbl: &[u8]) -> Result<SampleDescription, String> {
    let stsd = find_box(stbl, b"stsd").ok_or("missing stsd box")?;
    let stsd = stsd.content(stbl);
    // stsd has 8 bytes of version/flags + entry_count before the sample entry
    let entries = stsd.get(8..).ok_or("stsd content too short")?;
    let entry = iter_boxes(entries)
        .into_iter()
        .next()
        .ok_or("stsd has no sample entry")?;
    let content = entry.content(entries);

    // Visual sample entry: 78 bytes of fixed fields, then child boxes
    if content.len() < 78 {
        return Err(format!(
            "{} sample entry too short: {} bytes",
            String::from_utf8_lossy(&entry.box_type),
            content.len()
        ));
    }
    let width = be_u16(content, 24).unwrap_or(0) as u32;
    let height = be_u16(content, 26).unwrap_or(0) as u32;
    let children = &content[78..];
    let config_record = find_box(children, b"avcC")
        .map(|b| Bytes::copy_from_slice(b.content(children)));

    Ok(SampleDescription {
        entry_type: entry.box_type,
        width,
        height,
        config_record,
    })
}

/// Media time of the first non-empty edit, used to shift presentation times.
fn parse_elst(elst: &[u8]) -> Option<i64> {
    let version = *elst.first()?;
    let count = be_u32(elst, 4)? as usize;
    let entry_size = if version == 1 { 20 } else { 12 };
    for i in 0..count {
        let at = 8 + i * entry_size;
        let media_time = if version == 1 {
            be_u64(elst, at + 8)? as i64
        } else {
            be_u32(elst, at + 4)? as i32 as i64
        };
        if media_time >= 0 {
            return Some(media_time);
        }
    }
    None
}

/// Most common stts delta.
fn nominal_frame_duration(stbl: &[u8]) -> Option<i64> {
    let stts = find_box(stbl, b"stts")?;
    let stts = stts.content(stbl);
    let count = be_u32(stts, 4)? as usize;
    (0..count)
        .filter_map(|i| Some((be_u32(stts, 8 + i * 8)?, be_u32(stts, 12 + i * 8)?)))
        .max_by_key(|(n, _)| *n)
        .map(|(_, delta)| delta as i64)
}

fn full_box<'a>(stbl: &'a [u8], box_type: &[u8; 4]) -> Option<&'a [u8]> {
    find_box(stbl, box_type).map(|b| b.content(stbl))
}

fn build_samples(
    stbl: &[u8],
    edit_shift: i64,
    file_len: u64,
) -> Result<Vec<SampleEntry>, String> {
    // stsz: version/flags(4) + sample_size(4) + sample_count(4) [+ sizes]
    let stsz = full_box(stbl, b"stsz").ok_or("missing stsz box")?;
    let uniform = be_u32(stsz, 4).ok_or("stsz too short")?;
    let count = be_u32(stsz, 8).ok_or("stsz too short")? as usize;
    // Every per-table allocation below is sized by `count`
    if uniform == 0 {
        let listed = stsz.len().saturating_sub(12) / 4;
        if count > listed {
            return Err(format!(
                "stsz declares {count} samples but lists {listed} sizes"
            ));
        }
    } else if (count as u64).saturating_mul(uniform as u64) > file_len {
        return Err(format!(
            "stsz declares {count} samples of {uniform} bytes in a {file_len} byte file"
        ));
    }
    let sizes: Vec<u32> = if uniform != 0 {
        vec![uniform; count]
    } else {
        (0..count)
            .map(|i| be_u32(stsz, 12 + i * 4))
            .collect::<Option<_>>()
            .ok_or("stsz size table truncated")?
    };

    // stts: decode deltas
    let stts = full_box(stbl, b"stts").ok_or("missing stts box")?;
    let mut durations = Vec::with_capacity(count);
    let entries = be_u32(stts, 4).ok_or("stts too short")? as usize;
    for i in 0..entries {
        let n = be_u32(stts, 8 + i * 8).ok_or("stts truncated")?;
        let delta = be_u32(stts, 12 + i * 8).ok_or("stts truncated")?;
        for _ in 0..n {
            if durations.len() == count {
                break;
            }
            durations.push(delta);
        }
    }
    if durations.len() < count {
        return Err(format!(
            "stts covers {} of {} samples",
            durations.len(),
            count
        ));
    }

    // ctts: composition offsets (version 0 offsets are read as signed too)
    let mut offsets = vec![0i64; count];
    if let Some(ctts) = full_box(stbl, b"ctts") {
        let entries = be_u32(ctts, 4).ok_or("ctts too short")? as usize;
        let mut idx = 0;
        for i in 0..entries {
            let n = be_u32(ctts, 8 + i * 8).ok_or("ctts truncated")?;
            let off = be_u32(ctts, 12 + i * 8).ok_or("ctts truncated")? as i32 as i64;
            for _ in 0..n {
                if idx == count {
                    break;
                }
                offsets[idx] = off;
                idx += 1;
            }
        }
    }

    // stss: 1-based sync sample numbers; absent means every sample is sync
    let sync: Vec<bool> = match full_box(stbl, b"stss") {
        Some(stss) => {
            let mut flags = vec![false; count];
            let entries = be_u32(stss, 4).ok_or("stss too short")? as usize;
            for i in 0..entries {
                let number = be_u32(stss, 8 + i * 4).ok_or("stss truncated")? as usize;
                if number >= 1 && number <= count {
                    flags[number - 1] = true;
                }
            }
            flags
        }
        None => vec![true; count],
    };

    let chunk_offsets = chunk_offsets(stbl)?;
    let chunk_runs = chunk_runs(stbl)?;

    // Walk chunks, assigning samples to file offsets
    let mut file_offsets = Vec::with_capacity(count);
    let mut sample = 0usize;
    for (run_idx, &(first_chunk, per_chunk)) in chunk_runs.iter().enumerate() {
        let last_chunk = chunk_runs
            .get(run_idx + 1)
            .map(|&(next, _)| next.saturating_sub(1))
            .unwrap_or(chunk_offsets.len());
        for chunk in first_chunk..=last_chunk {
            let Some(&base) = chunk_offsets.get(chunk.wrapping_sub(1)) else {
                break;
            };
            let mut pos = base;
            for _ in 0..per_chunk {
                if sample == count {
                    break;
                }
                file_offsets.push(pos);
                pos += sizes[sample] as u64;
                sample += 1;
            }
        }
    }
    if file_offsets.len() < count {
        return Err(format!(
            "chunk tables cover {} of {} samples",
            file_offsets.len(),
            count
        ));
    }

    let mut samples = Vec::with_capacity(count);
    let mut dts = 0i64;
    for i in 0..count {
        samples.push(SampleEntry {
            offset: file_offsets[i],
            size: sizes[i],
            dts,
            pts: dts + offsets[i] - edit_shift,
            duration: durations[i],
            sync: sync[i],
        });
        dts += durations[i] as i64;
    }
    Ok(samples)
}

fn chunk_offsets(stbl: &[u8]) -> Result<Vec<u64>, String> {
    if let Some(stco) = full_box(stbl, b"stco") {
        let n = be_u32(stco, 4).ok_or("stco too short")? as usize;
        return (0..n)
            .map(|i| be_u32(stco, 8 + i * 4).map(u64::from))
            .collect::<Option<_>>()
            .ok_or_else(|| "stco truncated".to_string());
    }
    if let Some(co64) = full_box(stbl, b"co64") {
        let n = be_u32(co64, 4).ok_or("co64 too short")? as usize;
        return (0..n)
            .map(|i| be_u64(co64, 8 + i * 8))
            .collect::<Option<_>>()
            .ok_or_else(|| "co64 truncated".to_string());
    }
    Err("missing stco/co64 box".into())
}

/// (first_chunk, samples_per_chunk) runs from stsc, chunks 1-based.
fn chunk_runs(stbl: &[u8]) -> Result<Vec<(usize, usize)>, String> {
    let stsc = full_box(stbl, b"stsc").ok_or("missing stsc box")?;
    let n = be_u32(stsc, 4).ok_or("stsc too short")? as usize;
    (0..n)
        .map(|i| {
            let at = 8 + i * 12;
            Some((be_u32(stsc, at)? as usize, be_u32(stsc, at + 4)? as usize))
        })
        .collect::<Option<_>>()
        .ok_or_else(|| "stsc truncated".to_string())
}

/// Scan top-level boxes and return the content of `moov`.
fn read_moov(file: &mut File) -> Result<Vec<u8>, String> {
    let len = file.metadata().map_err(|e| e.to_string())?.len();
    let mut pos = 0u64;
    while pos + 8 <= len {
        file.seek(SeekFrom::Start(pos)).map_err(|e| e.to_string())?;
        let mut hdr = [0u8; 16];
        file.read_exact(&mut hdr[..8]).map_err(|e| e.to_string())?;
        let size32 = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let box_type = [hdr[4], hdr[5], hdr[6], hdr[7]];
        let (size, header) = match size32 {
            0 => (len - pos, 8u64),
            1 => {
                file.read_exact(&mut hdr[8..16]).map_err(|e| e.to_string())?;
                let mut large = [0u8; 8];
                large.copy_from_slice(&hdr[8..16]);
                (u64::from_be_bytes(large), 16u64)
            }
            n => (n as u64, 8u64),
        };
        if size < header {
            return Err(format!("invalid box size {size} at offset {pos}"));
        }
        if &box_type == b"moov" {
            let content_len = size - header;
            if content_len > MAX_MOOV_SIZE || pos + size > len {
                return Err(format!("moov box of {content_len} bytes is not readable"));
            }
            let mut moov = vec![0u8; content_len as usize];
            file.read_exact(&mut moov).map_err(|e| e.to_string())?;
            return Ok(moov);
        }
        pos = pos.saturating_add(size);
    }
    Err("no moov box (fragmented or truncated file?)".into())
}

// ============================================================================
// MediaSource / SampleReader
// ============================================================================

/// An opened MP4 file with its first video track selected.
pub struct Mp4Source {
    path: PathBuf,
    track: TrackInfo,
    description: SampleDescription,
    table: Arc<SampleTable>,
}

impl Mp4Source {
    /// Open a file and index its first video track.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref().to_path_buf();
        let shown = path.display().to_string();
        let mut file =
            File::open(&path).map_err(|e| DecodeError::open_failed(&shown, e.to_string()))?;
        let moov = read_moov(&mut file).map_err(|e| DecodeError::open_failed(&shown, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| DecodeError::open_failed(&shown, e.to_string()))?
            .len();
        let track = parse_moov(&moov, file_len)
            .map_err(|e| DecodeError::open_failed(&shown, format!("malformed moov: {e}")))?
            .ok_or(DecodeError::TrackNotFound)?;

        tracing::info!(
            "[mp4] {}: track {} {}x{}, {} samples, {} sync, timescale {}",
            shown,
            track.info.track_id,
            track.info.width,
            track.info.height,
            track.table.len(),
            track.table.sync_indices().len(),
            track.info.timescale,
        );
        Ok(Self {
            path,
            track: track.info,
            description: track.description,
            table: Arc::new(track.table),
        })
    }

    /// The sample index of the selected track.
    pub fn table(&self) -> &SampleTable {
        &self.table
    }
}

impl MediaSource for Mp4Source {
    fn track(&self) -> &TrackInfo {
        &self.track
    }

    fn sample_description(&self) -> Result<SampleDescription, DecodeError> {
        Ok(self.description.clone())
    }

    fn sync_point(&self, pts: i64) -> i64 {
        let idx = self.table.sync_at_or_before(pts);
        self.table.get(idx).map(|s| s.pts).unwrap_or(0)
    }

    fn open_range(&self, start: i64, end: i64) -> Result<Box<dyn SampleReader>, DecodeError> {
        let file = File::open(&self.path).map_err(|e| {
            DecodeError::reader_start(format!("{}: {e}", self.path.display()))
        })?;
        let first = self.table.sync_at_or_before(start);
        let (last, resume) = match self.table.next_sync_at_or_after(first, end) {
            Some(idx) => (idx, self.table.get(idx).map(|s| s.pts)),
            None => (self.table.len(), None),
        };
        tracing::debug!(
            "[mp4] reader for samples {first}..{last} (requested {start}..{end}, resume {resume:?})"
        );
        Ok(Box::new(Mp4Reader {
            file,
            table: Arc::clone(&self.table),
            cursor: first.min(last),
            end: last,
            resume,
            status: ReaderStatus::Reading,
        }))
    }
}

/// Forward-only reader over a decode-index range of one track.
pub struct Mp4Reader {
    file: File,
    table: Arc<SampleTable>,
    cursor: usize,
    end: usize,
    resume: Option<i64>,
    status: ReaderStatus,
}

impl SampleReader for Mp4Reader {
    fn status(&self) -> ReaderStatus {
        self.status.clone()
    }

    fn read(&mut self, _wait: Duration) -> Result<ReadOutcome, DecodeError> {
        match &self.status {
            ReaderStatus::Cancelled => return Err(DecodeError::read_failed("reader cancelled")),
            ReaderStatus::Failed(reason) => return Err(DecodeError::read_failed(reason.clone())),
            ReaderStatus::Reading | ReaderStatus::Completed => {}
        }
        if self.cursor >= self.end {
            self.status = ReaderStatus::Completed;
            return Ok(ReadOutcome::Exhausted {
                resume: self.resume,
            });
        }
        let Some(entry) = self.table.get(self.cursor).copied() else {
            self.status = ReaderStatus::Completed;
            return Ok(ReadOutcome::Exhausted { resume: None });
        };

        let mut buf = vec![0u8; entry.size as usize];
        let read = self
            .file
            .seek(SeekFrom::Start(entry.offset))
            .and_then(|_| self.file.read_exact(&mut buf));
        if let Err(e) = read {
            let reason = format!("sample {} at offset {}: {e}", self.cursor, entry.offset);
            self.status = ReaderStatus::Failed(reason.clone());
            return Err(DecodeError::read_failed(reason));
        }
        self.cursor += 1;

        Ok(ReadOutcome::Sample(RawSample {
            data: Bytes::from(buf),
            pts: entry.pts,
            dts: entry.dts,
            duration: entry.duration,
            keyframe: entry.sync,
        }))
    }

    fn cancel(&mut self) {
        self.status = ReaderStatus::Cancelled;
    }
}
