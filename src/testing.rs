//! Test doubles: MP4 fixture writer, scripted engines and flaky sources.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use vpreview_codec::{
    Completion, CompletionSink, CompressedSample, CpuImage, DecodeEngine, DecodeError,
    EngineSession, FormatConfig, FrameToken, MediaSource, NativeTexture, PixelFormat,
    PlatformBuffer, ReadOutcome, ReaderStatus, SampleDescription, SampleReader, TrackInfo,
};

use crate::mp4::Mp4Source;

// ============================================================================
// Fixture files
// ============================================================================

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A unique path in the system temp directory.
pub fn temp_path(tag: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("vpreview-{tag}-{}-{n}.mp4", std::process::id()))
}

/// Shape of a generated H.264 MP4 file.
#[derive(Debug, Clone)]
pub struct FixtureSpec {
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub frame_duration: u32,
    pub frames: usize,
    pub gop: usize,
    pub b_frames: bool,
    pub samples_per_chunk: usize,
    pub co64: bool,
    pub edit_media_time: Option<i64>,
    pub handler: [u8; 4],
}

impl Default for FixtureSpec {
    /// 10 seconds of 1920x1080 at 30 fps, one-second GOPs with B-frames.
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            timescale: 30000,
            frame_duration: 1000,
            frames: 300,
            gop: 30,
            b_frames: true,
            samples_per_chunk: 3,
            co64: false,
            edit_media_time: Some(1000),
            handler: *b"vide",
        }
    }
}

const FIXTURE_SPS: [u8; 8] = [0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9, 0x40, 0x78];
const FIXTURE_PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

/// avcC payload with one SPS and one PPS, 4-byte NAL lengths.
pub fn fixture_avcc() -> Vec<u8> {
    let mut out = vec![1, FIXTURE_SPS[1], FIXTURE_SPS[2], FIXTURE_SPS[3], 0xFF, 0xE1];
    out.extend_from_slice(&(FIXTURE_SPS.len() as u16).to_be_bytes());
    out.extend_from_slice(&FIXTURE_SPS);
    out.push(1);
    out.extend_from_slice(&(FIXTURE_PPS.len() as u16).to_be_bytes());
    out.extend_from_slice(&FIXTURE_PPS);
    out
}

/// Length-prefixed payload of the sample at a decode index.
pub fn fixture_payload(index: usize, keyframe: bool) -> Vec<u8> {
    let nal_header = if keyframe { 0x65 } else { 0x41 };
    let body: Vec<u8> = (0..8).map(|k| (index * 31 + k * 7) as u8).collect();
    let mut out = ((body.len() + 1) as u32).to_be_bytes().to_vec();
    out.push(nal_header);
    out.extend_from_slice(&body);
    out
}

/// (display index, keyframe) per sample in decode order.
///
/// With B-frames each GOP is coded as `I P3 B1 B2 P6 B4 B5 ...` with the
/// frames that don't fill a P/B/B triple coded as trailing P-frames.
pub fn decode_order(layout: &FixtureSpec) -> Vec<(usize, bool)> {
    let mut order = Vec::with_capacity(layout.frames);
    let mut g = 0;
    while g < layout.frames {
        let end = (g + layout.gop).min(layout.frames);
        order.push((g, true));
        let mut next = g + 1;
        if layout.b_frames {
            while next + 2 < end {
                order.push((next + 2, false));
                order.push((next, false));
                order.push((next + 1, false));
                next += 3;
            }
        }
        for d in next..end {
            order.push((d, false));
        }
        g = end;
    }
    order
}

fn mp4_box(kind: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + content.len());
    out.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(content);
    out
}

fn full_box(kind: &[u8; 4], version: u8, flags: u32, content: &[u8]) -> Vec<u8> {
    let mut body = vec![version];
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(content);
    mp4_box(kind, &body)
}

const IDENTITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

/// Write a progressive MP4 (`ftyp`, `mdat`, `moov`) described by `layout`.
pub fn write_fixture(path: &Path, layout: &FixtureSpec) -> std::io::Result<()> {
    let order = decode_order(layout);
    let d = layout.frame_duration as i64;
    let payloads: Vec<Vec<u8>> = order
        .iter()
        .enumerate()
        .map(|(i, (_, key))| fixture_payload(i, *key))
        .collect();

    let mut ftyp = Vec::new();
    ftyp.extend_from_slice(b"isom");
    ftyp.extend_from_slice(&0x200u32.to_be_bytes());
    ftyp.extend_from_slice(b"isomiso2avc1mp41");
    let ftyp = mp4_box(b"ftyp", &ftyp);

    // mdat, with a 64-bit header when exercising co64
    let data_len: usize = payloads.iter().map(Vec::len).sum();
    let mut mdat = Vec::new();
    if layout.co64 {
        mdat.extend_from_slice(&1u32.to_be_bytes());
        mdat.extend_from_slice(b"mdat");
        mdat.extend_from_slice(&((16 + data_len) as u64).to_be_bytes());
    } else {
        mdat.extend_from_slice(&((8 + data_len) as u32).to_be_bytes());
        mdat.extend_from_slice(b"mdat");
    }
    let mut sample_offsets = Vec::with_capacity(payloads.len());
    for payload in &payloads {
        sample_offsets.push((ftyp.len() + mdat.len()) as u64);
        mdat.extend_from_slice(payload);
    }

    let per_chunk = layout.samples_per_chunk.max(1);
    let chunk_offsets: Vec<u64> = sample_offsets.iter().step_by(per_chunk).copied().collect();

    // stbl
    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(&avc1_entry(layout));
    let stsd = full_box(b"stsd", 0, 0, &stsd);

    let mut stts = 1u32.to_be_bytes().to_vec();
    stts.extend_from_slice(&(order.len() as u32).to_be_bytes());
    stts.extend_from_slice(&layout.frame_duration.to_be_bytes());
    let stts = full_box(b"stts", 0, 0, &stts);

    let ctts = if layout.b_frames {
        let mut ctts = (order.len() as u32).to_be_bytes().to_vec();
        for (i, (display, _)) in order.iter().enumerate() {
            let offset = (*display as i64 + 1) * d - i as i64 * d;
            ctts.extend_from_slice(&1u32.to_be_bytes());
            ctts.extend_from_slice(&(offset as u32).to_be_bytes());
        }
        full_box(b"ctts", 0, 0, &ctts)
    } else {
        Vec::new()
    };

    let sync: Vec<u32> = order
        .iter()
        .enumerate()
        .filter(|(_, (_, key))| *key)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut stss = (sync.len() as u32).to_be_bytes().to_vec();
    for n in &sync {
        stss.extend_from_slice(&n.to_be_bytes());
    }
    let stss = full_box(b"stss", 0, 0, &stss);

    let full_chunks = order.len() / per_chunk;
    let remainder = order.len() % per_chunk;
    let mut runs = vec![(1u32, per_chunk as u32)];
    if remainder > 0 {
        if full_chunks == 0 {
            runs = vec![(1, remainder as u32)];
        } else {
            runs.push((full_chunks as u32 + 1, remainder as u32));
        }
    }
    let mut stsc = (runs.len() as u32).to_be_bytes().to_vec();
    for (first, n) in runs {
        stsc.extend_from_slice(&first.to_be_bytes());
        stsc.extend_from_slice(&n.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
    }
    let stsc = full_box(b"stsc", 0, 0, &stsc);

    let mut stsz = 0u32.to_be_bytes().to_vec();
    stsz.extend_from_slice(&(payloads.len() as u32).to_be_bytes());
    for payload in &payloads {
        stsz.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    let stsz = full_box(b"stsz", 0, 0, &stsz);

    let mut chunks = (chunk_offsets.len() as u32).to_be_bytes().to_vec();
    let stco = if layout.co64 {
        for off in &chunk_offsets {
            chunks.extend_from_slice(&off.to_be_bytes());
        }
        full_box(b"co64", 0, 0, &chunks)
    } else {
        for off in &chunk_offsets {
            chunks.extend_from_slice(&(*off as u32).to_be_bytes());
        }
        full_box(b"stco", 0, 0, &chunks)
    };

    let stbl = mp4_box(b"stbl", &[stsd, stts, ctts, stss, stsc, stsz, stco].concat());

    let mut vmhd = 0u16.to_be_bytes().to_vec();
    vmhd.extend_from_slice(&[0; 6]);
    let vmhd = full_box(b"vmhd", 0, 1, &vmhd);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&full_box(b"url ", 0, 1, &[]));
    let dinf = mp4_box(b"dinf", &full_box(b"dref", 0, 0, &dref));
    let minf = mp4_box(b"minf", &[vmhd, dinf, stbl].concat());

    let duration = order.len() as u32 * layout.frame_duration;
    let mut mdhd = Vec::new();
    mdhd.extend_from_slice(&0u32.to_be_bytes()); // creation time
    mdhd.extend_from_slice(&0u32.to_be_bytes()); // modification time
    mdhd.extend_from_slice(&layout.timescale.to_be_bytes());
    mdhd.extend_from_slice(&duration.to_be_bytes());
    mdhd.extend_from_slice(&0x55c4u16.to_be_bytes()); // language (und)
    mdhd.extend_from_slice(&0u16.to_be_bytes());
    let mdhd = full_box(b"mdhd", 0, 0, &mdhd);

    let mut hdlr = 0u32.to_be_bytes().to_vec();
    hdlr.extend_from_slice(&layout.handler);
    hdlr.extend_from_slice(&[0; 12]);
    hdlr.extend_from_slice(b"VideoHandler\0");
    let hdlr = full_box(b"hdlr", 0, 0, &hdlr);
    let mdia = mp4_box(b"mdia", &[mdhd, hdlr, minf].concat());

    let mut tkhd = Vec::new();
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // creation time
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // modification time
    tkhd.extend_from_slice(&1u32.to_be_bytes()); // track id
    tkhd.extend_from_slice(&0u32.to_be_bytes());
    tkhd.extend_from_slice(&duration.to_be_bytes());
    tkhd.extend_from_slice(&[0; 8]);
    tkhd.extend_from_slice(&[0; 8]); // layer, alternate group, volume, reserved
    for m in &IDENTITY_MATRIX {
        tkhd.extend_from_slice(&m.to_be_bytes());
    }
    tkhd.extend_from_slice(&(layout.width << 16).to_be_bytes());
    tkhd.extend_from_slice(&(layout.height << 16).to_be_bytes());
    let tkhd = full_box(b"tkhd", 0, 3, &tkhd);

    let edts = match layout.edit_media_time {
        Some(media_time) => {
            let mut elst = 1u32.to_be_bytes().to_vec();
            elst.extend_from_slice(&duration.to_be_bytes());
            elst.extend_from_slice(&(media_time as i32).to_be_bytes());
            elst.extend_from_slice(&0x00010000u32.to_be_bytes());
            mp4_box(b"edts", &full_box(b"elst", 0, 0, &elst))
        }
        None => Vec::new(),
    };
    let trak = mp4_box(b"trak", &[tkhd, edts, mdia].concat());

    let mut mvhd = Vec::new();
    mvhd.extend_from_slice(&0u32.to_be_bytes());
    mvhd.extend_from_slice(&0u32.to_be_bytes());
    mvhd.extend_from_slice(&layout.timescale.to_be_bytes());
    mvhd.extend_from_slice(&duration.to_be_bytes());
    mvhd.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate (1.0)
    mvhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume (1.0)
    mvhd.extend_from_slice(&[0; 10]);
    for m in &IDENTITY_MATRIX {
        mvhd.extend_from_slice(&m.to_be_bytes());
    }
    mvhd.extend_from_slice(&[0; 24]);
    mvhd.extend_from_slice(&2u32.to_be_bytes()); // next track id
    let mvhd = full_box(b"mvhd", 0, 0, &mvhd);
    let moov = mp4_box(b"moov", &[mvhd, trak].concat());

    std::fs::write(path, [ftyp, mdat, moov].concat())
}

fn avc1_entry(layout: &FixtureSpec) -> Vec<u8> {
    let mut avc1 = Vec::new();
    avc1.extend_from_slice(&[0; 6]); // reserved
    avc1.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    avc1.extend_from_slice(&[0; 16]); // pre_defined + reserved
    avc1.extend_from_slice(&(layout.width as u16).to_be_bytes());
    avc1.extend_from_slice(&(layout.height as u16).to_be_bytes());
    avc1.extend_from_slice(&0x00480000u32.to_be_bytes()); // 72 dpi
    avc1.extend_from_slice(&0x00480000u32.to_be_bytes());
    avc1.extend_from_slice(&0u32.to_be_bytes());
    avc1.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    let mut compressor = [0u8; 32];
    let name = b"vpreview-fixture";
    compressor[0] = name.len() as u8;
    compressor[1..1 + name.len()].copy_from_slice(name);
    avc1.extend_from_slice(&compressor);
    avc1.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    avc1.extend_from_slice(&(-1i16).to_be_bytes());
    avc1.extend_from_slice(&mp4_box(b"avcC", &fixture_avcc()));
    mp4_box(b"avc1", &avc1)
}

// ============================================================================
// Platform buffers
// ============================================================================

/// Lifecycle counters shared by all buffers of one test.
#[derive(Debug, Default)]
pub struct BufferCounters {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pub exported: AtomicUsize,
}

impl BufferCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn exported(&self) -> usize {
        self.exported.load(Ordering::SeqCst)
    }
}

/// A buffer that counts its own release.
pub struct TestBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    zero_copy: bool,
    id: u64,
    counters: Arc<BufferCounters>,
}

impl TestBuffer {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        zero_copy: bool,
        id: u64,
        counters: Arc<BufferCounters>,
    ) -> Self {
        counters.created.fetch_add(1, Ordering::SeqCst);
        Self {
            width,
            height,
            format,
            zero_copy,
            id,
            counters,
        }
    }
}

impl PlatformBuffer for TestBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn export_native(&self) -> Result<NativeTexture, DecodeError> {
        self.counters.exported.fetch_add(1, Ordering::SeqCst);
        if self.zero_copy {
            Ok(NativeTexture::Opaque(self.id))
        } else {
            Err(DecodeError::UnsupportedZeroCopy)
        }
    }

    fn read_planes(&self) -> Result<CpuImage, DecodeError> {
        Ok(CpuImage::filled(self.width, self.height, self.format, 16))
    }
}

impl Drop for TestBuffer {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Engines
// ============================================================================

/// When a scripted session delivers its completions.
#[derive(Debug, Clone, Copy)]
pub enum CompletionOrder {
    /// Inside `submit`.
    Immediate,
    /// Held until `n` are pending, then delivered newest first.
    ReverseBatches(usize),
    /// From a helper thread after a delay.
    Delayed(Duration),
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub submitted: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub sessions: AtomicUsize,
}

impl EngineCounters {
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

/// An engine whose completion order, failures and latency are scripted.
pub struct ScriptedEngine {
    pub order: CompletionOrder,
    pub zero_copy: bool,
    pub buffers_zero_copy: bool,
    pub fail: HashSet<u64>,
    pub slow: HashSet<u64>,
    pub slow_delay: Duration,
    pub counters: Arc<EngineCounters>,
    pub buffers: Arc<BufferCounters>,
}

impl ScriptedEngine {
    pub fn new(order: CompletionOrder) -> Self {
        Self {
            order,
            zero_copy: true,
            buffers_zero_copy: true,
            fail: HashSet::new(),
            slow: HashSet::new(),
            slow_delay: Duration::ZERO,
            counters: Arc::new(EngineCounters::default()),
            buffers: Arc::new(BufferCounters::default()),
        }
    }

    /// Buffers refuse zero-copy export although the engine advertises it.
    pub fn without_buffer_export(mut self) -> Self {
        self.buffers_zero_copy = false;
        self
    }

    pub fn failing(mut self, sequences: impl IntoIterator<Item = u64>) -> Self {
        self.fail.extend(sequences);
        self
    }

    pub fn slow(mut self, sequences: impl IntoIterator<Item = u64>, delay: Duration) -> Self {
        self.slow.extend(sequences);
        self.slow_delay = delay;
        self
    }
}

impl DecodeEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_zero_copy(&self) -> bool {
        self.zero_copy
    }

    fn create_session(
        &self,
        format: &FormatConfig,
        pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError> {
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            sink,
            order: self.order,
            width: format.width,
            height: format.height,
            pixel_format,
            buffers_zero_copy: self.buffers_zero_copy,
            fail: self.fail.clone(),
            slow: self.slow.clone(),
            slow_delay: self.slow_delay,
            held: Vec::new(),
            counters: Arc::clone(&self.counters),
            buffers: Arc::clone(&self.buffers),
        }))
    }
}

struct ScriptedSession {
    sink: CompletionSink,
    order: CompletionOrder,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    buffers_zero_copy: bool,
    fail: HashSet<u64>,
    slow: HashSet<u64>,
    slow_delay: Duration,
    held: Vec<Completion>,
    counters: Arc<EngineCounters>,
    buffers: Arc<BufferCounters>,
}

impl ScriptedSession {
    fn completion(&self, token: FrameToken) -> Completion {
        let result = if self.fail.contains(&token.sequence) {
            Err(DecodeError::decode_failed(token.sequence, "scripted failure"))
        } else {
            Ok(Box::new(TestBuffer::new(
                self.width,
                self.height,
                self.pixel_format,
                self.buffers_zero_copy,
                token.sequence,
                Arc::clone(&self.buffers),
            )) as Box<dyn PlatformBuffer>)
        };
        Completion { token, result }
    }

    fn deliver(&self, completion: Completion) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.sink.deliver(completion);
    }

    fn deliver_later(&self, completion: Completion, delay: Duration) {
        let sink = self.sink;
        let counters = Arc::clone(&self.counters);
        thread::spawn(move || {
            thread::sleep(delay);
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            sink.deliver(completion);
        });
    }

    fn flush_held(&mut self) {
        let held: Vec<Completion> = self.held.drain(..).rev().collect();
        for completion in held {
            self.deliver(completion);
        }
    }
}

impl EngineSession for ScriptedSession {
    fn submit(&mut self, token: FrameToken, _sample: &CompressedSample) -> Result<(), DecodeError> {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let completion = self.completion(token);
        if self.slow.contains(&token.sequence) {
            self.deliver_later(completion, self.slow_delay);
            return Ok(());
        }
        match self.order {
            CompletionOrder::Immediate => self.deliver(completion),
            CompletionOrder::ReverseBatches(n) => {
                self.held.push(completion);
                if self.held.len() >= n {
                    self.flush_held();
                }
            }
            CompletionOrder::Delayed(delay) => self.deliver_later(completion, delay),
        }
        Ok(())
    }

    /// Flushes held completions. Delayed ones are not awaited.
    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError> {
        self.flush_held();
        Ok(())
    }

    fn invalidate(&mut self) {
        let dropped = self.held.len();
        self.counters.in_flight.fetch_sub(dropped, Ordering::SeqCst);
        self.held.clear();
    }
}

/// An engine whose completions are fired by the test.
#[derive(Default)]
pub struct ManualEngine {
    pub pending: Arc<Mutex<Vec<(FrameToken, CompletionSink)>>>,
    pub buffers: Arc<BufferCounters>,
}

impl ManualEngine {
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver a decoded buffer for `sequence`.
    pub fn complete(&self, sequence: u64) -> bool {
        self.fire(sequence, None)
    }

    /// Deliver with a rewritten epoch.
    pub fn complete_with_epoch(&self, sequence: u64, epoch: u64) -> bool {
        self.fire(sequence, Some(epoch))
    }

    fn fire(&self, sequence: u64, epoch: Option<u64>) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let idx = pending.iter().position(|(t, _)| t.sequence == sequence);
            idx.map(|i| pending.remove(i))
        };
        let Some((mut token, sink)) = entry else {
            return false;
        };
        if let Some(epoch) = epoch {
            token.epoch = epoch;
        }
        let buffer = TestBuffer::new(
            64,
            64,
            PixelFormat::Nv12,
            true,
            sequence,
            Arc::clone(&self.buffers),
        );
        sink.deliver(Completion {
            token,
            result: Ok(Box::new(buffer)),
        });
        true
    }
}

impl DecodeEngine for ManualEngine {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn supports_zero_copy(&self) -> bool {
        true
    }

    fn create_session(
        &self,
        _format: &FormatConfig,
        _pixel_format: PixelFormat,
        sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError> {
        Ok(Box::new(ManualSession {
            sink,
            pending: Arc::clone(&self.pending),
        }))
    }
}

struct ManualSession {
    sink: CompletionSink,
    pending: Arc<Mutex<Vec<(FrameToken, CompletionSink)>>>,
}

impl EngineSession for ManualSession {
    fn submit(&mut self, token: FrameToken, _sample: &CompressedSample) -> Result<(), DecodeError> {
        self.pending.lock().push((token, self.sink));
        Ok(())
    }

    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn invalidate(&mut self) {}
}

/// An engine that panics inside create or submit.
pub struct PanickingEngine {
    pub on_create: bool,
}

impl DecodeEngine for PanickingEngine {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn supports_zero_copy(&self) -> bool {
        false
    }

    fn create_session(
        &self,
        _format: &FormatConfig,
        _pixel_format: PixelFormat,
        _sink: CompletionSink,
    ) -> Result<Box<dyn EngineSession>, DecodeError> {
        if self.on_create {
            panic!("native session constructor crashed");
        }
        Ok(Box::new(PanickingSession))
    }
}

struct PanickingSession;

impl EngineSession for PanickingSession {
    fn submit(&mut self, _token: FrameToken, _sample: &CompressedSample) -> Result<(), DecodeError> {
        panic!("native decode call crashed");
    }

    fn wait_for_async_completions(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn invalidate(&mut self) {}
}

/// A format matching the default fixture.
pub fn fixture_format() -> FormatConfig {
    FormatConfig {
        codec: vpreview_codec::Codec::H264,
        width: 1920,
        height: 1080,
        timescale: 30000,
        parameter_blob: Bytes::from(fixture_avcc()),
        sps: vec![Bytes::from_static(&FIXTURE_SPS)],
        pps: vec![Bytes::from_static(&FIXTURE_PPS)],
        nal_length_size: 4,
    }
}

/// A sample stamped with the given identity.
pub fn test_sample(sequence: u64, pts: i64, epoch: u64) -> CompressedSample {
    CompressedSample {
        data: Bytes::from(fixture_payload(sequence as usize, sequence == 0)),
        pts,
        dts: sequence as i64 * 1000,
        duration: 1000,
        timescale: 30000,
        sequence,
        epoch,
        keyframe: sequence == 0,
    }
}

// ============================================================================
// Sources
// ============================================================================

/// How a [`FlakySource`] misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum FlakyMode {
    /// Readers never produce a sample.
    Stall,
    /// Readers fail after this many samples (counted per source).
    FailAfter(usize),
    /// Opening a reader fails.
    FailOpen,
}

/// Wraps an MP4 source and injects reader faults.
pub struct FlakySource {
    inner: Mp4Source,
    mode: FlakyMode,
    pub opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl FlakySource {
    pub fn open(path: &Path, mode: FlakyMode) -> Self {
        Self {
            inner: Mp4Source::open(path).unwrap(),
            mode,
            opens: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MediaSource for FlakySource {
    fn track(&self) -> &TrackInfo {
        self.inner.track()
    }

    fn sample_description(&self) -> Result<SampleDescription, DecodeError> {
        self.inner.sample_description()
    }

    fn sync_point(&self, pts: i64) -> i64 {
        self.inner.sync_point(pts)
    }

    fn open_range(&self, start: i64, end: i64) -> Result<Box<dyn SampleReader>, DecodeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let FlakyMode::FailOpen = self.mode {
            return Err(DecodeError::reader_start("injected open failure"));
        }
        Ok(Box::new(FlakyReader {
            inner: self.inner.open_range(start, end)?,
            mode: self.mode,
            reads: Arc::clone(&self.reads),
            failed: false,
        }))
    }
}

struct FlakyReader {
    inner: Box<dyn SampleReader>,
    mode: FlakyMode,
    reads: Arc<AtomicUsize>,
    failed: bool,
}

impl SampleReader for FlakyReader {
    fn status(&self) -> ReaderStatus {
        if self.failed {
            return ReaderStatus::Failed("injected read failure".into());
        }
        self.inner.status()
    }

    fn read(&mut self, wait: Duration) -> Result<ReadOutcome, DecodeError> {
        match self.mode {
            FlakyMode::Stall => {
                thread::sleep(wait);
                Ok(ReadOutcome::Pending)
            }
            FlakyMode::FailAfter(n) => {
                if self.reads.fetch_add(1, Ordering::SeqCst) >= n {
                    self.failed = true;
                    return Err(DecodeError::read_failed("injected read failure"));
                }
                self.inner.read(wait)
            }
            FlakyMode::FailOpen => self.inner.read(wait),
        }
    }

    fn cancel(&mut self) {
        self.inner.cancel();
    }
}
