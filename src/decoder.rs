//! Decoder facade: "give me the frame at time T".
//!
//! [`Decoder`] ties the pipeline together:
//!
//! ```text
//! DemuxSession ──samples──▶ HardwareDecodeSession ──events──▶ ReorderBuffer ──▶ Frame
//!      ▲                           (async engine)                   │
//!      └──────────── seek / epoch ◀──── position() ◀────────────────┘
//! ```
//!
//! Each decode call positions the stream (seeking when the target is behind
//! what has been released, or when a later sync sample lies past the seek
//! threshold), then
//! alternates between feeding samples and collecting completions until the
//! reorder buffer releases the first frame at or after the target.
//!
//! Terminal errors (file, track, or session creation) close the decoder;
//! every later call returns [`DecodeError::Closed`].

use std::path::Path;
use std::sync::Arc;

use vpreview_codec::{
    CpuImage, DecodeEngine, DecodeError, DecoderConfig, FormatConfig, MediaSource, PixelFormat,
    VideoProperties,
};

use crate::demux::DemuxSession;
use crate::engine;
use crate::format;
use crate::mp4::Mp4Source;
use crate::reorder::{Pop, ReorderBuffer};
use crate::session::{DecodeEvent, HardwareDecodeSession, SessionStats};
use crate::surface::{DecodedSurface, ExternalTextureHandle};

/// Pixel data of a decoded frame.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// Zero-copy GPU handle. Keeps the decoded surface alive.
    Gpu(ExternalTextureHandle),
    /// Planes copied into system memory.
    Cpu(CpuImage),
}

/// A decoded frame at a presentation time.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Presentation time in seconds.
    pub pts: f64,
    pub sequence: u64,
    pub data: FrameData,
}

impl Frame {
    fn from_surface(surface: &DecodedSurface, data: FrameData) -> Self {
        Self {
            width: surface.width(),
            height: surface.height(),
            pixel_format: surface.pixel_format(),
            pts: surface.pts_seconds(),
            sequence: surface.sequence(),
            data,
        }
    }

    /// Whether the frame is a zero-copy GPU handle.
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.data, FrameData::Gpu(_))
    }

    pub fn gpu_handle(&self) -> Option<&ExternalTextureHandle> {
        match &self.data {
            FrameData::Gpu(handle) => Some(handle),
            FrameData::Cpu(_) => None,
        }
    }

    pub fn cpu_image(&self) -> Option<&CpuImage> {
        match &self.data {
            FrameData::Gpu(_) => None,
            FrameData::Cpu(image) => Some(image),
        }
    }
}

/// Pipeline counters for HUD overlays.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecoderStats {
    /// Frames waiting in the reorder buffer.
    pub ring_len: usize,
    /// Samples submitted and not yet completed.
    pub outstanding: usize,
    /// Decode callbacks received.
    pub callbacks: u64,
    /// PTS (seconds) of the latest callback.
    pub last_callback_pts: Option<f64>,
    /// Samples fed to decode sessions.
    pub fed_samples: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub late_dropped: u64,
    pub stale_discarded: u64,
    pub forced_releases: u64,
    pub skipped: u64,
    pub max_outstanding: usize,
    pub seeks: u64,
    pub epoch: u64,
}

/// Random-access H.264 decoder.
pub struct Decoder {
    config: DecoderConfig,
    engine: Arc<dyn DecodeEngine>,
    demux: DemuxSession,
    format: FormatConfig,
    pixel_format: PixelFormat,
    session: Option<HardwareDecodeSession>,
    reorder: ReorderBuffer,
    last: Option<DecodedSurface>,
    /// PTS of the sync sample the current epoch started at.
    origin: i64,
    /// Engine flushed after end of stream in this epoch.
    finished: bool,
    closed: bool,
    poisoned: Option<DecodeError>,
    retired: SessionStats,
    fed_samples: u64,
    decode_failures: u64,
    seeks: u64,
    tolerance: i64,
    threshold: i64,
}

impl Decoder {
    /// Open a file with the default engine for this platform.
    pub fn open(path: impl AsRef<Path>, config: DecoderConfig) -> Result<Self, DecodeError> {
        config.validate()?;
        let engine = engine::default_engine(&config)?;
        Self::open_with_engine(path, config, engine)
    }

    /// Open a file with a specific engine.
    pub fn open_with_engine(
        path: impl AsRef<Path>,
        config: DecoderConfig,
        engine: Arc<dyn DecodeEngine>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;
        let source = Mp4Source::open(path)?;
        Self::from_source(Box::new(source), config, engine)
    }

    /// Build a decoder over any media source.
    pub fn from_source(
        source: Box<dyn MediaSource>,
        config: DecoderConfig,
        engine: Arc<dyn DecodeEngine>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;
        let demux = DemuxSession::with_source(source, &config)?;
        let format = format::extract(demux.source())?;
        let track = demux.track();
        let tolerance = (track.frame_duration / 2).max(0);
        let threshold = track.seconds_to_ticks(config.seek_threshold.as_secs_f64());
        let pixel_format = config.pixel_format();
        let reorder = ReorderBuffer::new(config.reorder_capacity, tolerance);

        tracing::info!(
            "[decoder] opened {}x{} {:.2}fps {:.3}s on {} (zero-copy {})",
            format.width,
            format.height,
            track.frame_rate(),
            track.duration_seconds(),
            engine.name(),
            config.zero_copy && engine.supports_zero_copy()
        );
        Ok(Self {
            config,
            engine,
            demux,
            format,
            pixel_format,
            session: None,
            reorder,
            last: None,
            origin: 0,
            finished: false,
            closed: false,
            poisoned: None,
            retired: SessionStats::default(),
            fed_samples: 0,
            decode_failures: 0,
            seeks: 0,
            tolerance,
            threshold,
        })
    }

    /// Whether frames are delivered as GPU handles. Pure.
    pub fn supports_zero_copy(&self) -> bool {
        self.config.zero_copy && self.engine.supports_zero_copy()
    }

    pub fn properties(&self) -> VideoProperties {
        let track = self.demux.track();
        VideoProperties {
            width: self.format.width,
            height: self.format.height,
            duration: track.duration_seconds(),
            frame_rate: track.frame_rate(),
            format: self.pixel_format,
        }
    }

    pub fn format(&self) -> &FormatConfig {
        &self.format
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.poisoned.is_some()
    }

    /// Decode the frame at `seconds` as a zero-copy GPU handle.
    ///
    /// Falls back to a CPU copy when the surface cannot be exported, or when
    /// zero-copy is disabled in the configuration.
    pub fn decode_frame_zero_copy(&mut self, seconds: f64) -> Result<Frame, DecodeError> {
        if !self.config.zero_copy {
            return self.decode_frame_cpu(seconds);
        }
        let surface = self.guarded(|d| d.surface_at(seconds))?;
        match surface.export_for_gpu() {
            Ok(handle) => Ok(Frame::from_surface(&surface, FrameData::Gpu(handle))),
            Err(DecodeError::UnsupportedZeroCopy) => {
                tracing::debug!(
                    "[decoder] zero-copy unavailable for pts {:.3}, copying",
                    surface.pts_seconds()
                );
                let image = surface.copy_to_cpu()?;
                Ok(Frame::from_surface(&surface, FrameData::Cpu(image)))
            }
            Err(e) => Err(e),
        }
    }

    /// Decode the frame at `seconds` into system memory.
    pub fn decode_frame_cpu(&mut self, seconds: f64) -> Result<Frame, DecodeError> {
        let surface = self.guarded(|d| d.surface_at(seconds))?;
        let image = surface.copy_to_cpu()?;
        Ok(Frame::from_surface(&surface, FrameData::Cpu(image)))
    }

    /// Reposition to `seconds`. In-flight work is drained and discarded.
    pub fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        self.guarded(|d| d.seek_to(seconds))
    }

    /// Release all decode resources. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.teardown_session();
        self.reorder.flush();
        self.last = None;
        self.closed = true;
        tracing::info!("[decoder] closed after {} samples", self.fed_samples);
    }

    pub fn stats(&self) -> DecoderStats {
        let mut sessions = self.retired;
        let outstanding = match &self.session {
            Some(session) => {
                sessions.accumulate(&session.stats());
                session.outstanding()
            }
            None => 0,
        };
        let reorder = self.reorder.stats();
        let track = self.demux.track();
        DecoderStats {
            ring_len: self.reorder.len(),
            outstanding,
            callbacks: sessions.callbacks,
            last_callback_pts: sessions.last_callback_pts.map(|p| track.ticks_to_seconds(p)),
            fed_samples: self.fed_samples,
            decoded: sessions.decoded,
            decode_failures: self.decode_failures,
            late_dropped: reorder.late_dropped,
            stale_discarded: sessions.stale_discarded,
            forced_releases: reorder.forced,
            skipped: reorder.skipped,
            max_outstanding: sessions.max_outstanding,
            seeks: self.seeks,
            epoch: self.demux.epoch(),
        }
    }

    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if self.is_closed() {
            return Err(DecodeError::Closed);
        }
        let result = f(self);
        if let Err(e) = &result {
            if e.is_terminal() {
                tracing::error!("[decoder] terminal error, closing: {e}");
                self.poisoned = Some(e.clone());
                self.teardown_session();
                self.reorder.flush();
            }
        }
        result
    }

    fn surface_at(&mut self, seconds: f64) -> Result<DecodedSurface, DecodeError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DecodeError::seek_failed(seconds, "invalid timestamp"));
        }
        let target = self.clamp_to_track(seconds);
        if let Some(last) = &self.last {
            if (last.pts() - target).abs() <= self.tolerance {
                return Ok(last.clone());
            }
        }
        self.position(target, seconds)?;

        loop {
            if let Pop::Ready(surface) = self.reorder.pop_ready(target) {
                self.last = Some(surface.clone());
                return Ok(surface);
            }
            let fed = self.pump()?;
            if self.reorder.is_end_of_stream() {
                if !self.finished {
                    if let Some(session) = self.session.as_mut() {
                        session.finish();
                    }
                    self.finished = true;
                }
                let outstanding = self.session.as_ref().map_or(0, |s| s.outstanding());
                if outstanding == 0 && self.reorder.is_empty() {
                    self.collect(false)?;
                    if !self.reorder.is_empty() {
                        continue;
                    }
                    return self.tail(target);
                }
            }
            let collected = self.collect(fed == 0)?;
            if fed == 0 && collected == 0 && self.reorder.in_flight() == 0 {
                if let Pop::Ready(surface) = self.reorder.pop_ready(target) {
                    self.last = Some(surface.clone());
                    return Ok(surface);
                }
                tracing::warn!("[decoder] no progress towards pts {target}");
                return Err(DecodeError::Timeout(self.config.decode_timeout));
            }
        }
    }

    /// `seconds` in track ticks, no later than the end of the track.
    fn clamp_to_track(&self, seconds: f64) -> i64 {
        let track = self.demux.track();
        track.seconds_to_ticks(seconds).min(track.duration.max(0))
    }

    /// Nothing at or after the target: the last frame of the track.
    fn tail(&mut self, target: i64) -> Result<DecodedSurface, DecodeError> {
        if let Some(skipped) = self.reorder.take_last_skipped() {
            self.last = Some(skipped.clone());
            return Ok(skipped);
        }
        match &self.last {
            Some(last) => {
                tracing::debug!(
                    "[decoder] pts {target} past end of track, holding pts {}",
                    last.pts()
                );
                Ok(last.clone())
            }
            None => Err(DecodeError::EndOfStream),
        }
    }

    /// Seek if the target can't be reached by reading forward, or is far
    /// enough ahead that reading forward would waste work.
    fn position(&mut self, target: i64, seconds: f64) -> Result<(), DecodeError> {
        let current = self.reorder.watermark().unwrap_or(self.origin);
        let behind = target.saturating_add(self.tolerance) < current;
        let ahead = target > current.saturating_add(self.threshold)
            && self.demux.sync_point(target) > current;
        if behind || ahead {
            tracing::debug!(
                "[decoder] repositioning to {seconds:.3}s ({})",
                if behind { "backwards" } else { "forward" }
            );
            self.seek_to(seconds)?;
        }
        Ok(())
    }

    fn seek_to(&mut self, seconds: f64) -> Result<(), DecodeError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DecodeError::seek_failed(seconds, "invalid timestamp"));
        }
        self.teardown_session();
        self.reorder.flush();
        self.last = None;
        self.finished = false;

        self.demux.seek(seconds)?;
        let target = self.clamp_to_track(seconds);
        self.origin = self.demux.sync_point(target);
        self.seeks += 1;
        Ok(())
    }

    fn teardown_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.drain(self.config.decode_timeout) {
                tracing::warn!("[decoder] drain before teardown: {e}");
            }
            session.invalidate();
            self.retired.accumulate(&session.stats());
        }
    }

    fn ensure_session(&mut self) -> Result<(), DecodeError> {
        if self.session.is_none() {
            let session = HardwareDecodeSession::create(
                self.engine.as_ref(),
                &self.format,
                self.pixel_format,
                &self.config,
                self.demux.epoch(),
            )?;
            self.session = Some(session);
            self.finished = false;
        }
        Ok(())
    }

    /// Feed samples until the in-flight limit or the reorder capacity is
    /// reached. Returns the number of samples submitted.
    fn pump(&mut self) -> Result<usize, DecodeError> {
        if self.reorder.is_end_of_stream() {
            return Ok(0);
        }
        self.ensure_session()?;
        let Some(session) = self.session.as_mut() else {
            return Err(DecodeError::Closed);
        };

        let mut fed = 0;
        while session.outstanding() < session.in_flight_limit() && self.reorder.has_room() {
            let Some(sample) = self.demux.next_sample()? else {
                tracing::debug!("[decoder] end of stream after {} samples", self.fed_samples);
                self.reorder.mark_end_of_stream();
                return Ok(fed);
            };
            self.reorder.expect(sample.sequence, sample.pts);
            if let Err(e) = session.submit(&sample) {
                self.reorder.abandon(sample.sequence);
                return Err(e);
            }
            fed += 1;
            self.fed_samples += 1;
        }
        match self.demux.peek_horizon()? {
            Some(horizon) => self.reorder.set_horizon(horizon),
            None => self.reorder.mark_end_of_stream(),
        }
        Ok(fed)
    }

    /// Move session results into the reorder buffer. Returns the number of
    /// events collected. A per-sample decode failure is returned after the
    /// other events have been stored.
    fn collect(&mut self, wait: bool) -> Result<usize, DecodeError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(0);
        };
        let events = if wait {
            session.wait_completions(self.config.decode_timeout)
        } else {
            session.try_completions()
        };
        if wait && events.is_empty() && session.outstanding() > 0 {
            tracing::warn!(
                "[decoder] no completion within {:?} ({} outstanding)",
                self.config.decode_timeout,
                session.outstanding()
            );
            return Err(DecodeError::Timeout(self.config.decode_timeout));
        }

        let count = events.len();
        let mut failure = None;
        for event in events {
            match event {
                DecodeEvent::Decoded(surface) => {
                    self.reorder.push(surface.sequence(), surface.pts(), surface);
                }
                DecodeEvent::Failed {
                    sequence, error, ..
                } => {
                    self.reorder.abandon(sequence);
                    self.decode_failures += 1;
                    failure.get_or_insert(error);
                }
            }
        }
        if session.outstanding() == 0 && self.reorder.in_flight() > 0 {
            tracing::debug!(
                "[decoder] releasing {} reservations with no pending decode",
                self.reorder.in_flight()
            );
            self.reorder.clear_in_flight();
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.close();
    }
}
