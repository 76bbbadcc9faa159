//! Demux session: compressed samples in decode order, with seek.
//!
//! Samples come from a forward-only [`SampleReader`] over a bounded window of
//! the track. When a window is exhausted the next one is opened at the
//! following sync sample, so sequential reads cover the whole track. Seeking
//! never rewinds a reader: the current one is cancelled and a new one is
//! opened at the sync sample at or before the target, and the seek epoch is
//! bumped so anything still in flight from before can be told apart.

use std::path::Path;
use std::time::{Duration, Instant};

use vpreview_codec::{
    CompressedSample, DecodeError, DecoderConfig, MediaSource, RawSample, ReadOutcome,
    ReaderStatus, SampleReader, TrackInfo,
};

use crate::mp4::Mp4Source;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct DemuxSession {
    source: Box<dyn MediaSource>,
    reader: Box<dyn SampleReader>,
    lookahead: Option<RawSample>,
    ended: bool,
    epoch: u64,
    next_sequence: u64,
    window: i64,
    read_timeout: Duration,
}

impl DemuxSession {
    /// Open an MP4 file and start reading at the beginning.
    pub fn open(path: impl AsRef<Path>, config: &DecoderConfig) -> Result<Self, DecodeError> {
        let source = Mp4Source::open(path)?;
        Self::with_source(Box::new(source), config)
    }

    pub fn with_source(
        source: Box<dyn MediaSource>,
        config: &DecoderConfig,
    ) -> Result<Self, DecodeError> {
        let track = source.track();
        let window = track.seconds_to_ticks(config.seek_window.as_secs_f64()).max(1);
        let reader = source.open_range(0, window)?;
        tracing::info!(
            "[demux] track {}: {}x{}, {} samples, {:.3}s, window {:?}",
            track.track_id,
            track.width,
            track.height,
            track.sample_count,
            track.duration_seconds(),
            config.seek_window
        );
        Ok(Self {
            source,
            reader,
            lookahead: None,
            ended: false,
            epoch: 0,
            next_sequence: 0,
            window,
            read_timeout: config.decode_timeout,
        })
    }

    pub fn track(&self) -> &TrackInfo {
        self.source.track()
    }

    pub fn source(&self) -> &dyn MediaSource {
        self.source.as_ref()
    }

    /// Current seek epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the end of the track has been reached in this epoch.
    pub fn is_ended(&self) -> bool {
        self.ended && self.lookahead.is_none()
    }

    /// PTS of the sync sample at or before `pts`.
    pub fn sync_point(&self, pts: i64) -> i64 {
        self.source.sync_point(pts)
    }

    /// Next sample in decode order, or `None` at the end of the track.
    ///
    /// Sequence numbers keep increasing across seeks; the epoch changes.
    pub fn next_sample(&mut self) -> Result<Option<CompressedSample>, DecodeError> {
        let raw = match self.lookahead.take() {
            Some(raw) => raw,
            None => match self.pull()? {
                Some(raw) => raw,
                None => return Ok(None),
            },
        };
        let sample = CompressedSample::from_raw(
            raw,
            self.track().timescale,
            self.next_sequence,
            self.epoch,
        );
        self.next_sequence += 1;
        Ok(Some(sample))
    }

    /// Lowest PTS any sample not yet returned can carry, or `None` at the
    /// end of the track.
    ///
    /// Decode timestamps are monotonic and `pts - dts` is bounded below by the
    /// track's minimum composition offset, so the next sample's DTS shifted
    /// by that offset bounds every later PTS.
    pub fn peek_horizon(&mut self) -> Result<Option<i64>, DecodeError> {
        if self.lookahead.is_none() {
            self.lookahead = self.pull()?;
        }
        let shift = self.track().min_composition_offset.min(0);
        Ok(self.lookahead.as_ref().map(|s| s.dts + shift))
    }

    fn pull(&mut self) -> Result<Option<RawSample>, DecodeError> {
        if self.ended {
            return Ok(None);
        }
        let deadline = Instant::now() + self.read_timeout;
        loop {
            match self.reader.status() {
                ReaderStatus::Failed(reason) => return Err(DecodeError::ReadFailed(reason)),
                ReaderStatus::Cancelled => {
                    return Err(DecodeError::read_failed("reader was cancelled"))
                }
                ReaderStatus::Reading | ReaderStatus::Completed => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("[demux] no sample within {:?}", self.read_timeout);
                return Err(DecodeError::Timeout(self.read_timeout));
            }
            match self.reader.read(remaining.min(POLL_INTERVAL))? {
                ReadOutcome::Sample(raw) => return Ok(Some(raw)),
                ReadOutcome::Pending => {}
                ReadOutcome::Exhausted { resume: Some(at) } => {
                    tracing::debug!("[demux] window done, continuing at pts {at}");
                    self.reader = self.source.open_range(at, at + self.window)?;
                }
                ReadOutcome::Exhausted { resume: None } => {
                    tracing::debug!("[demux] end of track");
                    self.ended = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Reposition to `seconds`. Returns the new epoch.
    ///
    /// The next sample returned is the sync sample at or before the target.
    pub fn seek(&mut self, seconds: f64) -> Result<u64, DecodeError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DecodeError::seek_failed(seconds, "invalid target"));
        }
        let track = self.source.track();
        let target = track.seconds_to_ticks(seconds).min(track.duration.max(0));

        self.reader.cancel();
        self.lookahead = None;
        self.ended = false;
        self.epoch += 1;

        let reader = self
            .source
            .open_range(target, target + self.window)
            .map_err(|e| DecodeError::seek_failed(seconds, e.to_string()))?;
        self.reader = reader;
        tracing::info!(
            "[demux] seek to {seconds:.3}s (sync pts {}), epoch {}",
            self.source.sync_point(target),
            self.epoch
        );
        Ok(self.epoch)
    }
}
