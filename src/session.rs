//! Hardware decode session: asynchronous submit/complete bookkeeping.
//!
//! A session wraps one [`EngineSession`] bound to one format and one seek
//! epoch. Samples go in through [`HardwareDecodeSession::submit`], which
//! blocks while the in-flight limit is reached. Engines report results on
//! their own threads through a [`CompletionSink`]; the sink carries only the
//! session id, which is looked up in a process-wide registry. Once a session
//! is invalidated its id is unregistered, so late completions find nothing
//! and their buffers are released on the spot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vpreview_codec::{
    catch_platform, CompressedSample, Completion, CompletionSink, DecodeEngine, DecodeError,
    DecoderConfig, EngineSession, FormatConfig, FrameToken, PixelFormat,
};

use crate::surface::DecodedSurface;

/// Lifecycle of a decode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Decoding,
    Draining,
    /// Terminal.
    Invalidated,
}

/// A per-sample result collected from the session.
#[derive(Debug)]
pub enum DecodeEvent {
    Decoded(DecodedSurface),
    Failed {
        sequence: u64,
        pts: i64,
        error: DecodeError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub submitted: u64,
    pub decoded: u64,
    pub failed: u64,
    /// Completions whose epoch did not match the session's.
    pub stale_discarded: u64,
    /// Completions with no matching submission.
    pub unmatched: u64,
    pub callbacks: u64,
    pub max_outstanding: usize,
    pub last_callback_pts: Option<i64>,
}

impl SessionStats {
    /// Fold another session's counters into this one.
    pub fn accumulate(&mut self, other: &SessionStats) {
        self.submitted += other.submitted;
        self.decoded += other.decoded;
        self.failed += other.failed;
        self.stale_discarded += other.stale_discarded;
        self.unmatched += other.unmatched;
        self.callbacks += other.callbacks;
        self.max_outstanding = self.max_outstanding.max(other.max_outstanding);
        if other.last_callback_pts.is_some() {
            self.last_callback_pts = other.last_callback_pts;
        }
    }
}

struct Inner {
    state: SessionState,
    /// sequence -> pts
    outstanding: HashMap<u64, i64>,
    events: VecDeque<DecodeEvent>,
    stats: SessionStats,
}

struct Shared {
    id: u64,
    epoch: u64,
    timescale: u32,
    inner: Mutex<Inner>,
    changed: Condvar,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static ORPHANED: AtomicU64 = AtomicU64::new(0);

fn registry() -> &'static Mutex<HashMap<u64, Weak<Shared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<Shared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Completions that arrived for sessions no longer registered.
pub fn orphaned_completions() -> u64 {
    ORPHANED.load(Ordering::Relaxed)
}

fn route_completion(session: u64, completion: Completion) {
    let target = registry().lock().get(&session).and_then(Weak::upgrade);
    match target {
        Some(shared) => shared.accept(completion),
        None => {
            ORPHANED.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[session] dropping completion seq={} for closed session {session}",
                completion.token.sequence
            );
        }
    }
}

impl Shared {
    fn accept(&self, completion: Completion) {
        let Completion { token, result } = completion;
        let mut inner = self.inner.lock();
        inner.stats.callbacks += 1;
        inner.stats.last_callback_pts = Some(token.pts);

        if inner.state == SessionState::Invalidated {
            drop(inner);
            tracing::debug!("[session] {} late completion seq={}", self.id, token.sequence);
            return;
        }
        if token.epoch != self.epoch {
            inner.outstanding.remove(&token.sequence);
            inner.stats.stale_discarded += 1;
            drop(inner);
            self.changed.notify_all();
            tracing::debug!(
                "[session] {}: {}",
                self.id,
                DecodeError::StaleEpochDiscard {
                    stale: token.epoch,
                    current: self.epoch
                }
            );
            return;
        }
        let Some(pts) = inner.outstanding.remove(&token.sequence) else {
            inner.stats.unmatched += 1;
            drop(inner);
            tracing::warn!(
                "[session] {} completion for unknown seq={}",
                self.id,
                token.sequence
            );
            return;
        };

        match result {
            Ok(buffer) => {
                inner.stats.decoded += 1;
                let surface = DecodedSurface::new(buffer, pts, self.timescale, token.sequence, self.epoch);
                inner.events.push_back(DecodeEvent::Decoded(surface));
            }
            Err(error) => {
                inner.stats.failed += 1;
                tracing::warn!("[session] {} seq={} failed: {error}", self.id, token.sequence);
                inner.events.push_back(DecodeEvent::Failed {
                    sequence: token.sequence,
                    pts,
                    error,
                });
            }
        }
        if inner.outstanding.is_empty() && inner.state == SessionState::Decoding {
            inner.state = SessionState::Ready;
        }
        drop(inner);
        self.changed.notify_all();
    }
}

/// One decode session for one format and one seek epoch.
pub struct HardwareDecodeSession {
    shared: Arc<Shared>,
    engine: Option<Box<dyn EngineSession>>,
    engine_name: &'static str,
    in_flight_limit: usize,
    timeout: Duration,
}

impl HardwareDecodeSession {
    /// Create a session on `engine`. Panics inside the engine surface as
    /// `SessionCreateFailed`.
    pub fn create(
        engine: &dyn DecodeEngine,
        format: &FormatConfig,
        pixel_format: PixelFormat,
        config: &DecoderConfig,
        epoch: u64,
    ) -> Result<Self, DecodeError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            epoch,
            timescale: format.timescale,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                outstanding: HashMap::new(),
                events: VecDeque::new(),
                stats: SessionStats::default(),
            }),
            changed: Condvar::new(),
        });
        registry().lock().insert(id, Arc::downgrade(&shared));

        let sink = CompletionSink::new(id, route_completion);
        let created = catch_platform(
            || engine.create_session(format, pixel_format, sink),
            DecodeError::session_create,
        );
        let session = match created {
            Ok(session) => session,
            Err(e) => {
                registry().lock().remove(&id);
                shared.inner.lock().state = SessionState::Invalidated;
                tracing::error!("[session] {} create on {} failed: {e}", id, engine.name());
                return Err(match e {
                    DecodeError::SessionCreateFailed(_) => e,
                    other => DecodeError::session_create(other.to_string()),
                });
            }
        };
        shared.inner.lock().state = SessionState::Ready;

        tracing::info!(
            "[session] {} created on {}: {}x{} {:?}, epoch {}, in-flight limit {}",
            id,
            engine.name(),
            format.width,
            format.height,
            pixel_format,
            epoch,
            config.in_flight_limit
        );
        Ok(Self {
            shared,
            engine: Some(session),
            engine_name: engine.name(),
            in_flight_limit: config.in_flight_limit.max(1),
            timeout: config.decode_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine_name
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Samples submitted whose completion has not arrived.
    pub fn outstanding(&self) -> usize {
        self.shared.inner.lock().outstanding.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.inner.lock().stats
    }

    pub fn in_flight_limit(&self) -> usize {
        self.in_flight_limit
    }

    /// Submit a sample for asynchronous decode.
    ///
    /// Blocks while the in-flight limit is reached, up to the decode timeout.
    pub fn submit(&mut self, sample: &CompressedSample) -> Result<(), DecodeError> {
        let sequence = sample.sequence;
        if sample.epoch != self.shared.epoch {
            return Err(DecodeError::StaleEpochDiscard {
                stale: sample.epoch,
                current: self.shared.epoch,
            });
        }
        {
            let mut inner = self.shared.inner.lock();
            let deadline = Instant::now() + self.timeout;
            loop {
                match inner.state {
                    SessionState::Ready | SessionState::Decoding => {}
                    state => {
                        return Err(DecodeError::submit_failed(
                            sequence,
                            format!("session is {state:?}"),
                        ))
                    }
                }
                if inner.outstanding.len() < self.in_flight_limit {
                    break;
                }
                if self.shared.changed.wait_until(&mut inner, deadline).timed_out()
                    && inner.outstanding.len() >= self.in_flight_limit
                {
                    tracing::warn!(
                        "[session] {} submit seq={sequence} blocked for {:?} at {} in flight",
                        self.shared.id,
                        self.timeout,
                        inner.outstanding.len()
                    );
                    return Err(DecodeError::Timeout(self.timeout));
                }
            }
            inner.outstanding.insert(sequence, sample.pts);
            inner.stats.submitted += 1;
            inner.stats.max_outstanding = inner.stats.max_outstanding.max(inner.outstanding.len());
            inner.state = SessionState::Decoding;
        }

        let token = FrameToken {
            session: self.shared.id,
            epoch: self.shared.epoch,
            sequence,
            pts: sample.pts,
        };
        let result = match self.engine.as_mut() {
            Some(engine) => catch_platform(
                || engine.submit(token, sample),
                |msg| DecodeError::submit_failed(sequence, msg),
            ),
            None => Err(DecodeError::submit_failed(sequence, "engine session released")),
        };
        if let Err(e) = result {
            self.forget(sequence);
            return Err(match e {
                DecodeError::DecodeSubmitFailed { .. } => e,
                other => DecodeError::submit_failed(sequence, other.to_string()),
            });
        }
        tracing::trace!("[session] {} submitted seq={sequence} pts={}", self.shared.id, sample.pts);
        Ok(())
    }

    fn forget(&self, sequence: u64) {
        let mut inner = self.shared.inner.lock();
        inner.outstanding.remove(&sequence);
        if inner.outstanding.is_empty() && inner.state == SessionState::Decoding {
            inner.state = SessionState::Ready;
        }
        drop(inner);
        self.shared.changed.notify_all();
    }

    /// Take collected results without waiting.
    pub fn try_completions(&self) -> Vec<DecodeEvent> {
        self.shared.inner.lock().events.drain(..).collect()
    }

    /// Take collected results, waiting up to `timeout` for at least one
    /// while samples are outstanding.
    pub fn wait_completions(&self, timeout: Duration) -> Vec<DecodeEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while inner.events.is_empty() && !inner.outstanding.is_empty() {
            if self.shared.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.events.drain(..).collect()
    }

    /// Ask the engine to emit frames it is holding back for reordering.
    pub fn finish(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            let flushed = catch_platform(
                || engine.wait_for_async_completions(),
                |msg| DecodeError::decode_failed(0, msg),
            );
            if let Err(e) = flushed {
                tracing::warn!("[session] {} flush failed: {e}", self.shared.id);
            }
        }
    }

    /// Stop accepting samples and wait for outstanding completions.
    pub fn drain(&mut self, timeout: Duration) -> Result<(), DecodeError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == SessionState::Invalidated {
                return Ok(());
            }
            inner.state = SessionState::Draining;
        }
        self.finish();

        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while !inner.outstanding.is_empty() {
            if self.shared.changed.wait_until(&mut inner, deadline).timed_out()
                && !inner.outstanding.is_empty()
            {
                tracing::warn!(
                    "[session] {} drain timed out with {} outstanding",
                    self.shared.id,
                    inner.outstanding.len()
                );
                return Err(DecodeError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Tear the session down. Terminal; later completions are discarded.
    pub fn invalidate(&mut self) {
        let (abandoned, queued) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == SessionState::Invalidated {
                return;
            }
            inner.state = SessionState::Invalidated;
            let abandoned = inner.outstanding.len();
            inner.outstanding.clear();
            (abandoned, std::mem::take(&mut inner.events))
        };
        registry().lock().remove(&self.shared.id);
        self.shared.changed.notify_all();

        if let Some(mut engine) = self.engine.take() {
            let torn_down = catch_platform(
                || {
                    engine.invalidate();
                    Ok(())
                },
                DecodeError::session_create,
            );
            if let Err(e) = torn_down {
                tracing::error!("[session] {} engine teardown: {e}", self.shared.id);
            }
        }
        tracing::info!(
            "[session] {} invalidated ({} abandoned, {} undelivered)",
            self.shared.id,
            abandoned,
            queued.len()
        );
    }
}

impl Drop for HardwareDecodeSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}
