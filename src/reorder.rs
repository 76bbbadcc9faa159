//! Reorder and pacing buffer.
//!
//! Decoders emit frames in decode order (or in whatever order their async
//! callbacks fire); callers want presentation order. Frames wait here in a
//! min-heap keyed by PTS until nothing still undecoded can precede them.
//!
//! A buffered frame is *ready* when its PTS is
//! - no greater than the PTS of any sample still in flight, and
//! - no greater than the demux horizon (the lowest PTS any sample not yet
//!   read could carry), or the stream has ended.
//!
//! Released PTS are non-decreasing within an epoch. A frame that would
//! violate that is dropped as late. `flush` starts a new epoch.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::surface::DecodedSurface;

struct Entry {
    pts: i64,
    sequence: u64,
    surface: DecodedSurface,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.pts, self.sequence) == (other.pts, other.sequence)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.pts, self.sequence).cmp(&(other.pts, other.sequence))
    }
}

/// Result of [`ReorderBuffer::pop_ready`].
#[derive(Debug)]
pub enum Pop {
    /// The next frame in presentation order at or after the target.
    Ready(DecodedSurface),
    /// Nothing can be released yet.
    Pending,
}

/// Result of [`ReorderBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// PTS below the release watermark; the frame was dropped.
    Late,
    /// No reservation and no room; the frame was dropped.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub pushed: u64,
    pub released: u64,
    pub skipped: u64,
    pub late_dropped: u64,
    pub forced: u64,
    pub rejected: u64,
}

/// Bounded presentation-order buffer.
pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<Entry>>,
    capacity: usize,
    tolerance: i64,
    in_flight: BTreeSet<(i64, u64)>,
    in_flight_pts: HashMap<u64, i64>,
    horizon: Option<i64>,
    end_of_stream: bool,
    watermark: Option<i64>,
    last_skipped: Option<DecodedSurface>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    /// `capacity` bounds buffered plus in-flight frames. `tolerance` (ticks)
    /// lets a frame within half a frame of the target count as "at" it.
    pub fn new(capacity: usize, tolerance: i64) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity: capacity.max(1),
            tolerance: tolerance.max(0),
            in_flight: BTreeSet::new(),
            in_flight_pts: HashMap::new(),
            horizon: None,
            end_of_stream: false,
            watermark: None,
            last_skipped: None,
            stats: ReorderStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered (decoded, unreleased) frames.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Highest PTS released in this epoch.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Whether one more frame can be reserved.
    pub fn has_room(&self) -> bool {
        self.heap.len() + self.in_flight.len() < self.capacity
    }

    /// Reserve a slot for a submitted sample. Returns false when full.
    pub fn expect(&mut self, sequence: u64, pts: i64) -> bool {
        if !self.has_room() {
            return false;
        }
        self.in_flight.insert((pts, sequence));
        self.in_flight_pts.insert(sequence, pts);
        true
    }

    /// Forget a reservation whose frame will never arrive.
    pub fn abandon(&mut self, sequence: u64) {
        if let Some(pts) = self.in_flight_pts.remove(&sequence) {
            self.in_flight.remove(&(pts, sequence));
        }
    }

    /// Drop every outstanding reservation.
    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
        self.in_flight_pts.clear();
    }

    /// Lowest PTS any sample not yet read can carry.
    pub fn set_horizon(&mut self, horizon: i64) {
        self.horizon = Some(horizon);
    }

    /// No more samples will be read in this epoch.
    pub fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    /// Insert a decoded frame.
    pub fn push(&mut self, sequence: u64, pts: i64, surface: DecodedSurface) -> PushOutcome {
        let reserved = match self.in_flight_pts.remove(&sequence) {
            Some(reserved_pts) => {
                self.in_flight.remove(&(reserved_pts, sequence));
                true
            }
            None => false,
        };
        if self.watermark.is_some_and(|w| pts < w) {
            self.stats.late_dropped += 1;
            tracing::warn!(
                "[reorder] dropping late frame pts={pts} seq={sequence} (released up to {:?})",
                self.watermark
            );
            return PushOutcome::Late;
        }
        if !reserved && !self.has_room() {
            self.stats.rejected += 1;
            tracing::warn!("[reorder] no room for unreserved frame pts={pts} seq={sequence}");
            return PushOutcome::Rejected;
        }
        self.heap.push(Reverse(Entry {
            pts,
            sequence,
            surface,
        }));
        self.stats.pushed += 1;
        PushOutcome::Buffered
    }

    fn is_ready(&self, pts: i64) -> bool {
        let before_in_flight = self.in_flight.first().map_or(true, |&(p, _)| pts <= p);
        let before_horizon = self.end_of_stream || self.horizon.is_some_and(|h| pts <= h);
        before_in_flight && before_horizon
    }

    /// Release the earliest ready frame whose PTS is at or after `target`.
    ///
    /// Ready frames before the target are skipped; the most recent one is
    /// kept for [`take_last_skipped`](Self::take_last_skipped). When the
    /// buffer is full and nothing is in flight, the earliest frame is released
    /// even if not ready.
    pub fn pop_ready(&mut self, target: i64) -> Pop {
        loop {
            let Some(Reverse(min)) = self.heap.peek() else {
                return Pop::Pending;
            };
            let pts = min.pts;
            if !self.is_ready(pts) {
                if self.heap.len() >= self.capacity && self.in_flight.is_empty() {
                    self.stats.forced += 1;
                    tracing::warn!("[reorder] buffer saturated, releasing pts={pts} early");
                } else {
                    return Pop::Pending;
                }
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                return Pop::Pending;
            };
            self.watermark = Some(self.watermark.map_or(pts, |w| w.max(pts)));
            if entry.pts.saturating_add(self.tolerance) < target {
                self.stats.skipped += 1;
                self.last_skipped = Some(entry.surface);
                continue;
            }
            self.stats.released += 1;
            self.last_skipped = None;
            return Pop::Ready(entry.surface);
        }
    }

    /// The last frame skipped over since the previous release.
    pub fn take_last_skipped(&mut self) -> Option<DecodedSurface> {
        self.last_skipped.take()
    }

    /// Drop everything and start a new epoch. Returns the frames dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        self.clear_in_flight();
        self.horizon = None;
        self.end_of_stream = false;
        self.watermark = None;
        self.last_skipped = None;
        if dropped > 0 {
            tracing::debug!("[reorder] flushed {dropped} buffered frames");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BufferCounters, TestBuffer};
    use std::sync::Arc;
    use vpreview_codec::PixelFormat;

    fn frame(sequence: u64, pts: i64, counters: &Arc<BufferCounters>) -> DecodedSurface {
        let buffer = TestBuffer::new(16, 16, PixelFormat::Nv12, true, sequence, Arc::clone(counters));
        DecodedSurface::new(Box::new(buffer), pts, 30, sequence, 0)
    }

    fn drain(buf: &mut ReorderBuffer, target: i64) -> Vec<i64> {
        let mut out = Vec::new();
        while let Pop::Ready(s) = buf.pop_ready(target) {
            out.push(s.pts());
        }
        out
    }

    #[test]
    fn test_reverse_completion_released_in_pts_order() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 0);
        for seq in 0..5 {
            assert!(buf.expect(seq, seq as i64));
        }
        for seq in (0..5).rev() {
            assert_eq!(buf.push(seq, seq as i64, frame(seq, seq as i64, &counters)), PushOutcome::Buffered);
        }
        buf.set_horizon(5);
        assert_eq!(drain(&mut buf, 0), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_waits_for_smaller_in_flight_pts() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 0);
        // Decode order I(0) P(3) B(1) B(2)
        for (seq, pts) in [(0, 0), (1, 3), (2, 1), (3, 2)] {
            buf.expect(seq, pts);
        }
        buf.set_horizon(4);
        buf.push(0, 0, frame(0, 0, &counters));
        buf.push(1, 3, frame(1, 3, &counters));
        assert_eq!(drain(&mut buf, 0), vec![0]);
        // P(3) must wait for both B-frames
        buf.push(3, 2, frame(3, 2, &counters));
        assert!(matches!(buf.pop_ready(0), Pop::Pending));
        buf.push(2, 1, frame(2, 1, &counters));
        assert_eq!(drain(&mut buf, 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_horizon_gates_release() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 0);
        buf.push(0, 10, frame(0, 10, &counters));
        // No horizon yet
        assert!(matches!(buf.pop_ready(0), Pop::Pending));
        buf.set_horizon(9);
        assert!(matches!(buf.pop_ready(0), Pop::Pending));
        buf.set_horizon(10);
        assert_eq!(drain(&mut buf, 0), vec![10]);

        buf.push(1, 20, frame(1, 20, &counters));
        buf.mark_end_of_stream();
        assert_eq!(drain(&mut buf, 0), vec![20]);
    }

    #[test]
    fn test_late_frame_dropped() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 0);
        buf.mark_end_of_stream();
        buf.push(0, 5, frame(0, 5, &counters));
        assert_eq!(drain(&mut buf, 0), vec![5]);
        assert_eq!(buf.push(1, 4, frame(1, 4, &counters)), PushOutcome::Late);
        assert_eq!(buf.stats().late_dropped, 1);
        // Equal PTS keeps the order non-decreasing
        assert_eq!(buf.push(2, 5, frame(2, 5, &counters)), PushOutcome::Buffered);
        assert_eq!(counters.released(), 2);
    }

    #[test]
    fn test_flush_starts_new_epoch() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 0);
        buf.mark_end_of_stream();
        buf.push(0, 50, frame(0, 50, &counters));
        assert_eq!(drain(&mut buf, 0), vec![50]);
        buf.expect(1, 60);
        buf.push(2, 70, frame(2, 70, &counters));

        assert_eq!(buf.flush(), 1);
        assert_eq!(buf.in_flight(), 0);
        assert_eq!(buf.watermark(), None);
        assert!(!buf.is_end_of_stream());

        // Earlier PTS is accepted after the flush
        buf.set_horizon(100);
        assert_eq!(buf.push(3, 10, frame(3, 10, &counters)), PushOutcome::Buffered);
        assert_eq!(drain(&mut buf, 0), vec![10]);
    }

    #[test]
    fn test_target_skips_earlier_frames() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(8, 5);
        buf.mark_end_of_stream();
        for (seq, pts) in [(0, 0), (1, 10), (2, 20), (3, 30)] {
            buf.push(seq, pts, frame(seq, pts, &counters));
        }
        // 20 is within tolerance of 24
        match buf.pop_ready(24) {
            Pop::Ready(s) => assert_eq!(s.pts(), 20),
            Pop::Pending => panic!("expected a frame"),
        }
        assert_eq!(buf.stats().skipped, 2);
        assert!(buf.take_last_skipped().is_none());

        // Past the end: everything is skipped, the last one is kept
        assert!(matches!(buf.pop_ready(100), Pop::Pending));
        assert_eq!(buf.take_last_skipped().map(|s| s.pts()), Some(30));
    }

    #[test]
    fn test_capacity_and_forced_release() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(3, 0);
        assert!(buf.expect(0, 0));
        assert!(buf.expect(1, 1));
        assert!(buf.expect(2, 2));
        assert!(!buf.expect(3, 3));
        assert!(!buf.has_room());

        for seq in 0..3 {
            buf.push(seq, seq as i64, frame(seq, seq as i64, &counters));
        }
        // Horizon never advanced: full and nothing in flight forces release
        assert_eq!(drain(&mut buf, 0), vec![0]);
        assert_eq!(buf.stats().forced, 1);
        assert!(matches!(buf.pop_ready(0), Pop::Pending));
    }

    #[test]
    fn test_unreserved_push_needs_room() {
        let counters = Arc::new(BufferCounters::default());
        let mut buf = ReorderBuffer::new(1, 0);
        assert_eq!(buf.push(0, 0, frame(0, 0, &counters)), PushOutcome::Buffered);
        assert_eq!(buf.push(1, 1, frame(1, 1, &counters)), PushOutcome::Rejected);
        assert_eq!(counters.released(), 1);
    }
}
