//! Playback queue (jitter buffer) with anti-lag drop policy
//!
//! Many producers (network deliveries) offer frames, one consumer (the
//! playback worker) takes them. When the consumer falls behind and the depth
//! climbs above the watermark, everything pending is thrown away so playback
//! stays live instead of drifting further behind.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::audio::frame::PcmFrame;

/// Result of [`PlaybackQueue::offer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Appended behind the frames already pending
    Queued,
    /// The queue was over the watermark; `dropped` frames were discarded and
    /// the offered frame is now the only one pending
    QueuedAfterClear { dropped: usize },
    /// The queue has been closed; the frame was discarded
    Closed,
}

struct Inner {
    frames: VecDeque<PcmFrame>,
    closed: bool,
}

/// Bounded-by-policy FIFO between network delivery and playback
pub struct PlaybackQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    watermark: usize,
    accepted: AtomicU64,
    dropped: AtomicU64,
    clears: AtomicU64,
}

impl PlaybackQueue {
    /// Create a queue that flushes once its depth exceeds `watermark`
    pub fn new(watermark: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(watermark + 1),
                closed: false,
            }),
            available: Condvar::new(),
            watermark,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            clears: AtomicU64::new(0),
        }
    }

    /// Append a frame without blocking.
    ///
    /// Clear and append happen under one lock, so concurrent producers
    /// never observe a half-flushed queue.
    pub fn offer(&self, frame: PcmFrame) -> Offer {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Offer::Closed;
        }

        let outcome = if inner.frames.len() > self.watermark {
            let dropped = inner.frames.len();
            inner.frames.clear();
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.clears.fetch_add(1, Ordering::Relaxed);
            warn!(dropped, "Player buffer full - dropping audio to catch up");
            Offer::QueuedAfterClear { dropped }
        } else {
            Offer::Queued
        };

        inner.frames.push_back(frame);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        drop(inner);

        self.available.notify_one();
        outcome
    }

    /// Wait for the next frame.
    ///
    /// Returns `None` once the queue is closed; frames still pending at that
    /// point are discarded.
    pub fn take(&self) -> Option<PcmFrame> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Pop without waiting
    pub fn try_take(&self) -> Option<PcmFrame> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.frames.pop_front()
    }

    /// Reject further offers and wake every waiting consumer
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.frames.clear();
        drop(inner);
        self.available.notify_all();
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            watermark: self.watermark,
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a playback queue
pub type SharedPlaybackQueue = Arc<PlaybackQueue>;

/// Playback queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub watermark: usize,
    /// Frames accepted since creation
    pub accepted: u64,
    /// Frames discarded by anti-lag clears
    pub dropped: u64,
    /// Number of anti-lag clears
    pub clears: u64,
}

impl QueueStats {
    /// Share of accepted frames later discarded by a clear
    pub fn drop_rate(&self) -> f32 {
        if self.accepted == 0 {
            0.0
        } else {
            self.dropped as f32 / self.accepted as f32
        }
    }
}
