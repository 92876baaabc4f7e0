//! Observer hooks for stream servers.
//!
//! Callbacks run synchronously on the thread performing the operation, and
//! most of them while the stream's lock is held. Keep them cheap.

use crate::error::StreamError;
use crate::protocol::StreamControl;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub trait StreamMonitor: Send + Sync {
    /// A real local operation failed.
    fn failure(&self, _stream: &StreamControl, _err: &StreamError) {}

    /// Bytes handed across the wire (a replayed packet has `reattempt` set).
    fn bytes_moved(&self, _stream: &StreamControl, _num_bytes: usize, _reattempt: bool) {}

    fn bytes_skipped(&self, _stream: &StreamControl, _num_bytes: u64, _reattempt: bool) {}

    /// Bytes read from or written to the local resource.
    fn local_bytes_moved(&self, _stream: &StreamControl, _num_bytes: usize) {}

    fn local_bytes_skipped(&self, _stream: &StreamControl, _num_bytes: u64) {}

    /// Raised exactly once per stream.
    fn closed(&self, _stream: &StreamControl, _clean: bool) {}
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl StreamMonitor for NoopMonitor {}

pub fn noop() -> Arc<dyn StreamMonitor> {
    Arc::new(NoopMonitor)
}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl StreamMonitor for TracingMonitor {
    fn failure(&self, stream: &StreamControl, err: &StreamError) {
        warn!(stream = stream.id(), direction = %stream.direction(), error = %err, "stream failure");
    }

    fn bytes_moved(&self, stream: &StreamControl, num_bytes: usize, reattempt: bool) {
        trace!(stream = stream.id(), num_bytes, reattempt, "bytes moved");
    }

    fn bytes_skipped(&self, stream: &StreamControl, num_bytes: u64, reattempt: bool) {
        trace!(stream = stream.id(), num_bytes, reattempt, "bytes skipped");
    }

    fn local_bytes_moved(&self, stream: &StreamControl, num_bytes: usize) {
        trace!(stream = stream.id(), num_bytes, "local bytes moved");
    }

    fn local_bytes_skipped(&self, stream: &StreamControl, num_bytes: u64) {
        trace!(stream = stream.id(), num_bytes, "local bytes skipped");
    }

    fn closed(&self, stream: &StreamControl, clean: bool) {
        debug!(stream = stream.id(), direction = %stream.direction(), clean, "stream closed");
    }
}

/// Counters for a transfer, optionally aborting the stream when too many
/// bytes have crossed the wire.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_moved: AtomicU64,
    bytes_skipped: AtomicU64,
    local_bytes_moved: AtomicU64,
    local_bytes_skipped: AtomicU64,
    reattempts: AtomicU64,
    failures: AtomicU64,
    closes: AtomicU64,
    clean_close: AtomicBool,
    abort_after: Option<u64>,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_moved: u64,
    pub bytes_skipped: u64,
    pub local_bytes_moved: u64,
    pub local_bytes_skipped: u64,
    pub reattempts: u64,
    pub failures: u64,
    pub closes: u64,
    pub clean_close: bool,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the observed stream once more than `limit` wire bytes moved.
    pub fn abort_after(limit: u64) -> Self {
        Self {
            abort_after: Some(limit),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_moved: self.bytes_moved.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            local_bytes_moved: self.local_bytes_moved.load(Ordering::Relaxed),
            local_bytes_skipped: self.local_bytes_skipped.load(Ordering::Relaxed),
            reattempts: self.reattempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            clean_close: self.clean_close.load(Ordering::Relaxed),
        }
    }
}

impl StreamMonitor for TransferStats {
    fn failure(&self, _stream: &StreamControl, _err: &StreamError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_moved(&self, stream: &StreamControl, num_bytes: usize, reattempt: bool) {
        if reattempt {
            self.reattempts.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let total = self
            .bytes_moved
            .fetch_add(num_bytes as u64, Ordering::Relaxed)
            + num_bytes as u64;
        if let Some(limit) = self.abort_after {
            if total > limit {
                stream.abort();
            }
        }
    }

    fn bytes_skipped(&self, _stream: &StreamControl, num_bytes: u64, reattempt: bool) {
        if reattempt {
            self.reattempts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_skipped.fetch_add(num_bytes, Ordering::Relaxed);
        }
    }

    fn local_bytes_moved(&self, _stream: &StreamControl, num_bytes: usize) {
        self.local_bytes_moved
            .fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    fn local_bytes_skipped(&self, _stream: &StreamControl, num_bytes: u64) {
        self.local_bytes_skipped
            .fetch_add(num_bytes, Ordering::Relaxed);
    }

    fn closed(&self, _stream: &StreamControl, clean: bool) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.clean_close.store(clean, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;

    #[test]
    fn test_stats_count_reattempts_separately() {
        let stats = TransferStats::new();
        let control = StreamControl::new(Direction::Input);
        stats.bytes_moved(&control, 100, false);
        stats.bytes_moved(&control, 100, true);
        stats.bytes_skipped(&control, 5, false);
        stats.closed(&control, true);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_moved, 100);
        assert_eq!(snap.reattempts, 1);
        assert_eq!(snap.bytes_skipped, 5);
        assert_eq!(snap.closes, 1);
        assert!(snap.clean_close);
    }

    #[test]
    fn test_threshold_aborts_stream() {
        let stats = TransferStats::abort_after(150);
        let control = StreamControl::new(Direction::Output);
        stats.bytes_moved(&control, 100, false);
        assert!(!control.is_aborted());
        stats.bytes_moved(&control, 100, false);
        assert!(control.is_aborted());
    }
}
