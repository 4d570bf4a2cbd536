//! Atomic engine counters.
//!
//! Counters use Relaxed ordering; they are observability, never
//! synchronisation. The dropped-event counters are the only record of load
//! shed by the bounded queues, so they are kept even when debug logging is
//! off.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

pub struct EngineStats {
    /// Packets accepted onto the packet queue (the `load_counter` value).
    pub packets_enqueued: AtomicU64,
    /// Packets shed because the packet queue was full.
    pub packets_dropped: AtomicU64,
    /// Packets fully parsed and pushed through attribution.
    pub packets_handled: AtomicU64,
    /// Frames discarded for not being IPv4 + TCP.
    pub parse_skipped: AtomicU64,

    pub delay_enqueued: AtomicU64,
    /// Delay entries shed because the delay queue was full.
    pub delay_dropped: AtomicU64,
    /// Delay entries successfully attributed on replay.
    pub delay_replayed: AtomicU64,
    /// Delay entries discarded at the retry cap.
    pub delay_expired: AtomicU64,

    pub rescans: AtomicU64,
    /// Inode-map entries removed by the TTL sweep.
    pub evicted: AtomicU64,
}

/// Plain-struct snapshot for display and reporting (no atomics).
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub packets_enqueued: u64,
    pub packets_dropped: u64,
    pub packets_handled: u64,
    pub parse_skipped: u64,
    pub delay_enqueued: u64,
    pub delay_dropped: u64,
    pub delay_replayed: u64,
    pub delay_expired: u64,
    pub rescans: u64,
    pub evicted: u64,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets_enqueued: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_handled: AtomicU64::new(0),
            parse_skipped: AtomicU64::new(0),
            delay_enqueued: AtomicU64::new(0),
            delay_dropped: AtomicU64::new(0),
            delay_replayed: AtomicU64::new(0),
            delay_expired: AtomicU64::new(0),
            rescans: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            packets_enqueued: self.packets_enqueued.load(Relaxed),
            packets_dropped: self.packets_dropped.load(Relaxed),
            packets_handled: self.packets_handled.load(Relaxed),
            parse_skipped: self.parse_skipped.load(Relaxed),
            delay_enqueued: self.delay_enqueued.load(Relaxed),
            delay_dropped: self.delay_dropped.load(Relaxed),
            delay_replayed: self.delay_replayed.load(Relaxed),
            delay_expired: self.delay_expired.load(Relaxed),
            rescans: self.rescans.load(Relaxed),
            evicted: self.evicted.load(Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = EngineStats::new();
        stats.packets_enqueued.fetch_add(42, Relaxed);
        stats.packets_dropped.fetch_add(8, Relaxed);
        stats.delay_expired.fetch_add(1, Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_enqueued, 42);
        assert_eq!(snap.packets_dropped, 8);
        assert_eq!(snap.delay_expired, 1);
        assert_eq!(snap.packets_handled, 0);
    }
}
