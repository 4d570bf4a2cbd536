//! Process registry: inode → process and pid → process maps, per-process
//! cumulative counters, and the one-second traffic ring behind the rank
//! query.
//!
//! Records are `Arc`-shared between the two maps so a counter update never
//! touches the map layer. Cumulative totals and the ring are updated under
//! the record's ring lock, so high-rate increments contend per process rather
//! than on the registry.

use anyhow::{bail, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Ring capacity in one-second buckets; the widest rank window.
pub const MAX_RING_SECONDS: usize = 60;

/// How long a record whose pid vanished is kept before it is dropped.
/// Its inode links are removed immediately; only the counters linger.
const PID_GRACE: Duration = Duration::from_secs(10);

/// Optional process predicate; built from a name prefix by the CLI but any
/// matcher (substring, regex) fits the same seam.
pub type NameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Source IP is not one of ours: traffic flowing in.
    Ingress,
    /// Source IP is bound to this host: traffic flowing out.
    Egress,
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Traffic ring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Wall-clock second this bucket accumulates; 0 = never used.
    second: u64,
    in_bytes: u64,
    out_bytes: u64,
}

/// Fixed-capacity ring of one-second byte counters.
///
/// Buckets carry their second stamp, so sparse traffic leaves holes instead
/// of stale sums and a window query only counts buckets inside the window.
struct TrafficRing {
    buckets: [Bucket; MAX_RING_SECONDS],
    head: usize,
}

impl TrafficRing {
    fn new() -> Self {
        Self {
            buckets: [Bucket::default(); MAX_RING_SECONDS],
            head: 0,
        }
    }

    fn record(&mut self, second: u64, n: u64, direction: Direction) {
        if self.buckets[self.head].second != second {
            if second > self.buckets[self.head].second {
                self.head = (self.head + 1) % MAX_RING_SECONDS;
                self.buckets[self.head] = Bucket {
                    second,
                    in_bytes: 0,
                    out_bytes: 0,
                };
            } else {
                // Late write: the clock was read just before another thread
                // advanced the head. Credit the stamped bucket if it still
                // exists, otherwise the current head. A byte may land one
                // second off, but is never dropped or counted twice.
                let idx = self
                    .buckets
                    .iter()
                    .position(|b| b.second == second)
                    .unwrap_or(self.head);
                return Self::credit(&mut self.buckets[idx], n, direction);
            }
        }
        Self::credit(&mut self.buckets[self.head], n, direction);
    }

    fn credit(bucket: &mut Bucket, n: u64, direction: Direction) {
        match direction {
            Direction::Ingress => bucket.in_bytes += n,
            Direction::Egress => bucket.out_bytes += n,
        }
    }

    /// Sum of the buckets covering `(now_second - window, now_second]`.
    fn recent(&self, now_second: u64, window: usize) -> (u64, u64) {
        let floor = now_second.saturating_sub(window as u64);
        let mut in_bytes = 0u64;
        let mut out_bytes = 0u64;
        for b in &self.buckets {
            if b.second > floor && b.second <= now_second {
                in_bytes += b.in_bytes;
                out_bytes += b.out_bytes;
            }
        }
        (in_bytes, out_bytes)
    }
}

// ---------------------------------------------------------------------------
// Process record
// ---------------------------------------------------------------------------

struct RecordMeta {
    name: String,
    exe: String,
    inodes: HashSet<String>,
    last_seen: Instant,
}

pub struct ProcessRecord {
    pub pid: i32,
    meta: Mutex<RecordMeta>,
    in_total: AtomicU64,
    out_total: AtomicU64,
    ring: Mutex<TrafficRing>,
}

/// Point-in-time view of one process, as returned by the rank query.
/// Rates are bytes per second over the requested window.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: i32,
    pub name: String,
    pub exe: String,
    pub inode_count: usize,
    pub in_total: u64,
    pub out_total: u64,
    pub in_rate: u64,
    pub out_rate: u64,
}

impl ProcessRecord {
    fn new(pid: i32, name: String, exe: String) -> Self {
        Self {
            pid,
            meta: Mutex::new(RecordMeta {
                name,
                exe,
                inodes: HashSet::new(),
                last_seen: Instant::now(),
            }),
            in_total: AtomicU64::new(0),
            out_total: AtomicU64::new(0),
            ring: Mutex::new(TrafficRing::new()),
        }
    }

    /// Credit `n` bytes: cumulative total plus the current ring bucket, in
    /// one critical section so a snapshot never sees one without the other.
    pub fn add_traffic(&self, n: u64, direction: Direction) {
        self.add_traffic_at(unix_now_secs(), n, direction);
    }

    fn add_traffic_at(&self, second: u64, n: u64, direction: Direction) {
        let mut ring = self.ring.lock().unwrap();
        match direction {
            Direction::Ingress => self.in_total.fetch_add(n, Relaxed),
            Direction::Egress => self.out_total.fetch_add(n, Relaxed),
        };
        ring.record(second, n, direction);
    }

    pub fn in_total(&self) -> u64 {
        self.in_total.load(Relaxed)
    }

    pub fn out_total(&self) -> u64 {
        self.out_total.load(Relaxed)
    }

    /// Replace the owned inode set with a rescan snapshot, refreshing the
    /// process metadata. Returns (added, removed) relative to the prior set.
    fn replace_inodes(
        &self,
        name: String,
        exe: String,
        inodes: HashSet<String>,
    ) -> (Vec<String>, Vec<String>) {
        let mut meta = self.meta.lock().unwrap();
        let added = inodes.difference(&meta.inodes).cloned().collect();
        let removed = meta.inodes.difference(&inodes).cloned().collect();
        meta.name = name;
        meta.exe = exe;
        meta.inodes = inodes;
        meta.last_seen = Instant::now();
        (added, removed)
    }

    /// Drop every owned inode (pid vanished). Does not refresh `last_seen`.
    fn take_inodes(&self) -> Vec<String> {
        let mut meta = self.meta.lock().unwrap();
        meta.inodes.drain().collect()
    }

    fn last_seen_elapsed(&self) -> Duration {
        self.meta.lock().unwrap().last_seen.elapsed()
    }

    fn snapshot_at(&self, now_second: u64, window: usize) -> ProcessSnapshot {
        // Ring lock first: totals are only written inside it, so reading them
        // here yields a consistent cumulative + ring pair.
        let ring = self.ring.lock().unwrap();
        let in_total = self.in_total.load(Relaxed);
        let out_total = self.out_total.load(Relaxed);
        let (recent_in, recent_out) = ring.recent(now_second, window);
        drop(ring);

        let meta = self.meta.lock().unwrap();
        ProcessSnapshot {
            pid: self.pid,
            name: meta.name.clone(),
            exe: meta.exe.clone(),
            inode_count: meta.inodes.len(),
            in_total,
            out_total,
            in_rate: recent_in / window as u64,
            out_rate: recent_out / window as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One process observed by the scanner: its identity and the socket inodes
/// currently held by its file descriptors.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: i32,
    pub name: String,
    pub exe: String,
    pub inodes: HashSet<String>,
}

pub struct ProcessRegistry {
    by_inode: DashMap<String, Arc<ProcessRecord>>,
    by_pid: DashMap<i32, Arc<ProcessRecord>>,
    grace: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_grace(PID_GRACE)
    }

    fn with_grace(grace: Duration) -> Self {
        Self {
            by_inode: DashMap::new(),
            by_pid: DashMap::new(),
            grace,
        }
    }

    pub fn lookup_by_inode(&self, inode: &str) -> Option<Arc<ProcessRecord>> {
        self.by_inode.get(inode).map(|r| r.value().clone())
    }

    pub fn process_count(&self) -> usize {
        self.by_pid.len()
    }

    /// Reconcile the registry against a fresh scan.
    ///
    /// Per process the inode set is replaced atomically with its snapshot.
    /// Inodes that left a process are unlinked unless another process has
    /// since claimed them; an inode claimed by two scans in a row belongs to
    /// the later claimant. Records whose pid is gone lose their inode links
    /// at once and are dropped after the grace period.
    pub fn apply(&self, snapshots: Vec<ProcSnapshot>) {
        let mut live: HashSet<i32> = HashSet::with_capacity(snapshots.len());

        for snap in snapshots {
            live.insert(snap.pid);
            let record = self
                .by_pid
                .entry(snap.pid)
                .or_insert_with(|| {
                    Arc::new(ProcessRecord::new(snap.pid, snap.name.clone(), snap.exe.clone()))
                })
                .value()
                .clone();

            let (added, removed) = record.replace_inodes(snap.name, snap.exe, snap.inodes);
            for inode in removed {
                self.unlink(&inode, &record);
            }
            for inode in added {
                self.by_inode.insert(inode, record.clone());
            }
        }

        let stale: Vec<Arc<ProcessRecord>> = self
            .by_pid
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        for record in stale {
            for inode in record.take_inodes() {
                self.unlink(&inode, &record);
            }
            if record.last_seen_elapsed() > self.grace {
                self.by_pid.remove(&record.pid);
            }
        }
    }

    /// Remove `inode → record` only if `record` is still the owner.
    fn unlink(&self, inode: &str, record: &Arc<ProcessRecord>) {
        self.by_inode
            .remove_if(inode, |_, owner| Arc::ptr_eq(owner, record));
    }

    /// Top `limit` processes by recent throughput over the last
    /// `recent_seconds` seconds.
    pub fn rank(&self, limit: usize, recent_seconds: usize) -> Result<Vec<ProcessSnapshot>> {
        self.rank_at(limit, recent_seconds, unix_now_secs())
    }

    fn rank_at(
        &self,
        limit: usize,
        recent_seconds: usize,
        now_second: u64,
    ) -> Result<Vec<ProcessSnapshot>> {
        if recent_seconds == 0 || recent_seconds > MAX_RING_SECONDS {
            bail!(
                "rank window must be between 1 and {} seconds, got {}",
                MAX_RING_SECONDS,
                recent_seconds
            );
        }

        let mut rows: Vec<ProcessSnapshot> = self
            .by_pid
            .iter()
            .map(|e| e.value().snapshot_at(now_second, recent_seconds))
            .collect();

        rows.sort_by(|a, b| {
            let peak_a = a.in_rate.max(a.out_rate);
            let peak_b = b.in_rate.max(b.out_rate);
            peak_b
                .cmp(&peak_a)
                .then_with(|| (b.in_total + b.out_total).cmp(&(a.in_total + a.out_total)))
                .then_with(|| a.pid.cmp(&b.pid))
        });
        rows.truncate(limit);
        Ok(rows)
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(pid: i32, name: &str, inodes: &[&str]) -> ProcSnapshot {
        ProcSnapshot {
            pid,
            name: name.to_string(),
            exe: format!("/usr/bin/{}", name),
            inodes: inodes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_ring_accumulates_within_second() {
        let mut ring = TrafficRing::new();
        ring.record(100, 600, Direction::Ingress);
        ring.record(100, 400, Direction::Ingress);
        ring.record(100, 50, Direction::Egress);
        assert_eq!(ring.recent(100, 1), (1000, 50));
    }

    #[test]
    fn test_ring_window_excludes_older_buckets() {
        let mut ring = TrafficRing::new();
        for second in 1..=5u64 {
            ring.record(second, 1000, Direction::Ingress);
        }
        // At second 5, the 5-second window covers exactly the traffic.
        assert_eq!(ring.recent(5, 5), (5000, 0));
        // Five silent seconds later the same bytes spread over a 10s window,
        // and the 5s window is empty.
        assert_eq!(ring.recent(10, 10), (5000, 0));
        assert_eq!(ring.recent(10, 5), (0, 0));
    }

    #[test]
    fn test_ring_gap_leaves_holes() {
        let mut ring = TrafficRing::new();
        ring.record(10, 100, Direction::Egress);
        ring.record(20, 200, Direction::Egress);
        assert_eq!(ring.recent(20, 5), (0, 200));
        assert_eq!(ring.recent(20, 11), (0, 300));
    }

    #[test]
    fn test_ring_wraps_at_capacity() {
        let mut ring = TrafficRing::new();
        for second in 1..=(MAX_RING_SECONDS as u64 + 40) {
            ring.record(second, 1, Direction::Ingress);
        }
        let now = MAX_RING_SECONDS as u64 + 40;
        // Only the last MAX_RING_SECONDS buckets survive.
        assert_eq!(ring.recent(now, MAX_RING_SECONDS), (MAX_RING_SECONDS as u64, 0));
    }

    #[test]
    fn test_ring_late_write_is_not_lost() {
        let mut ring = TrafficRing::new();
        ring.record(100, 10, Direction::Ingress);
        ring.record(101, 10, Direction::Ingress);
        // Writer that read the clock before the tick.
        ring.record(100, 5, Direction::Ingress);
        let (in_bytes, _) = ring.recent(101, 2);
        assert_eq!(in_bytes, 25);
    }

    #[test]
    fn test_counters_monotonic_and_totals() {
        let record = ProcessRecord::new(1, "p".into(), "/p".into());
        record.add_traffic_at(10, 100, Direction::Ingress);
        record.add_traffic_at(10, 50, Direction::Egress);
        record.add_traffic_at(11, 100, Direction::Ingress);
        assert_eq!(record.in_total(), 200);
        assert_eq!(record.out_total(), 50);
    }

    #[test]
    fn test_rescan_links_and_lookup() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![snap(100, "curl", &["555", "556"])]);

        let record = registry.lookup_by_inode("555").expect("inode 555 linked");
        assert_eq!(record.pid, 100);
        assert!(registry.lookup_by_inode("999").is_none());
        assert_eq!(registry.process_count(), 1);
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![snap(100, "curl", &["555"])]);
        let before = registry.lookup_by_inode("555").unwrap();
        before.add_traffic_at(1, 40, Direction::Egress);

        registry.apply(vec![snap(100, "curl", &["555"])]);
        let after = registry.lookup_by_inode("555").unwrap();
        // Same record, counters intact.
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.out_total(), 40);
    }

    #[test]
    fn test_inode_dropped_from_process_is_unlinked() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![snap(100, "curl", &["555", "556"])]);
        registry.apply(vec![snap(100, "curl", &["556"])]);
        assert!(registry.lookup_by_inode("555").is_none());
        assert!(registry.lookup_by_inode("556").is_some());
    }

    #[test]
    fn test_inode_ownership_moves_to_new_claimant() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![snap(100, "old", &["555"])]);
        registry.apply(vec![snap(100, "old", &[]), snap(200, "new", &["555"])]);
        let owner = registry.lookup_by_inode("555").unwrap();
        assert_eq!(owner.pid, 200);
    }

    #[test]
    fn test_vanished_pid_unlinked_then_dropped_after_grace() {
        let registry = ProcessRegistry::with_grace(Duration::from_secs(3600));
        registry.apply(vec![snap(100, "curl", &["555"])]);
        registry.apply(vec![]);
        // Inode link goes immediately; the record rides out the grace period.
        assert!(registry.lookup_by_inode("555").is_none());
        assert_eq!(registry.process_count(), 1);

        let registry = ProcessRegistry::with_grace(Duration::ZERO);
        registry.apply(vec![snap(100, "curl", &["555"])]);
        std::thread::sleep(Duration::from_millis(5));
        registry.apply(vec![]);
        assert_eq!(registry.process_count(), 0);
    }

    #[test]
    fn test_rank_rate_windowing() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![snap(100, "curl", &["555"])]);
        let record = registry.lookup_by_inode("555").unwrap();
        for second in 1..=5u64 {
            record.add_traffic_at(second, 1000, Direction::Ingress);
        }

        let rows = registry.rank_at(1, 5, 5).unwrap();
        assert_eq!(rows[0].in_rate, 1000);

        // Five silent seconds later the 10s average halves.
        let rows = registry.rank_at(1, 10, 10).unwrap();
        assert_eq!(rows[0].in_rate, 500);
        assert_eq!(rows[0].in_total, 5000);
    }

    #[test]
    fn test_rank_orders_by_peak_rate_then_total_then_pid() {
        let registry = ProcessRegistry::new();
        registry.apply(vec![
            snap(30, "c", &["3"]),
            snap(10, "a", &["1"]),
            snap(20, "b", &["2"]),
        ]);
        // pid 10: high egress rate. pid 20: same peak rate, bigger total.
        // pid 30: idle.
        let a = registry.lookup_by_inode("1").unwrap();
        let b = registry.lookup_by_inode("2").unwrap();
        a.add_traffic_at(100, 500, Direction::Egress);
        b.add_traffic_at(100, 500, Direction::Ingress);
        b.add_traffic_at(50, 9000, Direction::Ingress);

        let rows = registry.rank_at(3, 1, 100).unwrap();
        assert_eq!(rows[0].pid, 20);
        assert_eq!(rows[1].pid, 10);
        assert_eq!(rows[2].pid, 30);

        let limited = registry.rank_at(2, 1, 100).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_rank_rejects_invalid_window() {
        let registry = ProcessRegistry::new();
        assert!(registry.rank(10, 0).is_err());
        assert!(registry.rank(10, MAX_RING_SECONDS + 1).is_err());
        assert!(registry.rank(10, MAX_RING_SECONDS).is_ok());
    }
}
