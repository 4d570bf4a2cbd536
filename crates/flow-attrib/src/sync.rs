//! Resource synchronizer.
//!
//! On every tick the connection table and the process tree are rescanned in
//! parallel, then the delay queue is drained. Only entries created at or
//! before the rescan completed are handled; anything newer waits for the next
//! cycle, since this rescan cannot have learned its mapping. Scan failures
//! are logged and retried on the next tick, never fatal.
//!
//! The inode-map TTL sweep runs on its own, much slower cadence.

use crossbeam_channel::{select, tick, Receiver};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::conn_scan::ConnScanner;
use crate::handler::{Attributor, DelayEntry};
use crate::inode_map::InodeMap;
use crate::proc_scan::ProcessScanner;
use crate::registry::ProcessRegistry;
use crate::stats::EngineStats;

/// How long an untouched inode-map entry lives, and how often the sweep runs.
pub(crate) const CONN_TTL: Duration = Duration::from_secs(120);
pub(crate) const EVICT_INTERVAL: Duration = Duration::from_secs(120);

pub(crate) struct Synchronizer {
    pub inode_map: Arc<InodeMap>,
    pub registry: Arc<ProcessRegistry>,
    pub conn_scanner: ConnScanner,
    pub proc_scanner: ProcessScanner,
    pub attributor: Arc<Attributor>,
    pub delay_rx: Receiver<DelayEntry>,
    pub stats: Arc<EngineStats>,
    pub interval: Duration,
    pub cancel: CancelToken,
}

impl Synchronizer {
    pub fn run(self) {
        // Prime the maps before the first packets need them.
        self.rescan();

        let ticker = tick(self.interval);
        // A drained entry newer than the last rescan is parked here until the
        // following cycle rather than pushed back behind newer entries.
        let mut pending: Option<DelayEntry> = None;

        loop {
            select! {
                recv(self.cancel.channel()) -> _ => return,
                recv(ticker) -> _ => {
                    self.rescan();
                    let completed = Instant::now();
                    self.drain_delay_queue(&mut pending, completed);
                }
            }
        }
    }

    /// Run both scanners in parallel and wait for both.
    fn rescan(&self) {
        std::thread::scope(|s| {
            let conns = s.spawn(|| self.conn_scanner.scan(&self.inode_map));
            let procs = s.spawn(|| self.proc_scanner.scan());

            match conns.join().expect("connection scan panicked") {
                Ok(rows) => debug!("connection rescan: {} rows", rows),
                Err(e) => warn!("connection rescan failed: {}", e),
            }
            match procs.join().expect("process scan panicked") {
                Ok(snapshots) => {
                    debug!("process rescan: {} processes", snapshots.len());
                    self.registry.apply(snapshots);
                }
                Err(e) => warn!("process rescan failed: {}", e),
            }
        });
        self.stats.rescans.fetch_add(1, Relaxed);
    }

    fn drain_delay_queue(&self, pending: &mut Option<DelayEntry>, completed: Instant) {
        loop {
            let entry = match pending.take() {
                Some(entry) => entry,
                None => match self.delay_rx.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => return,
                },
            };
            if entry.created > completed {
                *pending = Some(entry);
                return;
            }
            self.attributor.replay(entry);
        }
    }
}

/// Periodic inode-map TTL sweep; runs until cancelled.
pub(crate) fn run_evictor(
    inode_map: Arc<InodeMap>,
    stats: Arc<EngineStats>,
    interval: Duration,
    ttl: Duration,
    cancel: CancelToken,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(cancel.channel()) -> _ => return,
            recv(ticker) -> _ => {
                let removed = inode_map.evict(Instant::now() - ttl);
                if removed > 0 {
                    stats.evicted.fetch_add(removed as u64, Relaxed);
                    debug!("evicted {} stale connection entries", removed);
                }
            }
        }
    }
}
