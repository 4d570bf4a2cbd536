//! Engine lifecycle: configuration, worker orchestration, shutdown.
//!
//! `Engine::builder()` validates options and pins down the host bindings;
//! `start()` spawns the capture workers (one per bound device), the handler
//! pool, the synchronizer, the eviction sweep, and the capture-timeout timer.
//! `stop()` cancels the shared token, joins every worker, and runs teardown
//! actions in LIFO order. All of it hangs off one `Arc` so the timer thread
//! can trigger shutdown on its own.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{after, bounded, select};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering::SeqCst};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::archive::{spawn_archive_writer, ArchiveEvent};
use crate::cancel::{CancelSource, CancelToken};
use crate::capture::{spawn_capture_worker, CapturedPacket, DEFAULT_BPF_FILTER};
use crate::cgroup::{CgroupLimiter, CgroupLimits};
use crate::conn_scan::ConnScanner;
use crate::handler::{run_handler, Accounting, Attributor, DelayEntry};
use crate::iface::{self, DEFAULT_DEVICE_PREFIXES};
use crate::inode_map::InodeMap;
use crate::proc_scan::ProcessScanner;
use crate::registry::{NameFilter, ProcessRegistry, ProcessSnapshot};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::sync::{run_evictor, Synchronizer, CONN_TTL, EVICT_INTERVAL};

pub const DEFAULT_QUEUE_SIZE: usize = 2_000_000;
pub const MIN_QUEUE_SIZE: usize = 1_000;
pub const DEFAULT_HANDLER_COUNT: usize = 1;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Ceiling (and default) for the capture timeout: roughly a year.
pub const MAX_CAPTURE_TIMEOUT: Duration = Duration::from_secs(12 * 30 * 24 * 60 * 60);

/// Capacity of the channel feeding the archive writer.
const ARCHIVE_QUEUE_SIZE: usize = 4_096;

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    bind_ips: Option<Vec<IpAddr>>,
    bind_devices: Option<Vec<String>>,
    device_prefixes: Vec<String>,
    name_filter: Option<NameFilter>,
    queue_size: usize,
    handler_count: usize,
    sync_interval: Duration,
    capture_timeout: Duration,
    bpf_filter: Option<String>,
    archive_path: Option<PathBuf>,
    accounting: Accounting,
    cgroup: Option<CgroupLimits>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            bind_ips: None,
            bind_devices: None,
            device_prefixes: DEFAULT_DEVICE_PREFIXES.iter().map(|s| s.to_string()).collect(),
            name_filter: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            handler_count: DEFAULT_HANDLER_COUNT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            capture_timeout: MAX_CAPTURE_TIMEOUT,
            bpf_filter: None,
            archive_path: None,
            accounting: Accounting::HeadersAndPayload,
            cgroup: None,
        }
    }

    /// Override the host addresses used for direction classification.
    pub fn bind_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.bind_ips = Some(ips);
        self
    }

    /// Override the devices to capture on.
    pub fn bind_devices(mut self, devices: Vec<String>) -> Self {
        self.bind_devices = Some(devices);
        self
    }

    /// Interface name prefixes considered when discovering devices.
    pub fn device_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.device_prefixes = prefixes;
        self
    }

    /// Track only processes whose name starts with `prefix`.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.name_filter = Some(Arc::new(move |name: &str| name.starts_with(&prefix)));
        self
    }

    /// Track only processes accepted by an arbitrary predicate.
    pub fn name_filter(mut self, filter: NameFilter) -> Self {
        self.name_filter = Some(filter);
        self
    }

    /// Packet and delay queue capacity; values below the floor are raised to it.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(MIN_QUEUE_SIZE);
        self
    }

    pub fn handler_count(mut self, count: usize) -> Self {
        self.handler_count = count.max(1);
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Engine lifetime cap; clamped to [`MAX_CAPTURE_TIMEOUT`].
    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout.min(MAX_CAPTURE_TIMEOUT);
        self
    }

    /// Replace the default BPF program.
    pub fn bpf_filter(mut self, filter: impl Into<String>) -> Self {
        self.bpf_filter = Some(filter.into());
        self
    }

    /// Also write every captured frame to a pcap file.
    pub fn archive_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = Some(path.into());
        self
    }

    pub fn accounting(mut self, accounting: Accounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Cap the engine's own CPU and memory via cgroups.
    pub fn cgroup_limits(mut self, limits: CgroupLimits) -> Self {
        self.cgroup = Some(limits);
        self
    }

    pub fn build(self) -> Result<Engine> {
        if self.sync_interval.is_zero() {
            bail!("sync interval must be greater than zero");
        }
        if matches!(&self.bind_ips, Some(ips) if ips.is_empty()) {
            bail!("bind IP override must not be empty");
        }
        if matches!(&self.bind_devices, Some(devs) if devs.is_empty()) {
            bail!("bind device override must not be empty");
        }
        let bpf_filter = match self.bpf_filter {
            Some(f) => {
                let trimmed = f.trim().to_string();
                if trimmed.is_empty() {
                    bail!("BPF filter override must not be empty");
                }
                trimmed
            }
            None => DEFAULT_BPF_FILTER.to_string(),
        };

        // Discovery only runs for whichever side was not overridden.
        let (bound_ips, bound_devices) = match (self.bind_ips, self.bind_devices) {
            (Some(ips), Some(devices)) => (ips.into_iter().collect(), devices),
            (ips, devices) => {
                let discovered = iface::discover(&self.device_prefixes)
                    .context("discover host interfaces")?;
                (
                    ips.map(|v| v.into_iter().collect())
                        .unwrap_or(discovered.ips),
                    devices.unwrap_or(discovered.devices),
                )
            }
        };
        if bound_devices.is_empty() {
            bail!("no capture devices found; check the device prefix allowlist");
        }
        if bound_ips.is_empty() {
            bail!("no bound IP addresses found");
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                state: AtomicU8::new(STATE_NEW),
                bound_ips: Arc::new(bound_ips),
                bound_devices,
                bpf_filter,
                queue_size: self.queue_size,
                handler_count: self.handler_count,
                sync_interval: self.sync_interval,
                capture_timeout: self.capture_timeout,
                archive_path: self.archive_path,
                accounting: self.accounting,
                cgroup: self.cgroup,
                name_filter: self.name_filter,
                inode_map: Arc::new(InodeMap::new()),
                registry: Arc::new(ProcessRegistry::new()),
                stats: EngineStats::new(),
                cancel: CancelSource::new(),
                handles: Mutex::new(Vec::new()),
                teardown: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    state: AtomicU8,

    bound_ips: Arc<HashSet<IpAddr>>,
    bound_devices: Vec<String>,
    bpf_filter: String,
    queue_size: usize,
    handler_count: usize,
    sync_interval: Duration,
    capture_timeout: Duration,
    archive_path: Option<PathBuf>,
    accounting: Accounting,
    cgroup: Option<CgroupLimits>,
    name_filter: Option<NameFilter>,

    inode_map: Arc<InodeMap>,
    registry: Arc<ProcessRegistry>,
    stats: Arc<EngineStats>,
    cancel: CancelSource,
    handles: Mutex<Vec<JoinHandle<()>>>,
    teardown: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start capture, handling, and synchronization. Initialization failures
    /// (archive open, cgroup setup) leave the engine back in its initial
    /// state with no side effects.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(STATE_NEW, STATE_RUNNING, SeqCst, SeqCst)
            .is_err()
        {
            bail!("engine already started or stopped");
        }
        if let Err(e) = self.spawn_workers() {
            self.inner.run_teardown();
            self.inner.state.store(STATE_NEW, SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Cancel all workers, wait for them to exit, and run teardown actions.
    /// Idempotent; concurrent calls beyond the first return immediately.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, SeqCst, SeqCst)
            .is_err()
        {
            // Never started: settle straight into Stopped and release waiters.
            if inner
                .state
                .compare_exchange(STATE_NEW, STATE_STOPPED, SeqCst, SeqCst)
                .is_ok()
            {
                inner.cancel.cancel();
            }
            return;
        }

        inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = inner.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        inner.run_teardown();
        inner.state.store(STATE_STOPPED, SeqCst);
        info!("engine stopped");
    }

    /// Token that resolves when the engine is cancelled (stop call, signal
    /// path, or capture-timeout expiry).
    pub fn done(&self) -> CancelToken {
        self.inner.cancel.token()
    }

    /// Total packets accepted onto the packet queue.
    pub fn load_counter(&self) -> u64 {
        self.inner.stats.packets_enqueued.load(Relaxed)
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Tracked connection-table entries (both orientations).
    pub fn connection_count(&self) -> usize {
        self.inner.inode_map.len()
    }

    pub fn process_count(&self) -> usize {
        self.inner.registry.process_count()
    }

    /// Top `limit` processes by throughput over the last `recent_seconds`
    /// seconds. Errors before `start()` and for windows beyond the ring.
    pub fn rank(&self, limit: usize, recent_seconds: usize) -> Result<Vec<ProcessSnapshot>> {
        if self.inner.state.load(SeqCst) == STATE_NEW {
            bail!("engine not started");
        }
        self.inner.registry.rank(limit, recent_seconds)
    }

    fn spawn_workers(&self) -> Result<()> {
        let inner = &self.inner;

        // Fallible initialization first, so a failure unwinds cleanly.
        if let Some(limits) = inner.cgroup {
            let pid = std::process::id();
            let limiter = CgroupLimiter::apply(pid, &limits).context("configure cgroup limits")?;
            inner
                .teardown
                .lock()
                .unwrap()
                .push(Box::new(move || limiter.release(pid)));
        }

        let archive_tx = match &inner.archive_path {
            Some(path) => {
                let (tx, rx) = bounded::<ArchiveEvent>(ARCHIVE_QUEUE_SIZE);
                let handle = spawn_archive_writer(path, rx).context("open pcap archive")?;
                inner.handles.lock().unwrap().push(handle);
                Some(tx)
            }
            None => None,
        };

        let (packet_tx, packet_rx) = bounded::<CapturedPacket>(inner.queue_size);
        let (delay_tx, delay_rx) = bounded::<DelayEntry>(inner.queue_size);
        let attributor = Arc::new(Attributor {
            inode_map: inner.inode_map.clone(),
            registry: inner.registry.clone(),
            delay_tx,
            stats: inner.stats.clone(),
        });

        let mut handles = inner.handles.lock().unwrap();
        for device in &inner.bound_devices {
            handles.push(spawn_capture_worker(
                device.clone(),
                inner.bpf_filter.clone(),
                packet_tx.clone(),
                archive_tx.clone(),
                inner.stats.clone(),
                inner.cancel.token(),
            ));
        }
        drop(packet_tx);
        drop(archive_tx);

        for i in 0..inner.handler_count {
            let rx = packet_rx.clone();
            let bound_ips = inner.bound_ips.clone();
            let accounting = inner.accounting;
            let attributor = attributor.clone();
            let cancel = inner.cancel.token();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("handler-{}", i))
                    .spawn(move || run_handler(rx, bound_ips, accounting, attributor, cancel))
                    .expect("failed to spawn handler thread"),
            );
        }
        drop(packet_rx);

        let synchronizer = Synchronizer {
            inode_map: inner.inode_map.clone(),
            registry: inner.registry.clone(),
            conn_scanner: ConnScanner::new(),
            proc_scanner: ProcessScanner::new(inner.name_filter.clone()),
            attributor,
            delay_rx,
            stats: inner.stats.clone(),
            interval: inner.sync_interval,
            cancel: inner.cancel.token(),
        };
        handles.push(
            std::thread::Builder::new()
                .name("synchronizer".into())
                .spawn(move || synchronizer.run())
                .expect("failed to spawn synchronizer thread"),
        );

        let evict_map = inner.inode_map.clone();
        let evict_stats = inner.stats.clone();
        let evict_cancel = inner.cancel.token();
        handles.push(
            std::thread::Builder::new()
                .name("evictor".into())
                .spawn(move || {
                    run_evictor(evict_map, evict_stats, EVICT_INTERVAL, CONN_TTL, evict_cancel)
                })
                .expect("failed to spawn evictor thread"),
        );

        let timer_inner = inner.clone();
        handles.push(
            std::thread::Builder::new()
                .name("capture-timeout".into())
                .spawn(move || {
                    let expiry = after(timer_inner.capture_timeout);
                    let cancel = timer_inner.cancel.token();
                    select! {
                        recv(cancel.channel()) -> _ => {}
                        recv(expiry) -> _ => {
                            warn!("capture timeout expired, shutting down");
                            timer_inner.cancel.cancel();
                        }
                    }
                })
                .expect("failed to spawn timeout thread"),
        );
        drop(handles);

        info!(
            "engine started: {} device(s), {} handler(s), queue {} slots",
            inner.bound_devices.len(),
            inner.handler_count,
            inner.queue_size
        );
        Ok(())
    }
}

impl EngineInner {
    fn run_teardown(&self) {
        let actions: Vec<Box<dyn FnOnce() + Send>> =
            self.teardown.lock().unwrap().drain(..).collect();
        for action in actions.into_iter().rev() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn offline_builder() -> EngineBuilder {
        // Both overrides provided: build() never touches the pcap layer.
        Engine::builder()
            .bind_ips(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))])
            .bind_devices(vec!["testdev0".into()])
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        assert!(offline_builder()
            .sync_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(Engine::builder()
            .bind_ips(vec![])
            .bind_devices(vec!["d".into()])
            .build()
            .is_err());
        assert!(Engine::builder()
            .bind_ips(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
            .bind_devices(vec![])
            .build()
            .is_err());
        assert!(offline_builder().bpf_filter("   ").build().is_err());
    }

    #[test]
    fn test_builder_clamps_queue_and_timeout() {
        let engine = offline_builder()
            .queue_size(10)
            .capture_timeout(MAX_CAPTURE_TIMEOUT * 2)
            .build()
            .unwrap();
        assert_eq!(engine.inner.queue_size, MIN_QUEUE_SIZE);
        assert_eq!(engine.inner.capture_timeout, MAX_CAPTURE_TIMEOUT);
    }

    #[test]
    fn test_rank_errors_before_start() {
        let engine = offline_builder().build().unwrap();
        assert!(engine.rank(10, 5).is_err());
    }

    #[test]
    fn test_stop_before_start_is_idempotent() {
        let engine = offline_builder().build().unwrap();
        engine.stop();
        engine.stop();
        assert!(engine.done().is_cancelled());
        // A stopped engine cannot be restarted.
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_lifecycle_start_rank_stop() {
        let engine = offline_builder()
            .sync_interval(Duration::from_millis(50))
            .queue_size(MIN_QUEUE_SIZE)
            .build()
            .unwrap();

        // The capture worker fails on the fake device and exits; everything
        // else runs.
        engine.start().unwrap();
        assert!(engine.start().is_err());

        assert!(engine.rank(5, 5).is_ok());
        assert!(engine.rank(5, 0).is_err());
        assert_eq!(engine.load_counter(), 0);

        engine.stop();
        assert!(engine.done().is_cancelled());
        engine.stop();
    }
}
