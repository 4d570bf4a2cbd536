//! Per-process TCP traffic attribution.
//!
//! Couples live packet capture with the kernel's socket-inode table and
//! per-process file-descriptor listings: each captured segment is mapped
//! four-tuple → inode → process and credited to that process's counters.
//! Packets that outrun the scanners wait on a bounded delay queue and are
//! replayed after the next rescan. [`Engine::rank`] answers "who is moving
//! bytes right now" over a caller-chosen window of recent seconds.

pub mod archive;
pub mod cancel;
pub mod capture;
pub mod cgroup;
pub mod conn_scan;
pub mod engine;
pub mod handler;
pub mod iface;
pub mod inode_map;
pub mod proc_scan;
pub mod registry;
pub mod stats;
pub mod sync;

pub use cancel::CancelToken;
pub use cgroup::CgroupLimits;
pub use conn_scan::TcpState;
pub use engine::{
    Engine, EngineBuilder, DEFAULT_QUEUE_SIZE, DEFAULT_SYNC_INTERVAL, MAX_CAPTURE_TIMEOUT,
    MIN_QUEUE_SIZE,
};
pub use handler::Accounting;
pub use iface::{discover, HostBindings, DEFAULT_DEVICE_PREFIXES};
pub use registry::{Direction, NameFilter, ProcessSnapshot, MAX_RING_SECONDS};
pub use stats::{EngineStats, EngineStatsSnapshot};
