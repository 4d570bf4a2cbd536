//! Optional cgroup limits on the engine's own process.
//!
//! Attribution competes with the workloads it measures, so the engine can cap
//! itself: CPU in fractional cores, memory in MB. Supports the unified v2
//! hierarchy (`cpu.max` / `memory.max`) with a legacy v1 fallback
//! (`cpu.cfs_quota_us` / `memory.limit_in_bytes`). Release moves the pid back
//! to the root group and removes the directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const GROUP_NAME: &str = "flow-attrib";

/// CPU period used to express fractional-core quotas, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgroupLimits {
    /// Whole or fractional CPU cores; 0 disables the CPU cap.
    pub cpu_cores: f64,
    /// Memory ceiling in megabytes; 0 disables the memory cap.
    pub memory_mb: u64,
}

pub(crate) struct CgroupLimiter {
    dirs: Vec<PathBuf>,
    root: PathBuf,
}

fn cpu_quota_us(cpu_cores: f64) -> u64 {
    (cpu_cores * CPU_PERIOD_US as f64) as u64
}

impl CgroupLimiter {
    /// Apply `limits` to `pid`. Errors here abort engine start.
    pub fn apply(pid: u32, limits: &CgroupLimits) -> Result<Self> {
        let root = PathBuf::from(CGROUP_ROOT);
        if root.join("cgroup.controllers").exists() {
            Self::apply_v2(&root, pid, limits)
        } else {
            Self::apply_v1(&root, pid, limits)
        }
    }

    fn apply_v2(root: &Path, pid: u32, limits: &CgroupLimits) -> Result<Self> {
        let dir = root.join(GROUP_NAME);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        if limits.cpu_cores > 0.0 {
            write_limit(
                &dir.join("cpu.max"),
                &format!("{} {}", cpu_quota_us(limits.cpu_cores), CPU_PERIOD_US),
            )?;
        }
        if limits.memory_mb > 0 {
            write_limit(
                &dir.join("memory.max"),
                &(limits.memory_mb * 1024 * 1024).to_string(),
            )?;
        }
        write_limit(&dir.join("cgroup.procs"), &pid.to_string())?;

        info!(
            "cgroup v2 limits applied: {} cores, {} MB",
            limits.cpu_cores, limits.memory_mb
        );
        Ok(Self {
            dirs: vec![dir],
            root: root.to_path_buf(),
        })
    }

    fn apply_v1(root: &Path, pid: u32, limits: &CgroupLimits) -> Result<Self> {
        let mut dirs = Vec::new();

        if limits.cpu_cores > 0.0 {
            let dir = root.join("cpu").join(GROUP_NAME);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            write_limit(&dir.join("cpu.cfs_period_us"), &CPU_PERIOD_US.to_string())?;
            write_limit(
                &dir.join("cpu.cfs_quota_us"),
                &cpu_quota_us(limits.cpu_cores).to_string(),
            )?;
            write_limit(&dir.join("cgroup.procs"), &pid.to_string())?;
            dirs.push(dir);
        }
        if limits.memory_mb > 0 {
            let dir = root.join("memory").join(GROUP_NAME);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            write_limit(
                &dir.join("memory.limit_in_bytes"),
                &(limits.memory_mb * 1024 * 1024).to_string(),
            )?;
            write_limit(&dir.join("cgroup.procs"), &pid.to_string())?;
            dirs.push(dir);
        }

        info!(
            "cgroup v1 limits applied: {} cores, {} MB",
            limits.cpu_cores, limits.memory_mb
        );
        Ok(Self {
            dirs,
            root: root.to_path_buf(),
        })
    }

    /// Best-effort teardown: re-home the process, then remove the groups.
    pub fn release(self, pid: u32) {
        for dir in &self.dirs {
            // The parent of our group is the hierarchy we came from.
            let parent = dir.parent().unwrap_or(&self.root);
            if let Err(e) = fs::write(parent.join("cgroup.procs"), pid.to_string()) {
                warn!("cgroup release: move pid out of {} failed: {}", dir.display(), e);
            }
            if let Err(e) = fs::remove_dir(dir) {
                warn!("cgroup release: remove {} failed: {}", dir.display(), e);
            }
        }
    }
}

fn write_limit(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("write {} to {}", value, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quota_from_fractional_cores() {
        assert_eq!(cpu_quota_us(1.0), 100_000);
        assert_eq!(cpu_quota_us(0.5), 50_000);
        assert_eq!(cpu_quota_us(2.5), 250_000);
    }
}
