//! Process tree scanner.
//!
//! Walks `/proc/<pid>/` collecting the process name (`comm`), executable path
//! (`exe`), and the socket inodes behind its open file descriptors
//! (`fd/* → socket:[N]`). Processes exit mid-walk all the time; per-process
//! failures are skipped, never fatal.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::registry::{NameFilter, ProcSnapshot};

const PROC_ROOT: &str = "/proc";

/// Extract the inode from a descriptor link target of the form `socket:[N]`.
fn parse_socket_inode(target: &Path) -> Option<String> {
    let link = target.to_string_lossy();
    let inner = link.strip_prefix("socket:[")?.strip_suffix(']')?;
    if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(inner.to_string())
}

pub struct ProcessScanner {
    proc_root: PathBuf,
    filter: Option<NameFilter>,
}

impl ProcessScanner {
    pub fn new(filter: Option<NameFilter>) -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
            filter,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn with_root(proc_root: &Path, filter: Option<NameFilter>) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
            filter,
        }
    }

    /// Snapshot every live process that passes the name filter and holds at
    /// least one socket. Only a failure to list the process root is an error.
    pub fn scan(&self) -> Result<Vec<ProcSnapshot>> {
        let entries = std::fs::read_dir(&self.proc_root)
            .with_context(|| format!("read {}", self.proc_root.display()))?;

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = name.parse::<i32>() else {
                continue;
            };
            if let Some(snap) = self.scan_pid(pid, &entry.path()) {
                snapshots.push(snap);
            }
        }
        Ok(snapshots)
    }

    fn scan_pid(&self, pid: i32, dir: &Path) -> Option<ProcSnapshot> {
        let name = std::fs::read_to_string(dir.join("comm"))
            .ok()?
            .trim()
            .to_string();
        if let Some(filter) = &self.filter {
            if !filter(&name) {
                return None;
            }
        }

        // Unreadable without ptrace rights on foreign processes; not worth
        // skipping the whole record over.
        let exe = std::fs::read_link(dir.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "-".to_string());

        let fds = std::fs::read_dir(dir.join("fd")).ok()?;
        let mut inodes = HashSet::new();
        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if let Some(inode) = parse_socket_inode(&target) {
                    inodes.insert(inode);
                }
            }
        }
        if inodes.is_empty() {
            return None;
        }

        Some(ProcSnapshot {
            pid,
            name,
            exe,
            inodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::sync::Arc;

    #[test]
    fn test_parse_socket_inode() {
        assert_eq!(
            parse_socket_inode(Path::new("socket:[35541]")),
            Some("35541".to_string())
        );
        assert_eq!(parse_socket_inode(Path::new("pipe:[35541]")), None);
        assert_eq!(parse_socket_inode(Path::new("/dev/null")), None);
        assert_eq!(parse_socket_inode(Path::new("socket:[]")), None);
        assert_eq!(parse_socket_inode(Path::new("socket:[12x]")), None);
    }

    /// Fabricate a /proc-shaped tree: numeric pid dirs with comm, exe, and
    /// fd symlinks whose targets mimic the kernel's `socket:[N]` form.
    fn fake_proc(root: &Path, pid: i32, comm: &str, sockets: &[&str], extra_fd: bool) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(dir.join("fd")).unwrap();
        std::fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        symlink(format!("/usr/bin/{}", comm), dir.join("exe")).unwrap();
        for (i, inode) in sockets.iter().enumerate() {
            symlink(format!("socket:[{}]", inode), dir.join("fd").join(i.to_string())).unwrap();
        }
        if extra_fd {
            symlink("/dev/null", dir.join("fd").join("99")).unwrap();
        }
    }

    #[test]
    fn test_scan_fake_proc_tree() {
        let root =
            std::env::temp_dir().join(format!("flow-attrib-proc-{}", std::process::id()));
        std::fs::remove_dir_all(&root).ok();
        fake_proc(&root, 100, "curl", &["555", "556"], true);
        fake_proc(&root, 200, "sshd", &["700"], false);
        // Not a pid directory; must be ignored.
        std::fs::create_dir_all(root.join("sys")).unwrap();
        // A process with no sockets contributes nothing.
        fake_proc(&root, 300, "cat", &[], false);

        let scanner = ProcessScanner::with_root(&root, None);
        let mut snaps = scanner.scan().unwrap();
        snaps.sort_by_key(|s| s.pid);

        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].pid, 100);
        assert_eq!(snaps[0].name, "curl");
        assert_eq!(snaps[0].exe, "/usr/bin/curl");
        let mut inodes: Vec<_> = snaps[0].inodes.iter().cloned().collect();
        inodes.sort();
        assert_eq!(inodes, vec!["555", "556"]);
        assert_eq!(snaps[1].pid, 200);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_scan_applies_name_filter() {
        let root =
            std::env::temp_dir().join(format!("flow-attrib-procf-{}", std::process::id()));
        std::fs::remove_dir_all(&root).ok();
        fake_proc(&root, 100, "curl", &["555"], false);
        fake_proc(&root, 200, "sshd", &["700"], false);

        let filter: NameFilter = Arc::new(|name: &str| name.starts_with("cur"));
        let scanner = ProcessScanner::with_root(&root, Some(filter));
        let snaps = scanner.scan().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "curl");

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_scan_missing_root_errors() {
        let scanner = ProcessScanner::with_root(Path::new("/nonexistent/flow-attrib"), None);
        assert!(scanner.scan().is_err());
    }
}
