//! Tuple-key → socket-inode map.
//!
//! Keys are the canonical `srcIP:srcPort_dstIP:dstPort` strings; the
//! connection scanner inserts both orientations of every row so packets match
//! regardless of direction. Entries carry an insertion timestamp and are
//! swept on a slow cadence: a reused local port must not resolve to the
//! inode of a connection that is long gone.

use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Canonical key for one direction of a TCP flow.
pub fn tuple_key(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> String {
    format!("{}:{}_{}:{}", src, src_port, dst, dst_port)
}

struct InodeEntry {
    inode: String,
    seen: Instant,
}

pub struct InodeMap {
    entries: DashMap<String, InodeEntry>,
}

impl InodeMap {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record `key → inode`, overwriting any prior value and refreshing the
    /// entry timestamp.
    pub fn insert(&self, key: &str, inode: &str) {
        self.entries.insert(
            key.to_string(),
            InodeEntry {
                inode: inode.to_string(),
                seen: Instant::now(),
            },
        );
    }

    /// True iff the stored value for `key` equals `inode`. Used by the
    /// scanner to skip redundant writes on unchanged rows.
    pub fn exists(&self, key: &str, inode: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.inode == inode)
            .unwrap_or(false)
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.inode.clone())
    }

    /// Remove entries inserted before `older_than`. Returns how many were
    /// removed. An insert racing the sweep simply lands after it.
    pub fn evict(&self, older_than: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.seen >= older_than);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diagnostic dump of every `(key, inode)` pair.
    pub fn dump(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.inode.clone()))
            .collect()
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_insert_lookup_overwrite() {
        let map = InodeMap::new();
        map.insert("10.0.0.2:44000_1.2.3.4:443", "555");
        assert_eq!(
            map.lookup("10.0.0.2:44000_1.2.3.4:443"),
            Some("555".to_string())
        );

        // A reused port gets a new inode; the latest insert wins.
        map.insert("10.0.0.2:44000_1.2.3.4:443", "777");
        assert_eq!(
            map.lookup("10.0.0.2:44000_1.2.3.4:443"),
            Some("777".to_string())
        );
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_exists_matches_value() {
        let map = InodeMap::new();
        map.insert("a", "1");
        assert!(map.exists("a", "1"));
        assert!(!map.exists("a", "2"));
        assert!(!map.exists("b", "1"));
    }

    #[test]
    fn test_double_insert_is_idempotent() {
        let map = InodeMap::new();
        map.insert("a", "1");
        map.insert("a", "1");
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup("a"), Some("1".to_string()));
    }

    #[test]
    fn test_bidirectional_keys_resolve() {
        let map = InodeMap::new();
        let fwd = tuple_key(Ipv4Addr::new(10, 0, 0, 2), 44000, Ipv4Addr::new(1, 2, 3, 4), 443);
        let rev = tuple_key(Ipv4Addr::new(1, 2, 3, 4), 443, Ipv4Addr::new(10, 0, 0, 2), 44000);
        map.insert(&fwd, "555");
        map.insert(&rev, "555");
        assert_eq!(map.lookup(&fwd).as_deref(), Some("555"));
        assert_eq!(map.lookup(&rev).as_deref(), Some("555"));
    }

    #[test]
    fn test_evict_removes_only_older_entries() {
        let map = InodeMap::new();
        map.insert("old", "1");
        std::thread::sleep(Duration::from_millis(5));
        let cutoff = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        map.insert("new", "2");

        let removed = map.evict(cutoff);
        assert_eq!(removed, 1);
        assert_eq!(map.lookup("old"), None);
        assert_eq!(map.lookup("new"), Some("2".to_string()));
    }

    #[test]
    fn test_evicted_key_can_be_reinserted() {
        let map = InodeMap::new();
        map.insert("k", "1");
        map.evict(Instant::now() + Duration::from_secs(1));
        assert!(map.is_empty());
        map.insert("k", "9");
        assert_eq!(map.lookup("k"), Some("9".to_string()));
    }

    #[test]
    fn test_tuple_key_format() {
        let key = tuple_key(Ipv4Addr::new(127, 0, 0, 1), 80, Ipv4Addr::new(8, 8, 8, 8), 53);
        assert_eq!(key, "127.0.0.1:80_8.8.8.8:53");
    }

    #[test]
    fn test_dump_lists_all_pairs() {
        let map = InodeMap::new();
        map.insert("a", "1");
        map.insert("b", "2");
        let mut dump = map.dump();
        dump.sort();
        assert_eq!(
            dump,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }
}
