//! `flowtop.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration. Every section has working defaults; a missing
/// file behaves like an empty one.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowtopConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    /// Push aggregate bandwidth to a collection endpoint. Omit to disable.
    #[serde(default)]
    pub report: Option<ReportConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Only track processes whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Capture devices. Omit to discover from the prefix allowlist.
    pub devices: Option<Vec<String>>,
    /// Host IPs for direction classification. Omit to discover.
    pub ips: Option<Vec<String>>,
    /// Interface name prefixes considered during discovery.
    pub device_prefixes: Option<Vec<String>>,
    /// Packet and delay queue capacity.
    #[serde(default = "EngineConfig::default_queue_size")]
    pub queue_size: usize,
    /// Packet handler worker count.
    #[serde(default = "EngineConfig::default_handlers")]
    pub handlers: usize,
    /// Rescan cadence for the socket table and process tree.
    #[serde(default = "EngineConfig::default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Stop capturing after this long. Omit for the built-in maximum.
    pub capture_timeout_secs: Option<u64>,
    /// Replace the default BPF program (`tcp and (not broadcast and not
    /// multicast)`).
    pub bpf_filter: Option<String>,
    /// Also write captured frames to this pcap file.
    pub pcap_archive: Option<String>,
    /// Count TCP payload bytes only, instead of headers + payload.
    #[serde(default)]
    pub payload_only: bool,
    /// Cap the engine's own CPU use (fractional cores).
    pub cgroup_cpu_cores: Option<f64>,
    /// Cap the engine's own memory (MB).
    pub cgroup_memory_mb: Option<u64>,
}

impl EngineConfig {
    fn default_queue_size() -> usize {
        flow_attrib::DEFAULT_QUEUE_SIZE
    }
    fn default_handlers() -> usize {
        1
    }
    fn default_sync_interval_ms() -> u64 {
        1_000
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name_prefix: None,
            devices: None,
            ips: None,
            device_prefixes: None,
            queue_size: Self::default_queue_size(),
            handlers: Self::default_handlers(),
            sync_interval_ms: Self::default_sync_interval_ms(),
            capture_timeout_secs: None,
            bpf_filter: None,
            pcap_archive: None,
            payload_only: false,
            cgroup_cpu_cores: None,
            cgroup_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    /// Seconds between table redraws.
    #[serde(default = "DisplayConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Rows shown.
    #[serde(default = "DisplayConfig::default_limit")]
    pub limit: usize,
    /// Rate window in seconds (at most the ring capacity).
    #[serde(default = "DisplayConfig::default_window_secs")]
    pub window_secs: usize,
}

impl DisplayConfig {
    fn default_interval_secs() -> u64 {
        10
    }
    fn default_limit() -> usize {
        10
    }
    fn default_window_secs() -> usize {
        5
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            limit: Self::default_limit(),
            window_secs: Self::default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// e.g. "https://collector.example.com"
    pub endpoint: String,
    pub device_id: String,
    #[serde(default)]
    pub biz_type: String,
    pub app_key: String,
    pub app_secret: String,
}

impl FlowtopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A commented starting point for `flowtop init`.
    pub fn default_example() -> Self {
        Self {
            engine: EngineConfig {
                name_prefix: None,
                devices: Some(vec!["eth0".into()]),
                ips: None,
                device_prefixes: None,
                queue_size: flow_attrib::DEFAULT_QUEUE_SIZE,
                handlers: 1,
                sync_interval_ms: 1_000,
                capture_timeout_secs: None,
                bpf_filter: None,
                pcap_archive: None,
                payload_only: false,
                cgroup_cpu_cores: None,
                cgroup_memory_mb: None,
            },
            display: DisplayConfig::default(),
            report: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: FlowtopConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.engine.queue_size, flow_attrib::DEFAULT_QUEUE_SIZE);
        assert_eq!(cfg.engine.handlers, 1);
        assert_eq!(cfg.engine.sync_interval_ms, 1_000);
        assert_eq!(cfg.display.interval_secs, 10);
        assert_eq!(cfg.display.window_secs, 5);
        assert!(cfg.report.is_none());
        assert!(!cfg.engine.payload_only);
    }

    #[test]
    fn test_partial_config_overrides() {
        let cfg: FlowtopConfig = toml::from_str(
            r#"
            [engine]
            name_prefix = "nginx"
            devices = ["eth0", "eth1"]
            queue_size = 5000
            payload_only = true

            [display]
            limit = 3

            [report]
            endpoint = "https://collector.example.com"
            device_id = "dev-1"
            app_key = "k"
            app_secret = "s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.name_prefix.as_deref(), Some("nginx"));
        assert_eq!(cfg.engine.devices.as_ref().unwrap().len(), 2);
        assert_eq!(cfg.engine.queue_size, 5000);
        assert!(cfg.engine.payload_only);
        assert_eq!(cfg.display.limit, 3);
        assert_eq!(cfg.display.window_secs, 5);
        assert_eq!(cfg.report.unwrap().device_id, "dev-1");
    }

    #[test]
    fn test_default_example_round_trips() {
        let text = toml::to_string_pretty(&FlowtopConfig::default_example()).unwrap();
        let parsed: FlowtopConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine.devices.as_ref().unwrap()[0], "eth0");
    }
}
