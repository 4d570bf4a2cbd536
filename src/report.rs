//! Aggregate bandwidth reporting to a remote collector.
//!
//! Read-only with respect to the engine: sums the ranked rates and POSTs a
//! JSON sample on the display cadence. Requests are signed with
//! `sha256(secret#timestamp)` headers and shipped through `curl` to avoid
//! pulling a TLS stack into the binary. Failures are the caller's to log;
//! reporting never interferes with capture.

use anyhow::{bail, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ReportConfig;

const REPORT_PATH: &str = "/api/common/v1/traffic/monitor";

#[derive(Debug, Serialize, PartialEq)]
pub struct MonitorSample {
    /// Ingress bandwidth in Mbit/s.
    #[serde(rename = "downBandwidth")]
    pub down_bandwidth: f64,
    /// Egress bandwidth in Mbit/s.
    #[serde(rename = "upBandwidth")]
    pub up_bandwidth: f64,
    /// Sample time, aligned to the minute.
    pub timestamp: u64,
}

pub struct Reporter {
    config: ReportConfig,
}

pub fn to_mbit(bytes_per_sec: u64) -> f64 {
    bytes_per_sec as f64 * 8.0 / 1_000_000.0
}

fn minute_aligned(timestamp: u64) -> u64 {
    timestamp / 60 * 60
}

fn sign(secret: &str, timestamp: u64) -> String {
    let digest = Sha256::digest(format!("{}#{}", secret, timestamp).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Reporter {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    /// POST one sample of the current in/out rates (bytes/s).
    pub fn report(&self, in_rate: u64, out_rate: u64) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sample = MonitorSample {
            down_bandwidth: to_mbit(in_rate),
            up_bandwidth: to_mbit(out_rate),
            timestamp: minute_aligned(now),
        };
        let body = serde_json::to_string(&serde_json::json!({ "data": [sample] }))?;
        self.post(&body, now)
    }

    fn post(&self, body: &str, timestamp: u64) -> Result<()> {
        let url = format!(
            "{}{}",
            self.config.endpoint.trim_end_matches('/'),
            REPORT_PATH
        );
        let output = std::process::Command::new("curl")
            .args([
                "-sf",
                "--max-time",
                "10",
                "-X",
                "POST",
                "-H",
                "Content-Type: application/json",
                "-H",
                &format!("ak: {}", self.config.app_key),
                "-H",
                &format!("deviceId: {}", self.config.device_id),
                "-H",
                &format!("bizType: {}", self.config.biz_type),
                "-H",
                &format!("timestamp: {}", timestamp),
                "-H",
                &format!("sign: {}", sign(&self.config.app_secret, timestamp)),
                "--data",
                body,
                &url,
            ])
            .output()?;

        if !output.status.success() {
            bail!(
                "report to {} failed: {}",
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_alignment() {
        assert_eq!(minute_aligned(1_700_000_059), 1_700_000_040);
        assert_eq!(minute_aligned(1_700_000_040), 1_700_000_040);
    }

    #[test]
    fn test_sign_is_deterministic_hex() {
        let a = sign("secret", 1_700_000_000);
        let b = sign("secret", 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        // Different inputs, different signatures.
        assert_ne!(a, sign("secret", 1_700_000_001));
        assert_ne!(a, sign("other", 1_700_000_000));
    }

    #[test]
    fn test_to_mbit() {
        assert_eq!(to_mbit(125_000), 1.0);
        assert_eq!(to_mbit(0), 0.0);
    }

    #[test]
    fn test_sample_json_shape() {
        let sample = MonitorSample {
            down_bandwidth: 1.5,
            up_bandwidth: 0.25,
            timestamp: 1_700_000_040,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["downBandwidth"], 1.5);
        assert_eq!(json["upBandwidth"], 0.25);
        assert_eq!(json["timestamp"], 1_700_000_040);
    }
}
