//! Bound-IP and bound-device discovery.
//!
//! Enumerated once at startup from the host's capture devices: every
//! non-multicast address on any device becomes a bound IP (the egress test),
//! and devices whose names match the prefix allowlist become capture targets.
//! Both sets are immutable afterwards.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::IpAddr;

/// Interface name prefixes captured by default. Exposed as a builder option
/// for hosts with exotic naming schemes.
pub const DEFAULT_DEVICE_PREFIXES: &[&str] =
    &["eth", "em", "enp", "eno", "ens", "ppp", "bond", "lo"];

/// Host addresses and capture devices, as discovered or overridden.
#[derive(Debug, Clone)]
pub struct HostBindings {
    pub ips: HashSet<IpAddr>,
    pub devices: Vec<String>,
}

/// Enumerate capture devices and collect (bound IPs, allowlisted devices).
pub fn discover(prefixes: &[String]) -> Result<HostBindings> {
    let devices = pcap::Device::list().context("enumerate capture devices")?;

    let mut ips = HashSet::new();
    let mut names = Vec::new();
    for dev in devices {
        for addr in &dev.addresses {
            if addr.addr.is_multicast() {
                continue;
            }
            ips.insert(addr.addr);
        }
        if matches_prefix(&dev.name, prefixes) && !names.contains(&dev.name) {
            names.push(dev.name);
        }
    }
    Ok(HostBindings { ips, devices: names })
}

fn matches_prefix(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}
