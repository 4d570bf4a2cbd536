//! Packet handler workers and the attribution path.
//!
//! Handlers drain the packet queue, parse IPv4 + TCP out of each frame,
//! classify direction by bound-IP membership of the source address, and
//! credit the owning process. Segment length comes from the header fields
//! rather than the raw frame, so link-layer framing is excluded.
//!
//! A packet can legitimately arrive before the scanners have seen its socket;
//! those events go to the bounded delay queue and are replayed after the next
//! rescan instead of being lost.

use crossbeam_channel::{select, Receiver, Sender};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::capture::CapturedPacket;
use crate::cancel::CancelToken;
use crate::inode_map::{tuple_key, InodeMap};
use crate::registry::{Direction, ProcessRegistry};
use crate::stats::EngineStats;

/// How many rescan cycles a delayed event may fail attribution before it is
/// discarded.
pub(crate) const MAX_DELAY_RETRIES: u32 = 3;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;

/// What counts toward a process's byte totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    /// IP header + TCP header + payload (the default).
    HeadersAndPayload,
    /// TCP payload bytes only.
    PayloadOnly,
}

// ---------------------------------------------------------------------------
// Segment parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParsedSegment {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub ip_header_len: usize,
    pub tcp_header_len: usize,
    pub payload_len: usize,
}

impl ParsedSegment {
    pub fn key(&self) -> String {
        tuple_key(self.src, self.src_port, self.dst, self.dst_port)
    }

    pub fn accounted_len(&self, mode: Accounting) -> u64 {
        match mode {
            Accounting::HeadersAndPayload => {
                (self.ip_header_len + self.tcp_header_len + self.payload_len) as u64
            }
            Accounting::PayloadOnly => self.payload_len as u64,
        }
    }
}

/// Parse an IPv4 TCP segment out of a captured frame. `link_offset` is where
/// the network layer starts for the capture's datalink. Anything that is not
/// well-formed IPv4 + TCP yields None.
pub fn parse_segment(frame: &[u8], link_offset: usize) -> Option<ParsedSegment> {
    if link_offset == 14 {
        // Ethernet: check the ethertype before trusting the payload.
        if frame.len() < 14 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
            return None;
        }
    }
    let ip = frame.get(link_offset..)?;
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ip_header_len = ((ip[0] & 0x0F) as usize) * 4;
    if ip_header_len < 20 || ip.len() < ip_header_len {
        return None;
    }
    if ip[9] != IPPROTO_TCP {
        return None;
    }
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;

    let tcp = ip.get(ip_header_len..)?;
    if tcp.len() < 20 {
        return None;
    }
    let tcp_header_len = ((tcp[12] >> 4) as usize) * 4;
    if tcp_header_len < 20 || total_len < ip_header_len + tcp_header_len {
        return None;
    }

    Some(ParsedSegment {
        src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        ip_header_len,
        tcp_header_len,
        // From the IP total length, not the frame: the capture may have
        // truncated the payload.
        payload_len: total_len - ip_header_len - tcp_header_len,
    })
}

/// Egress iff the source address belongs to this host.
pub fn classify(src: Ipv4Addr, bound_ips: &HashSet<IpAddr>) -> Direction {
    if bound_ips.contains(&IpAddr::V4(src)) {
        Direction::Egress
    } else {
        Direction::Ingress
    }
}

// ---------------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------------

/// A segment whose inode-or-process mapping was unknown at arrival, parked
/// until after the next rescan.
pub(crate) struct DelayEntry {
    pub created: Instant,
    pub retries: u32,
    pub key: String,
    pub length: u64,
    pub direction: Direction,
}

/// Shared attribution path: handler workers call [`credit_or_delay`], the
/// synchronizer calls [`replay`] when draining the delay queue.
pub(crate) struct Attributor {
    pub inode_map: Arc<InodeMap>,
    pub registry: Arc<ProcessRegistry>,
    pub delay_tx: Sender<DelayEntry>,
    pub stats: Arc<EngineStats>,
}

impl Attributor {
    /// Credit the owning process, or false if either lookup missed.
    fn try_credit(&self, key: &str, length: u64, direction: Direction) -> bool {
        let Some(inode) = self.inode_map.lookup(key) else {
            return false;
        };
        let Some(record) = self.registry.lookup_by_inode(&inode) else {
            return false;
        };
        record.add_traffic(length, direction);
        true
    }

    pub fn credit_or_delay(&self, key: String, length: u64, direction: Direction) {
        if self.try_credit(&key, length, direction) {
            return;
        }
        self.push_delay(DelayEntry {
            created: Instant::now(),
            retries: 0,
            key,
            length,
            direction,
        });
    }

    /// Replay a drained delay entry. Still-unresolvable entries go back on
    /// the queue with a fresh timestamp until the retry cap discards them.
    pub fn replay(&self, entry: DelayEntry) {
        if self.try_credit(&entry.key, entry.length, entry.direction) {
            self.stats.delay_replayed.fetch_add(1, Relaxed);
            return;
        }
        if entry.retries + 1 >= MAX_DELAY_RETRIES {
            self.stats.delay_expired.fetch_add(1, Relaxed);
            debug!("delay entry for {} expired after {} retries", entry.key, entry.retries + 1);
            return;
        }
        self.push_delay(DelayEntry {
            created: Instant::now(),
            retries: entry.retries + 1,
            ..entry
        });
    }

    fn push_delay(&self, entry: DelayEntry) {
        if self.delay_tx.try_send(entry).is_ok() {
            self.stats.delay_enqueued.fetch_add(1, Relaxed);
        } else {
            self.stats.delay_dropped.fetch_add(1, Relaxed);
            debug!("delay queue full, dropping event");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

pub(crate) fn run_handler(
    packet_rx: Receiver<CapturedPacket>,
    bound_ips: Arc<HashSet<IpAddr>>,
    accounting: Accounting,
    attributor: Arc<Attributor>,
    cancel: CancelToken,
) {
    loop {
        let packet = select! {
            recv(cancel.channel()) -> _ => return,
            recv(packet_rx) -> pkt => match pkt {
                Ok(pkt) => pkt,
                Err(_) => return,
            },
        };

        let Some(segment) = parse_segment(&packet.data, packet.link_offset) else {
            attributor.stats.parse_skipped.fetch_add(1, Relaxed);
            continue;
        };
        let direction = classify(segment.src, &bound_ips);
        attributor.stats.packets_handled.fetch_add(1, Relaxed);
        attributor.credit_or_delay(
            segment.key(),
            segment.accounted_len(accounting),
            direction,
        );
    }
}
