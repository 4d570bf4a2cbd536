//! Kernel TCP connection table scanner.
//!
//! Parses the `/proc/net/tcp` text table (little-endian hex IPv4 addresses,
//! big-endian hex ports, hex state codes, and the socket inode column) and
//! feeds both orientations of every connection into the inode map. Runs under
//! the synchronizer on each tick.

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::inode_map::{tuple_key, InodeMap};

const PROC_NET_TCP: &str = "/proc/net/tcp";

/// The eleven TCP states as encoded in the kernel table
/// (include/net/tcp_states.h, hex codes 01..0B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
}

impl TcpState {
    pub fn from_hex(code: &str) -> Option<Self> {
        match code {
            "01" => Some(Self::Established),
            "02" => Some(Self::SynSent),
            "03" => Some(Self::SynRecv),
            "04" => Some(Self::FinWait1),
            "05" => Some(Self::FinWait2),
            "06" => Some(Self::TimeWait),
            "07" => Some(Self::Close),
            "08" => Some(Self::CloseWait),
            "09" => Some(Self::LastAck),
            "0A" => Some(Self::Listen),
            "0B" => Some(Self::Closing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
        }
    }
}

/// One row of the connection table.
#[derive(Debug, Clone)]
pub struct ConnRow {
    pub local: Ipv4Addr,
    pub local_port: u16,
    pub remote: Ipv4Addr,
    pub remote_port: u16,
    pub state: TcpState,
    pub inode: String,
}

impl ConnRow {
    pub fn forward_key(&self) -> String {
        tuple_key(self.local, self.local_port, self.remote, self.remote_port)
    }

    pub fn reverse_key(&self) -> String {
        tuple_key(self.remote, self.remote_port, self.local, self.local_port)
    }
}

/// Decode a kernel `ADDR:PORT` pair: the address is little-endian hex, the
/// port big-endian hex (`0100007F:0050` → 127.0.0.1:80).
fn parse_hex_addr(field: &str) -> Option<(Ipv4Addr, u16)> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    if addr_hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(addr_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((Ipv4Addr::from(raw.swap_bytes()), port))
}

/// Parse one table row. Returns None for the header, malformed lines, and
/// rows without a socket inode.
fn parse_row(line: &str) -> Option<ConnRow> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let (local, local_port) = parse_hex_addr(fields[1])?;
    let (remote, remote_port) = parse_hex_addr(fields[2])?;
    let state = TcpState::from_hex(fields[3])?;
    let inode = fields[9];
    if inode == "0" || inode.parse::<u64>().is_err() {
        return None;
    }

    Some(ConnRow {
        local,
        local_port,
        remote,
        remote_port,
        state,
        inode: inode.to_string(),
    })
}

pub fn parse_table(text: &str) -> Vec<ConnRow> {
    text.lines().filter_map(parse_row).collect()
}

pub struct ConnScanner {
    table_path: PathBuf,
}

impl ConnScanner {
    pub fn new() -> Self {
        Self {
            table_path: PathBuf::from(PROC_NET_TCP),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn with_path(table_path: &Path) -> Self {
        Self {
            table_path: table_path.to_path_buf(),
        }
    }

    /// Rescan the table into `map`. Returns the number of rows seen; a read
    /// failure bubbles up for the synchronizer to log and retry next tick.
    pub fn scan(&self, map: &InodeMap) -> Result<usize> {
        let text = std::fs::read_to_string(&self.table_path)
            .with_context(|| format!("read {}", self.table_path.display()))?;

        let rows = parse_table(&text);
        for row in &rows {
            let fwd = row.forward_key();
            if !map.exists(&fwd, &row.inode) {
                map.insert(&fwd, &row.inode);
            }
            let rev = row.reverse_key();
            if !map.exists(&rev, &row.inode) {
                map.insert(&rev, &row.inode);
            }
        }
        Ok(rows.len())
    }
}

impl Default for ConnScanner {
    fn default() -> Self {
        Self::new()
    }
}
