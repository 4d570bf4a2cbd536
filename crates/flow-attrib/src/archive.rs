//! Optional pcap archiving of every captured frame.
//!
//! Capture workers `try_send` frames onto a bounded channel; a single writer
//! thread owns the file so the hot path never touches disk. The writer exits
//! when the engine drops the last sender, flushing via the `BufWriter` drop.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot length advertised in the file header.
const ARCHIVE_SNAPLEN: u32 = 102_400;

/// One frame bound for the archive file.
pub(crate) struct ArchiveEvent {
    pub ts: Duration,
    pub orig_len: u32,
    pub data: Vec<u8>,
}

impl ArchiveEvent {
    pub fn from_pcap(pkt: &pcap::Packet<'_>) -> Self {
        Self {
            ts: Duration::new(
                pkt.header.ts.tv_sec.max(0) as u64,
                (pkt.header.ts.tv_usec.max(0) as u32) * 1000,
            ),
            orig_len: pkt.header.len,
            data: pkt.data.to_vec(),
        }
    }
}

fn archive_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: ARCHIVE_SNAPLEN,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::MicroSecond,
        endianness: Endianness::native(),
    }
}

/// Open the archive file and spawn its writer thread. Open failures surface
/// to the caller; write failures are logged and skipped.
pub(crate) fn spawn_archive_writer(
    path: &Path,
    rx: Receiver<ArchiveEvent>,
) -> Result<JoinHandle<()>> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = PcapWriter::with_header(BufWriter::new(file), archive_header())
        .map_err(|e| anyhow::anyhow!("write pcap header: {}", e))?;
    info!("archiving packets to {}", path.display());

    let handle = std::thread::Builder::new()
        .name("pcap-archive".into())
        .spawn(move || {
            for event in &rx {
                let pkt = PcapPacket::new(event.ts, event.orig_len, &event.data);
                if let Err(e) = writer.write_packet(&pkt) {
                    warn!("archive write error: {}", e);
                }
            }
        })
        .expect("failed to spawn archive thread");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_archive_writes_header_and_packets() {
        let path = std::env::temp_dir().join(format!("flow-attrib-arc-{}.pcap", std::process::id()));
        let (tx, rx) = bounded(4);
        let handle = spawn_archive_writer(&path, rx).unwrap();

        tx.send(ArchiveEvent {
            ts: Duration::new(1_700_000_000, 0),
            orig_len: 64,
            data: vec![0u8; 64],
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();

        // 24-byte global header + 16-byte record header + 64 bytes of frame.
        let written = std::fs::metadata(&path).unwrap().len();
        assert_eq!(written, 24 + 16 + 64);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_archive_open_failure_surfaces() {
        let (_tx, rx) = bounded(1);
        assert!(spawn_archive_writer(Path::new("/nonexistent/dir/x.pcap"), rx).is_err());
    }
}
