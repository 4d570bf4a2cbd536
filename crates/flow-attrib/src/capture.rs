//! Per-device live capture workers.
//!
//! Each bound device gets its own thread with an independent error boundary:
//! an open or read failure kills that worker and nothing else. Captured
//! frames are `try_send`-enqueued onto the shared bounded packet queue; the
//! hot path never blocks, and overflow is dropped and counted.

use crossbeam_channel::Sender;
use pcap::{Active, Capture, Linktype};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::archive::ArchiveEvent;
use crate::cancel::CancelToken;
use crate::stats::EngineStats;

/// Default BPF program; TCP only, broadcast/multicast noise excluded.
pub const DEFAULT_BPF_FILTER: &str = "tcp and (not broadcast and not multicast)";

/// Generous snapshot length. Attribution only reads IP + TCP headers, but the
/// optional archive stores whole frames.
const SNAPLEN: i32 = 65535;

/// Read timeout so a quiet device still observes cancellation promptly.
const READ_TIMEOUT_MS: i32 = 250;

/// One frame off the wire, with the offset of the IP header for the handle's
/// link type.
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub link_offset: usize,
}

/// Byte offset of the network layer for a pcap datalink.
fn link_offset(link: Linktype) -> usize {
    match link {
        Linktype::ETHERNET => 14,
        Linktype::LINUX_SLL => 16,
        Linktype::RAW | Linktype::IPV4 => 0,
        Linktype::NULL | Linktype::LOOP => 4,
        other => {
            warn!("unknown datalink {:?}; assuming ethernet framing", other);
            14
        }
    }
}

fn open_device(device: &str, filter: &str) -> anyhow::Result<Capture<Active>> {
    let mut cap = Capture::from_device(device)?
        .promisc(false)
        .snaplen(SNAPLEN)
        .immediate_mode(true)
        .timeout(READ_TIMEOUT_MS)
        .open()?;
    cap.filter(filter, true)?;
    Ok(cap)
}

/// Spawn the capture worker for one device.
pub(crate) fn spawn_capture_worker(
    device: String,
    filter: String,
    packet_tx: Sender<CapturedPacket>,
    archive_tx: Option<Sender<ArchiveEvent>>,
    stats: Arc<EngineStats>,
    cancel: CancelToken,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("capture-{}", device))
        .spawn(move || {
            let mut cap = match open_device(&device, &filter) {
                Ok(cap) => cap,
                Err(e) => {
                    warn!("capture open failed on {}: {}", device, e);
                    return;
                }
            };
            let offset = link_offset(cap.get_datalink());
            info!("capturing on {} (filter: {})", device, filter);

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match cap.next_packet() {
                    Ok(pkt) => {
                        if let Some(ref tx) = archive_tx {
                            let _ = tx.try_send(ArchiveEvent::from_pcap(&pkt));
                        }
                        let captured = CapturedPacket {
                            data: pkt.data.to_vec(),
                            link_offset: offset,
                        };
                        if packet_tx.try_send(captured).is_ok() {
                            stats.packets_enqueued.fetch_add(1, Relaxed);
                        } else {
                            stats.packets_dropped.fetch_add(1, Relaxed);
                            debug!("packet queue full, dropping frame from {}", device);
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!("capture on {} stopped: {}", device, e);
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_link_offsets() {
        assert_eq!(link_offset(Linktype::ETHERNET), 14);
        assert_eq!(link_offset(Linktype::LINUX_SLL), 16);
        assert_eq!(link_offset(Linktype::RAW), 0);
        assert_eq!(link_offset(Linktype::NULL), 4);
    }

    #[test]
    fn test_queue_overflow_drops_without_blocking() {
        // Queue sized 2, 10 producers' worth of frames: exactly 2 buffered,
        // 8 dropped, nobody blocks.
        let (tx, rx) = bounded::<CapturedPacket>(2);
        let stats = EngineStats::new();

        for _ in 0..10 {
            let pkt = CapturedPacket {
                data: vec![0u8; 64],
                link_offset: 14,
            };
            if tx.try_send(pkt).is_ok() {
                stats.packets_enqueued.fetch_add(1, Relaxed);
            } else {
                stats.packets_dropped.fetch_add(1, Relaxed);
            }
        }

        assert_eq!(rx.len(), 2);
        let snap = stats.snapshot();
        assert_eq!(snap.packets_enqueued, 2);
        assert_eq!(snap.packets_dropped, 8);
    }
}
