//! Rank table rendering for the live view.
//!
//! One row per process: identity, inode count, cumulative totals, and the
//! windowed in/out rates. Rates above the highlight threshold are drawn in
//! red so a runaway process stands out at a glance.

use chrono::Local;
use flow_attrib::{EngineStatsSnapshot, ProcessSnapshot};

use crate::color;

/// Rates at or above this many bytes/s are highlighted.
const RATE_HIGHLIGHT: u64 = 1024 * 1024;

const EXE_WIDTH: usize = 36;

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Bytes/s rendered as Mbit/s, red when above the highlight threshold.
pub fn format_rate(bytes_per_sec: u64) -> String {
    let mbit = bytes_per_sec as f64 * 8.0 / 1_000_000.0;
    let text = format!("{:.2} Mbit/s", mbit);
    if bytes_per_sec >= RATE_HIGHLIGHT {
        color::red(&text)
    } else {
        text
    }
}

fn truncate_middle(s: &str, width: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= width {
        return s.to_string();
    }
    let keep = width.saturating_sub(1) / 2;
    let tail = width - keep - 1;
    let mut out: String = chars[..keep].iter().collect();
    out.push('…');
    out.extend(&chars[chars.len() - tail..]);
    out
}

/// Render the table; returns the lines so the caller can redraw in place.
pub fn render(
    rows: &[ProcessSnapshot],
    window_secs: usize,
    stats: &EngineStatsSnapshot,
) -> Vec<String> {
    let mut out = Vec::with_capacity(rows.len() + 6);

    out.push(color::bold_cyan(&format!(
        "FLOWTOP  {}  ({}s window)",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        window_secs
    )));
    out.push(color::bold(&format!(
        "{:>7}  {:<18}  {:<w$}  {:>6}  {:>10}  {:>10}  {:>12}  {:>12}",
        "PID", "NAME", "EXE", "INODES", "IN", "OUT", "IN_RATE", "OUT_RATE",
        w = EXE_WIDTH,
    )));

    for row in rows {
        out.push(format!(
            "{:>7}  {:<18}  {:<w$}  {:>6}  {:>10}  {:>10}  {:>12}  {:>12}",
            row.pid,
            truncate_middle(&row.name, 18),
            truncate_middle(&row.exe, EXE_WIDTH),
            row.inode_count,
            human_bytes(row.in_total),
            human_bytes(row.out_total),
            format_rate(row.in_rate),
            format_rate(row.out_rate),
            w = EXE_WIDTH,
        ));
    }
    if rows.is_empty() {
        out.push(color::dim("  (no matching processes with traffic yet)"));
    }

    out.push(String::new());
    out.push(color::dim(&format!(
        "packets: {} captured, {} dropped   delayed: {} queued, {} replayed, {} expired",
        stats.packets_enqueued,
        stats.packets_dropped,
        stats.delay_enqueued,
        stats.delay_replayed,
        stats.delay_expired,
    )));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1024), "1.0 KB");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_bytes(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[test]
    fn test_format_rate_mbit() {
        // 125_000 B/s = 1 Mbit/s, below the highlight threshold.
        assert_eq!(format_rate(125_000), "1.00 Mbit/s");
        assert_eq!(format_rate(0), "0.00 Mbit/s");
    }

    #[test]
    fn test_truncate_middle() {
        assert_eq!(truncate_middle("short", 10), "short");
        let long = "/usr/lib/systemd/systemd-journald";
        let cut = truncate_middle(long, 20);
        assert!(cut.chars().count() <= 20);
        assert!(cut.contains('…'));
        assert!(cut.starts_with("/usr"));
    }

    #[test]
    fn test_render_includes_rows_and_footer() {
        let rows = vec![ProcessSnapshot {
            pid: 100,
            name: "curl".into(),
            exe: "/usr/bin/curl".into(),
            inode_count: 2,
            in_total: 2048,
            out_total: 1024,
            in_rate: 100,
            out_rate: 50,
        }];
        let stats = EngineStatsSnapshot {
            packets_enqueued: 10,
            packets_dropped: 1,
            packets_handled: 9,
            parse_skipped: 0,
            delay_enqueued: 2,
            delay_dropped: 0,
            delay_replayed: 2,
            delay_expired: 0,
            rescans: 3,
            evicted: 0,
        };
        let lines = render(&rows, 5, &stats);
        let text = lines.join("\n");
        assert!(text.contains("curl"));
        assert!(text.contains("2.0 KB"));
        assert!(text.contains("10 captured"));
    }
}
