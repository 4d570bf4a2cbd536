//! `flowtop run` — wire up the engine and drive the live table.
//!
//! The engine does the work on its own threads; this loop redraws the rank
//! table in place every interval, pushes the optional bandwidth report, and
//! turns SIGINT/SIGTERM or engine cancellation (capture timeout) into a clean
//! stop.

use anyhow::{Context, Result};
use crossbeam_channel::{select, tick};
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use flow_attrib::{discover, Accounting, CgroupLimits, Engine, DEFAULT_DEVICE_PREFIXES};

use crate::config::{EngineConfig, FlowtopConfig};
use crate::report::Reporter;
use crate::table;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn build_engine(cfg: &EngineConfig) -> Result<Engine> {
    let mut builder = Engine::builder()
        .queue_size(cfg.queue_size)
        .handler_count(cfg.handlers)
        .sync_interval(Duration::from_millis(cfg.sync_interval_ms));

    if let Some(prefix) = cfg.name_prefix.as_ref().filter(|p| !p.is_empty()) {
        builder = builder.name_prefix(prefix.clone());
    }
    if let Some(devices) = &cfg.devices {
        builder = builder.bind_devices(devices.clone());
    }
    if let Some(ips) = &cfg.ips {
        let parsed: Vec<IpAddr> = ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("invalid bound IP: {}", s))
            })
            .collect::<Result<_>>()?;
        builder = builder.bind_ips(parsed);
    }
    if let Some(prefixes) = &cfg.device_prefixes {
        builder = builder.device_prefixes(prefixes.clone());
    }
    if let Some(secs) = cfg.capture_timeout_secs {
        builder = builder.capture_timeout(Duration::from_secs(secs));
    }
    if let Some(filter) = &cfg.bpf_filter {
        builder = builder.bpf_filter(filter.clone());
    }
    if let Some(path) = &cfg.pcap_archive {
        builder = builder.archive_path(path.clone());
    }
    if cfg.payload_only {
        builder = builder.accounting(Accounting::PayloadOnly);
    }
    if cfg.cgroup_cpu_cores.is_some() || cfg.cgroup_memory_mb.is_some() {
        builder = builder.cgroup_limits(CgroupLimits {
            cpu_cores: cfg.cgroup_cpu_cores.unwrap_or(0.0),
            memory_mb: cfg.cgroup_memory_mb.unwrap_or(0),
        });
    }
    builder.build()
}

pub fn run(config: &FlowtopConfig) -> Result<()> {
    let engine = build_engine(&config.engine)?;
    engine.start()?;

    RUNNING.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }

    let done = engine.done();
    let ticker = tick(Duration::from_secs(config.display.interval_secs.max(1)));
    let reporter = config.report.clone().map(Reporter::new);

    let mut lines_drawn = draw(&engine, config, 0, reporter.as_ref());
    loop {
        if !RUNNING.load(Ordering::SeqCst) {
            break;
        }
        select! {
            recv(done.channel()) -> _ => break,
            recv(ticker) -> _ => {
                lines_drawn = draw(&engine, config, lines_drawn, reporter.as_ref());
            }
            // Wake periodically so Ctrl-C stays responsive between ticks.
            default(Duration::from_millis(200)) => {}
        }
    }

    engine.stop();
    let stats = engine.stats();
    println!();
    println!(
        "flowtop stopped — {} packets captured, {} dropped, {} replayed from the delay queue",
        stats.packets_enqueued, stats.packets_dropped, stats.delay_replayed
    );
    Ok(())
}

fn draw(
    engine: &Engine,
    config: &FlowtopConfig,
    prev_lines: usize,
    reporter: Option<&Reporter>,
) -> usize {
    let rows = match engine.rank(config.display.limit, config.display.window_secs) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("rank failed: {}", e);
            return prev_lines;
        }
    };

    if let Some(reporter) = reporter {
        let in_rate: u64 = rows.iter().map(|r| r.in_rate).sum();
        let out_rate: u64 = rows.iter().map(|r| r.out_rate).sum();
        if let Err(e) = reporter.report(in_rate, out_rate) {
            warn!("bandwidth report failed: {}", e);
        }
    }

    // Overwrite the previous draw instead of scrolling.
    if prev_lines > 0 {
        print!("\x1b[{}A\x1b[0J", prev_lines);
    }
    let lines = table::render(&rows, config.display.window_secs, &engine.stats());
    let count = lines.len();
    for line in lines {
        println!("{}", line);
    }
    std::io::stdout().flush().ok();
    count
}

/// `flowtop devices` — what would be captured with the current config.
pub fn devices(config: &FlowtopConfig) -> Result<()> {
    let prefixes: Vec<String> = config
        .engine
        .device_prefixes
        .clone()
        .unwrap_or_else(|| DEFAULT_DEVICE_PREFIXES.iter().map(|s| s.to_string()).collect());
    let bindings = discover(&prefixes)?;

    println!("Capture devices (allowlist: {}):", prefixes.join(", "));
    if bindings.devices.is_empty() {
        println!("  (none matched)");
    }
    for dev in &bindings.devices {
        println!("  {}", dev);
    }

    println!();
    println!("Bound IPs (source match = egress):");
    let mut ips: Vec<String> = bindings.ips.iter().map(|ip| ip.to_string()).collect();
    ips.sort();
    for ip in ips {
        println!("  {}", ip);
    }
    Ok(())
}
