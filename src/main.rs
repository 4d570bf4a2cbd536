//! flowtop — per-process network traffic top.
//!
//! Attributes live TCP throughput to the processes that own the sockets and
//! shows a ranked table of who is moving bytes. Run `flowtop --help` for
//! usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod color;
mod config;
mod report;
mod run;
mod table;

use cli::{Cli, Commands};
use config::FlowtopConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = FlowtopConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Devices => {
            let config = FlowtopConfig::load(&cli.config)?;
            run::devices(&config)?;
        }
        Commands::Run {
            name,
            filter,
            limit,
            window,
            interval,
        } => {
            let mut config = FlowtopConfig::load(&cli.config)?;
            // Command-line flags win over the config file.
            if name.is_some() {
                config.engine.name_prefix = name;
            }
            if filter.is_some() {
                config.engine.bpf_filter = filter;
            }
            if let Some(limit) = limit {
                config.display.limit = limit;
            }
            if let Some(window) = window {
                config.display.window_secs = window;
            }
            if let Some(interval) = interval {
                config.display.interval_secs = interval;
            }
            run::run(&config)?;
        }
    }

    Ok(())
}
