//! CLI definitions for flowtop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "flowtop",
    version,
    about = "Per-process network traffic top\n\nCaptures live TCP traffic, attributes it to the owning processes via the kernel's socket tables, and shows who is moving bytes right now.",
    long_about = None
)]
pub struct Cli {
    /// Path to flowtop.toml config file
    #[clap(long, short, default_value = "flowtop.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture and show the per-process traffic ranking (Ctrl-C to stop)
    Run {
        /// Only track processes whose name starts with this prefix
        #[clap(long)]
        name: Option<String>,

        /// Override the BPF capture filter, e.g. "port 443"
        #[clap(long)]
        filter: Option<String>,

        /// Rows to show
        #[clap(long)]
        limit: Option<usize>,

        /// Rate window in seconds
        #[clap(long)]
        window: Option<usize>,

        /// Seconds between redraws
        #[clap(long)]
        interval: Option<u64>,
    },

    /// List capture devices and the host's bound IP addresses
    Devices,

    /// Print an example flowtop.toml to stdout
    Init,
}
