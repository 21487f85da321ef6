use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rcc", version, about = "Local routing gateway for Anthropic-style chat clients")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway.
    Start {
        /// Path to the JSON configuration file.
        #[arg(long, env = "RCC_CONFIG")]
        config: PathBuf,

        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured listen host.
        #[arg(long)]
        host: Option<String>,

        /// Enable debug logging.
        #[arg(long)]
        debug: bool,
    },

    /// Ask a running gateway to shut down gracefully.
    Stop {
        #[arg(long, default_value_t = 3456)]
        port: u16,

        /// Ignore connection errors (the gateway may already be down).
        #[arg(long)]
        force: bool,
    },

    /// Print a running gateway's status snapshot.
    Status {
        #[arg(long, default_value_t = 3456)]
        port: u16,

        /// Also print the overall health summary.
        #[arg(long)]
        detailed: bool,
    },
}
