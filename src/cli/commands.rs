//! CLI command definitions using clap.
//!
//! - serve: run a router on stdio (primary, or relay if the address is taken)
//! - demo: run a sample tool host against a router

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Toolmux - one tool endpoint for an agent, many applications behind it
#[derive(Parser, Debug)]
#[command(name = "toolmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the agent protocol on stdin/stdout
    Serve {
        /// Application listener address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Maximum concurrent application connections
        #[arg(short, long)]
        max_connections: Option<usize>,

        /// Per-call timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Run a demo tool host with the baseline UI tools
    Demo {
        /// Application name, used as the tool namespace
        #[arg(short, long, default_value = "Demo")]
        name: String,

        /// Router address (defaults to the configured listener address)
        #[arg(short, long)]
        router: Option<String>,
    },
}
