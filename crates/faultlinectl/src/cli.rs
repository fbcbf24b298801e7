//! CLI - Command-line argument parsing
//!
//! Defines the CLI structure using clap.
//! Keeps argument parsing separate from execution logic.

use clap::{Args, Parser, Subcommand, ValueEnum};
use faultline::config::DurableBackend;
use faultline::{ExportFormat, Severity};
use std::path::PathBuf;

/// Faultline operator CLI
#[derive(Parser, Debug)]
#[command(name = "faultlinectl")]
#[command(about = "Faultline - inspect and maintain error history", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Config file (overrides $FAULTLINE_CONFIG and /etc/faultline/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Durable CRITICAL history
    Critical {
        #[command(subcommand)]
        action: CriticalCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Run a local engine, submit events and print the resulting report
    Simulate {
        /// Number of events to submit
        #[arg(long, default_value_t = 20)]
        count: u32,

        #[arg(long, default_value = "NetworkError")]
        error_type: String,

        #[arg(long, default_value = "simulator")]
        component: String,

        /// Explicit severity (classified from the error type when omitted)
        #[arg(long)]
        severity: Option<Severity>,

        /// Use a distinct message per event instead of one repeated message
        #[arg(long)]
        distinct: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CriticalCommands {
    /// List stored CRITICAL events, newest first
    List {
        #[command(flatten)]
        store: StoreArgs,

        /// Show at most N events (0 = all)
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Delete stored CRITICAL events
    Purge {
        #[command(flatten)]
        store: StoreArgs,

        /// Event id to delete
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        id: Option<String>,

        /// Delete every stored event
        #[arg(long)]
        all: bool,
    },

    /// Write stored CRITICAL events to a file
    Export {
        #[command(flatten)]
        store: StoreArgs,

        /// Output file
        #[arg(long)]
        out: PathBuf,

        /// json, csv or text
        #[arg(long, default_value = "json")]
        format: ExportFormat,

        /// Scrub user paths, emails and identifying context
        #[arg(long)]
        anonymize: bool,

        /// Include an OS / host / memory header
        #[arg(long)]
        system_info: bool,
    },

    /// Statistics over stored CRITICAL events
    Report {
        #[command(flatten)]
        store: StoreArgs,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the built-in defaults as TOML
    Default,

    /// Load and validate a config file (default: the active config)
    Check {
        path: Option<PathBuf>,
    },
}

/// Durable store selection, overriding `[history]` in the config
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Durable store file
    #[arg(long)]
    pub store: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub backend: Option<Backend>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Jsonl,
    Sqlite,
}

impl From<Backend> for DurableBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Jsonl => DurableBackend::Jsonl,
            Backend::Sqlite => DurableBackend::Sqlite,
        }
    }
}
