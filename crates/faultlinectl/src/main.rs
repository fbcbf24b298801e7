//! Faultline Control - operator CLI for Faultline
//!
//! Inspects and maintains the durable CRITICAL history, validates
//! configuration, and drives a local engine for smoke testing.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, ConfigCommands, CriticalCommands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Critical { action } => match action {
            CriticalCommands::List { store, limit, json } => {
                commands::critical::list(config_path, &store, limit, json)
            }
            CriticalCommands::Purge { store, id, all } => {
                commands::critical::purge(config_path, &store, id.as_deref(), all)
            }
            CriticalCommands::Export {
                store,
                out,
                format,
                anonymize,
                system_info,
            } => commands::critical::export(config_path, &store, &out, format, anonymize, system_info),
            CriticalCommands::Report { store, json } => {
                commands::critical::report(config_path, &store, json)
            }
        },
        Commands::Config { action } => match action {
            ConfigCommands::Default => commands::config::print_default(),
            ConfigCommands::Check { path } => commands::config::check(path.as_deref().or(config_path)),
        },
        Commands::Simulate {
            count,
            error_type,
            component,
            severity,
            distinct,
        } => {
            let plan = commands::simulate::SimulationPlan {
                count,
                error_type,
                component,
                severity,
                distinct,
            };
            commands::simulate::run(config_path, plan).await
        }
    }
}
