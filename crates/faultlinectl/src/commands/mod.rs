//! Command modules for faultlinectl
//!
//! - critical: list, purge, export and report the durable CRITICAL history
//! - config: print defaults, validate files
//! - simulate: push synthetic events through a local engine

pub mod config;
pub mod critical;
pub mod simulate;

use anyhow::{Context, Result};
use faultline::FaultlineConfig;
use owo_colors::OwoColorize;
use std::path::Path;

pub const THIN_SEP: &str = "------------------------------------------------------------";

/// Explicit file, else $FAULTLINE_CONFIG, /etc/faultline/config.toml, defaults
pub fn load_config(path: Option<&Path>) -> Result<FaultlineConfig> {
    match path {
        Some(path) => FaultlineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => FaultlineConfig::load().context("Failed to load config"),
    }
}

/// Section title in the `[SECTION]` style
pub fn section(title: &str) {
    println!("{}", format!("[{}]", title).cyan());
}

/// Colored fixed-width severity label
pub fn severity_label(severity: faultline::Severity) -> String {
    let label = format!("{:<8}", severity.as_str());
    match severity {
        faultline::Severity::Info => label.dimmed().to_string(),
        faultline::Severity::Warning => label.yellow().to_string(),
        faultline::Severity::Error => label.red().to_string(),
        faultline::Severity::Critical => label.bright_red().bold().to_string(),
    }
}
