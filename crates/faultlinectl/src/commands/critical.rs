//! Critical command - durable CRITICAL history maintenance
//!
//! Works directly on the durable store; no engine is started.

use super::{load_config, section, severity_label, THIN_SEP};
use crate::cli::StoreArgs;
use anyhow::{bail, Context, Result};
use faultline::history::export::write_export;
use faultline::history::open_store;
use faultline::redaction::Redactor;
use faultline::{
    DurableStore, EventId, ExportFormat, ExportOptions, FaultlineConfig, HistoryEntry,
    HistoryReport,
};
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const REPORT_TOP_COMPONENTS: usize = 10;

/// Config with the command-line store selection applied
fn effective_config(config_path: Option<&Path>, args: &StoreArgs) -> Result<FaultlineConfig> {
    let mut config = load_config(config_path)?;
    if let Some(path) = &args.store {
        config.history.durable_path = Some(path.clone());
    }
    if let Some(backend) = args.backend {
        config.history.durable_backend = backend.into();
    }
    Ok(config)
}

fn open(config: &FaultlineConfig) -> Result<Arc<dyn DurableStore>> {
    if config.history.durable_path.is_none() {
        bail!("No durable store configured: set history.durable_path or pass --store");
    }
    open_store(&config.history).context("Failed to open durable store")
}

/// Newest first, at most `limit` (0 = all)
fn newest_first(mut entries: Vec<HistoryEntry>, limit: usize) -> Vec<HistoryEntry> {
    entries.reverse();
    if limit > 0 {
        entries.truncate(limit);
    }
    entries
}

pub fn list(config_path: Option<&Path>, args: &StoreArgs, limit: usize, json: bool) -> Result<()> {
    let config = effective_config(config_path, args)?;
    let store = open(&config)?;
    let all = store.load_all().context("Failed to read durable store")?;
    let total = all.len();
    let entries = newest_first(all, limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("  Critical history ({})", store.describe()).bold());
    println!("{}", THIN_SEP);
    if entries.is_empty() {
        println!("  {}", "No CRITICAL events stored".green());
    }
    for entry in &entries {
        let e = &entry.event;
        let component = if e.component.is_empty() { "-" } else { e.component.as_str() };
        println!(
            "  {} {} {} {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            severity_label(e.severity),
            component.cyan(),
            e.error_type.bold()
        );
        println!("      {}", e.message);
        println!("      {}", format!("id={}", e.id).dimmed());
    }
    println!("{}", THIN_SEP);
    println!("  Showing {} of {} stored events", entries.len(), total);
    println!();
    Ok(())
}

pub fn purge(config_path: Option<&Path>, args: &StoreArgs, id: Option<&str>, all: bool) -> Result<()> {
    let config = effective_config(config_path, args)?;
    let store = open(&config)?;

    if all {
        let removed = store.purge_all().context("Failed to purge durable store")?;
        println!("Purged {} CRITICAL event(s)", removed);
        return Ok(());
    }

    let Some(raw) = id else {
        bail!("Pass --id ID or --all");
    };
    let Some(id) = EventId::parse(raw) else {
        bail!("Invalid event id: {}", raw);
    };
    if store.purge(&id).context("Failed to purge durable store")? {
        println!("Purged {}", id);
    } else {
        println!("{}", format!("No stored event with id {}", id).yellow());
    }
    Ok(())
}

pub fn export(
    config_path: Option<&Path>,
    args: &StoreArgs,
    out: &Path,
    format: ExportFormat,
    anonymize: bool,
    system_info: bool,
) -> Result<()> {
    let config = effective_config(config_path, args)?;
    let store = open(&config)?;
    let entries = store.load_all().context("Failed to read durable store")?;

    let mut options = ExportOptions::new(format);
    if anonymize {
        options = options.anonymized();
    }
    if system_info {
        options = options.with_system_info();
    }
    let redactor = Redactor::new(&config.redaction)?;

    let written = write_export(out, &entries, &options, &redactor, &CancellationToken::new())
        .with_context(|| format!("Failed to export to {}", out.display()))?;
    println!("Exported {} CRITICAL event(s) to {} ({})", written, out.display(), format);
    Ok(())
}

pub fn report(config_path: Option<&Path>, args: &StoreArgs, json: bool) -> Result<()> {
    let config = effective_config(config_path, args)?;
    let store = open(&config)?;
    let entries = store.load_all().context("Failed to read durable store")?;
    let mut report = HistoryReport::from_entries(&entries, REPORT_TOP_COMPONENTS);
    report.durable_critical = Some(entries.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("  Critical history report ({})", store.describe()).bold());
    println!("{}", THIN_SEP);
    print_report(&report);
    println!("{}", THIN_SEP);
    println!();
    Ok(())
}

/// Shared by `critical report` and `simulate`
pub fn print_report(report: &HistoryReport) {
    section("TOTALS");
    println!("  Entries:        {}", report.total_entries);
    println!("  Occurrences:    {}", report.total_occurrences);
    println!("  Presented:      {}", report.emitted);
    println!("  Silent:         {}", report.silent);
    println!("  Evictions:      {}", report.evictions);
    match report.durable_critical {
        Some(n) => println!("  Durable:        {}", n),
        None => println!("  Durable:        {}", "unreadable".red()),
    }
    if let (Some(oldest), Some(newest)) = (report.oldest, report.newest) {
        println!("  Span:           {} .. {}", oldest.to_rfc3339(), newest.to_rfc3339());
    }
    println!();

    section("BY SEVERITY");
    for (severity, count) in &report.by_severity {
        println!("  {} {}", severity_label(*severity), count);
    }
    println!();

    section("TOP COMPONENTS");
    for (component, count) in &report.top_components {
        let name = if component.is_empty() { "(root)" } else { component.as_str() };
        println!("  {:<32} {}", name, count);
    }
    println!();

    section("BY ERROR TYPE");
    for (error_type, count) in &report.by_error_type {
        println!("  {:<32} {}", error_type, count);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Backend;
    use chrono::Utc;
    use faultline::history::JsonlStore;
    use faultline::{ErrorEvent, EventContext, Severity};

    fn seeded_store(path: &Path) -> Vec<EventId> {
        let store = JsonlStore::open(path).unwrap();
        (0..3)
            .map(|i| {
                let now = Utc::now();
                let event = ErrorEvent::new(
                    "CorruptionError",
                    format!("block {} unreadable", i),
                    Severity::Critical,
                    "store",
                    EventContext::new(),
                    now,
                );
                let id = event.id;
                store.append(&HistoryEntry::new(event, true, 1, now)).unwrap();
                id
            })
            .collect()
    }

    fn args(path: &Path) -> StoreArgs {
        StoreArgs {
            store: Some(path.to_path_buf()),
            backend: Some(Backend::Jsonl),
        }
    }

    #[test]
    fn test_store_args_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("config.toml");
        FaultlineConfig::default().save(&cfg).unwrap();

        let path = dir.path().join("critical.db");
        let config = effective_config(
            Some(&cfg),
            &StoreArgs {
                store: Some(path.clone()),
                backend: Some(Backend::Sqlite),
            },
        )
        .unwrap();
        assert_eq!(config.history.durable_path, Some(path));
        assert_eq!(
            config.history.durable_backend,
            faultline::config::DurableBackend::Sqlite
        );
    }

    #[test]
    fn test_open_requires_store_path() {
        let config = FaultlineConfig::default();
        assert!(open(&config).is_err());
    }

    #[test]
    fn test_newest_first_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critical.jsonl");
        let ids = seeded_store(&path);
        let store = JsonlStore::open(&path).unwrap();

        let listed = newest_first(store.load_all().unwrap(), 2);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event.id, ids[2]);
        assert_eq!(listed[1].event.id, ids[1]);
    }

    #[test]
    fn test_purge_by_id_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("config.toml");
        FaultlineConfig::default().save(&cfg).unwrap();
        let path = dir.path().join("critical.jsonl");
        let ids = seeded_store(&path);

        purge(Some(&cfg), &args(&path), Some(&ids[0].to_string()), false).unwrap();
        assert_eq!(JsonlStore::open(&path).unwrap().load_all().unwrap().len(), 2);

        assert!(purge(Some(&cfg), &args(&path), Some("not-a-uuid"), false).is_err());

        purge(Some(&cfg), &args(&path), None, true).unwrap();
        assert!(JsonlStore::open(&path).unwrap().load_all().unwrap().is_empty());
    }

    #[test]
    fn test_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("config.toml");
        FaultlineConfig::default().save(&cfg).unwrap();
        let path = dir.path().join("critical.jsonl");
        seeded_store(&path);

        let out = dir.path().join("out.csv");
        export(Some(&cfg), &args(&path), &out, ExportFormat::Csv, false, false).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(text.lines().count(), 4);
    }
}
