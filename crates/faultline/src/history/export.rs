//! History export
//!
//! Formats:
//! - JSON: array of entries, or `{ "system_info": .., "entries": [..] }` when
//!   system info is requested
//! - CSV: `id,type,message,severity,component,timestamp,count`
//! - TEXT: one human-readable line per entry, `# key: value` header lines
//!
//! Files are written next to the target and renamed into place, so a
//! cancelled or failed export never leaves a partial file behind.

use super::HistoryEntry;
use crate::error::ExportError;
use crate::redaction::Redactor;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

/// Entries rendered between cancellation checks
const CANCEL_CHECK_EVERY: usize = 256;

const CSV_HEADER: &str = "id,type,message,severity,component,timestamp,count";

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Text,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Text => "txt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub include_system_info: bool,
    /// Scrub messages and sensitive context through the redactor
    pub anonymize: bool,
}

impl ExportOptions {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_system_info(mut self) -> Self {
        self.include_system_info = true;
        self
    }

    pub fn anonymized(mut self) -> Self {
        self.anonymize = true;
        self
    }
}

// ============================================================================
// System info
// ============================================================================

/// Host description attached to exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub host_name: String,
    pub arch: String,
    pub total_memory_bytes: u64,
    pub faultline_version: String,
    pub exported_at: DateTime<Utc>,
}

impl SystemInfo {
    pub fn collect(now: DateTime<Utc>) -> Self {
        let unknown = || "unknown".to_string();
        let mut sys = System::new();
        sys.refresh_memory();

        Self {
            os_name: System::name().unwrap_or_else(unknown),
            os_version: System::os_version().unwrap_or_else(unknown),
            kernel_version: System::kernel_version().unwrap_or_else(unknown),
            host_name: System::host_name().unwrap_or_else(unknown),
            arch: std::env::consts::ARCH.to_string(),
            total_memory_bytes: sys.total_memory(),
            faultline_version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: now,
        }
    }

    fn anonymized(mut self, token: &str) -> Self {
        self.host_name = token.to_string();
        self
    }

    fn header_lines(&self) -> Vec<(&'static str, String)> {
        vec![
            ("os", format!("{} {}", self.os_name, self.os_version)),
            ("kernel", self.kernel_version.clone()),
            ("host", self.host_name.clone()),
            ("arch", self.arch.clone()),
            ("memory_bytes", self.total_memory_bytes.to_string()),
            ("faultline", self.faultline_version.clone()),
            ("exported_at", rfc3339(&self.exported_at)),
        ]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonExport {
    system_info: SystemInfo,
    entries: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonExportDocument {
    Plain(Vec<HistoryEntry>),
    WithSystemInfo(JsonExport),
}

/// Read back a JSON export in either shape
pub fn parse_json_export(text: &str) -> Result<Vec<HistoryEntry>, ExportError> {
    Ok(match serde_json::from_str(text)? {
        JsonExportDocument::Plain(entries) => entries,
        JsonExportDocument::WithSystemInfo(doc) => doc.entries,
    })
}

// ============================================================================
// Rendering
// ============================================================================

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn check(cancel: &CancellationToken, index: usize) -> Result<(), ExportError> {
    if index % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }
    Ok(())
}

/// Quote a CSV field when it holds a separator, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(entries: &[HistoryEntry], cancel: &CancellationToken) -> Result<String, ExportError> {
    let mut out = String::with_capacity(entries.len() * 96 + CSV_HEADER.len() + 1);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for (i, entry) in entries.iter().enumerate() {
        check(cancel, i)?;
        let e = &entry.event;
        let fields = [
            e.id.to_string(),
            csv_field(&e.error_type),
            csv_field(&e.message),
            e.severity.to_string(),
            csv_field(&e.component),
            rfc3339(&e.timestamp),
            entry.aggregated_count.to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn render_text(
    entries: &[HistoryEntry],
    system_info: Option<&SystemInfo>,
    cancel: &CancellationToken,
) -> Result<String, ExportError> {
    let mut out = String::new();
    if let Some(info) = system_info {
        for (key, value) in info.header_lines() {
            let _ = writeln!(out, "# {}: {}", key, value);
        }
    }
    for (i, entry) in entries.iter().enumerate() {
        check(cancel, i)?;
        let e = &entry.event;
        let component = if e.component.is_empty() {
            "-"
        } else {
            e.component.as_str()
        };
        let _ = write!(
            out,
            "[{}] {:<8} {} {}: {}",
            rfc3339(&e.timestamp),
            e.severity,
            component,
            e.error_type,
            e.message.replace('\n', " ")
        );
        if entry.aggregated_count > 1 {
            let _ = write!(out, " (x{})", entry.aggregated_count);
        }
        if !entry.emitted {
            out.push_str(" [silent]");
        }
        let _ = writeln!(out, " id={}", e.id);
    }
    Ok(out)
}

/// Render `entries` in the requested format
pub fn render(
    entries: &[HistoryEntry],
    format: ExportFormat,
    system_info: Option<&SystemInfo>,
    cancel: &CancellationToken,
) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let json = match system_info {
                Some(info) => serde_json::to_string_pretty(&JsonExport {
                    system_info: info.clone(),
                    entries: entries.to_vec(),
                })?,
                None => serde_json::to_string_pretty(entries)?,
            };
            Ok(json)
        }
        ExportFormat::Csv => render_csv(entries, cancel),
        ExportFormat::Text => render_text(entries, system_info, cancel),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Render and atomically write an export; returns the number of entries written
pub fn write_export(
    path: &Path,
    entries: &[HistoryEntry],
    options: &ExportOptions,
    redactor: &Redactor,
    cancel: &CancellationToken,
) -> Result<usize, ExportError> {
    let scrubbed: Vec<HistoryEntry>;
    let entries = if options.anonymize {
        scrubbed = entries
            .iter()
            .map(|entry| HistoryEntry {
                event: redactor.redact_event(&entry.event),
                ..entry.clone()
            })
            .collect();
        &scrubbed[..]
    } else {
        entries
    };

    let system_info = options.include_system_info.then(|| {
        let info = SystemInfo::collect(Utc::now());
        if options.anonymize {
            info.anonymized(redactor.token())
        } else {
            info
        }
    });

    let body = render(entries, options.format, system_info.as_ref(), cancel)?;
    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }

    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp = temp_path_for(path);
    fs::write(&tmp, body).map_err(io_err)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(entries.len())
}
