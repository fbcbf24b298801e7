//! History Store v0.4.0
//!
//! Every submitted event ends up here exactly once, whether or not it was
//! presented. Layout:
//! - `ring`: bounded in-memory buffer, evicts non-CRITICAL entries first
//! - `query`: newest-first filtered reads, optionally cancellable
//! - `durable`: CRITICAL retention across restarts (jsonl / sqlite / memory)
//! - `export`: JSON, CSV and TEXT dumps with optional anonymization

pub mod durable;
pub mod export;
pub mod query;
mod ring;

pub use durable::{open_store, DurableStore, JsonlStore, MemoryStore, SqliteStore};
pub use export::{parse_json_export, ExportFormat, ExportOptions, SystemInfo};
pub use query::HistoryFilter;

use crate::error::{ExportError, PersistenceError, QueryCancelled};
use crate::event::{ErrorEvent, EventId};
use crate::redaction::Redactor;
use crate::severity::Severity;
use chrono::{DateTime, Utc};
use ring::HistoryRing;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Entry
// ============================================================================

/// One recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: ErrorEvent,

    /// Presented to the user, or recorded silently (merged, batched, suppressed)
    pub emitted: bool,

    /// Occurrences this entry accounts for at record time
    #[serde(default = "default_aggregated_count")]
    pub aggregated_count: u32,

    pub recorded_at: DateTime<Utc>,
}

fn default_aggregated_count() -> u32 {
    1
}

impl HistoryEntry {
    pub fn new(event: ErrorEvent, emitted: bool, aggregated_count: u32, recorded_at: DateTime<Utc>) -> Self {
        Self {
            event,
            emitted,
            aggregated_count: aggregated_count.max(1),
            recorded_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.event.id
    }

    pub fn severity(&self) -> Severity {
        self.event.severity
    }

    pub fn is_critical(&self) -> bool {
        self.event.severity.is_critical()
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory ring plus the durable critical store behind it
pub struct HistoryStore {
    ring: Mutex<HistoryRing>,
    durable: Arc<dyn DurableStore>,
}

impl HistoryStore {
    pub fn new(capacity: usize, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            ring: Mutex::new(HistoryRing::new(capacity)),
            durable,
        }
    }

    /// Record an entry in memory; returns the entry evicted to make room.
    /// Durable writes for CRITICAL entries are scheduled by the engine.
    pub fn append(&self, entry: HistoryEntry) -> Option<HistoryEntry> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry)
    }

    /// Matching entries, newest first
    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        filter.apply(self.snapshot().into_iter().rev())
    }

    /// Like `query`, but gives up once `cancel` fires
    pub fn query_cancellable(
        &self,
        filter: &HistoryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryEntry>, QueryCancelled> {
        filter.apply_cancellable(self.snapshot().into_iter().rev(), cancel)
    }

    /// All in-memory entries, oldest first
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).to_vec()
    }

    /// Empty the in-memory buffer; durable records are untouched
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).capacity()
    }

    /// Entries evicted since start
    pub fn evictions(&self) -> u64 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).evictions()
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    /// Durable CRITICAL records, oldest first
    pub fn critical_history(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        self.durable.load_all()
    }

    pub fn purge_critical(&self, id: &EventId) -> Result<bool, PersistenceError> {
        self.durable.purge(id)
    }

    pub fn purge_all_critical(&self) -> Result<usize, PersistenceError> {
        self.durable.purge_all()
    }

    /// Write the in-memory history to `path`; returns the number of entries written
    pub fn export(
        &self,
        path: &Path,
        options: &ExportOptions,
        redactor: &Redactor,
        cancel: &CancellationToken,
    ) -> Result<usize, ExportError> {
        let entries = self.snapshot();
        export::write_export(path, &entries, options, redactor, cancel)
    }

    /// Report over the in-memory ring only; `durable_critical` stays None
    pub fn memory_report(&self, top_n: usize) -> HistoryReport {
        let mut report = HistoryReport::from_entries(&self.snapshot(), top_n);
        report.evictions = self.evictions();
        report
    }

    /// Full report including the durable count (blocking read)
    pub fn report(&self, top_n: usize) -> HistoryReport {
        let mut report = self.memory_report(top_n);
        report.durable_critical = self.durable.load_all().ok().map(|v| v.len());
        report
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("durable", &self.durable.describe())
            .finish()
    }
}

// ============================================================================
// Report
// ============================================================================

/// Statistics over a set of history entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryReport {
    pub total_entries: usize,
    /// Raw occurrences; summary entries restate these and are not added again
    pub total_occurrences: u64,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Busiest components, descending (empty component shown as "")
    pub top_components: Vec<(String, usize)>,
    pub by_error_type: BTreeMap<String, usize>,
    pub emitted: usize,
    pub silent: usize,
    pub evictions: u64,
    /// Records in the durable critical store, None when it could not be read
    pub durable_critical: Option<usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl HistoryReport {
    pub fn from_entries(entries: &[HistoryEntry], top_n: usize) -> Self {
        let mut report = HistoryReport::default();
        let mut components: HashMap<&str, usize> = HashMap::new();

        for entry in entries {
            report.total_entries += 1;
            if !entry.event.is_summary() {
                report.total_occurrences += 1;
            }
            *report.by_severity.entry(entry.severity()).or_insert(0) += 1;
            *report
                .by_error_type
                .entry(entry.event.error_type.clone())
                .or_insert(0) += 1;
            *components.entry(entry.event.component.as_str()).or_insert(0) += 1;

            if entry.emitted {
                report.emitted += 1;
            } else {
                report.silent += 1;
            }

            let ts = entry.event.timestamp;
            report.oldest = Some(report.oldest.map_or(ts, |o| o.min(ts)));
            report.newest = Some(report.newest.map_or(ts, |n| n.max(ts)));
        }

        let mut top: Vec<(String, usize)> = components
            .into_iter()
            .map(|(c, n)| (c.to_string(), n))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(top_n);
        report.top_components = top;
        report
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}
