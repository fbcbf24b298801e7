//! History queries
//!
//! Filters are AND-combined; an unset field matches everything. Callers feed
//! entries newest-first and get them back in the same order.

use super::HistoryEntry;
use crate::component::is_descendant_or_equal;
use crate::error::QueryCancelled;
use crate::severity::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Entries scanned between cancellation checks
const CANCEL_CHECK_EVERY: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Exact severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,

    /// Component subtree (descendant-or-equal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Inclusive event-timestamp range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,

    /// Case-insensitive substring of message or error type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_pattern: Option<String>,

    /// At most this many results (0 = unlimited)
    #[serde(default)]
    pub limit: usize,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.time_range = Some((from, to));
        self
    }

    pub fn text(mut self, pattern: impl Into<String>) -> Self {
        self.text_pattern = Some(pattern.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        let event = &entry.event;

        if self.severity.is_some_and(|s| event.severity != s) {
            return false;
        }
        if self.min_severity.is_some_and(|s| event.severity < s) {
            return false;
        }
        if let Some(component) = &self.component {
            if !is_descendant_or_equal(&event.component, component) {
                return false;
            }
        }
        if let Some(error_type) = &self.error_type {
            if event.error_type != *error_type {
                return false;
            }
        }
        if let Some((from, to)) = &self.time_range {
            if event.timestamp < *from || event.timestamp > *to {
                return false;
            }
        }
        if let Some(pattern) = &self.text_pattern {
            let needle = pattern.to_lowercase();
            if !event.message.to_lowercase().contains(&needle)
                && !event.error_type.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }

    fn cap(&self) -> usize {
        if self.limit == 0 {
            usize::MAX
        } else {
            self.limit
        }
    }

    /// Keep matching entries, preserving input order
    pub fn apply<I>(&self, entries: I) -> Vec<HistoryEntry>
    where
        I: IntoIterator<Item = HistoryEntry>,
    {
        entries
            .into_iter()
            .filter(|e| self.matches(e))
            .take(self.cap())
            .collect()
    }

    pub fn apply_cancellable<I>(
        &self,
        entries: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryEntry>, QueryCancelled>
    where
        I: IntoIterator<Item = HistoryEntry>,
    {
        let cap = self.cap();
        let mut results = Vec::new();
        for (scanned, entry) in entries.into_iter().enumerate() {
            if scanned % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(QueryCancelled);
            }
            if results.len() >= cap {
                break;
            }
            if self.matches(&entry) {
                results.push(entry);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorEvent, EventContext};
    use chrono::Duration;

    fn entries() -> Vec<HistoryEntry> {
        let t0 = Utc::now();
        let specs = [
            ("IoError", "disk full", Severity::Error, "io.writer"),
            ("NetworkError", "timeout contacting host", Severity::Warning, "ai.client"),
            ("ParseError", "bad token", Severity::Error, "ui.editor.toolbar"),
            ("CorruptionError", "checksum mismatch", Severity::Critical, ""),
            ("NetworkError", "connection reset", Severity::Info, "ai.client.retry"),
        ];
        specs
            .iter()
            .enumerate()
            .map(|(i, (t, m, s, c))| {
                let ts = t0 + Duration::seconds(i as i64);
                HistoryEntry::new(
                    ErrorEvent::new(*t, *m, *s, *c, EventContext::new(), ts),
                    true,
                    1,
                    ts,
                )
            })
            .rev()
            .collect()
    }

    fn messages(entries: Vec<HistoryEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.event.message).collect()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert_eq!(HistoryFilter::new().apply(entries()).len(), 5);
    }

    #[test]
    fn test_severity_exact_and_minimum() {
        let exact = HistoryFilter::new().severity(Severity::Error).apply(entries());
        assert_eq!(messages(exact), vec!["bad token", "disk full"]);

        let min = HistoryFilter::new()
            .min_severity(Severity::Error)
            .apply(entries());
        assert_eq!(min.len(), 3);
    }

    #[test]
    fn test_component_subtree() {
        let found = HistoryFilter::new().component("ai.client").apply(entries());
        assert_eq!(
            messages(found),
            vec!["connection reset", "timeout contacting host"]
        );
    }

    #[test]
    fn test_filters_and_combined() {
        let found = HistoryFilter::new()
            .error_type("NetworkError")
            .min_severity(Severity::Warning)
            .apply(entries());
        assert_eq!(messages(found), vec!["timeout contacting host"]);
    }

    #[test]
    fn test_text_and_limit() {
        let found = HistoryFilter::new().text("NETWORK").apply(entries());
        assert_eq!(found.len(), 2);

        let limited = HistoryFilter::new().limit(2).apply(entries());
        assert_eq!(messages(limited), vec!["connection reset", "checksum mismatch"]);
    }

    #[test]
    fn test_time_range_inclusive() {
        let all = entries();
        let newest = all[0].event.timestamp;
        let second = all[1].event.timestamp;
        let found = HistoryFilter::new().time_range(second, newest).apply(all);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_cancelled_query() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            HistoryFilter::new().apply_cancellable(entries(), &cancel),
            Err(QueryCancelled)
        );

        let live = CancellationToken::new();
        assert_eq!(
            HistoryFilter::new()
                .apply_cancellable(entries(), &live)
                .unwrap()
                .len(),
            5
        );
    }
}
