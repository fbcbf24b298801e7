//! Aggregator v0.4.0
//!
//! Groups similar errors into counted buckets so repeated failures reach the
//! UI once instead of N times.
//!
//! - Key = error type + component + normalized message
//! - Normalization is a pluggable strategy (exact or pattern wildcarding)
//! - The deadline is fixed when the bucket opens (first_seen + window); matches
//!   only bump count and last_seen, so a steady stream still closes on time
//! - The deadline is exclusive, an event landing exactly on it starts a new bucket
//! - Expired buckets with count > 1 are handed back so the caller can emit a
//!   single summary event

use crate::config::{AggregationConfig, AggregationMode};
use crate::event::ErrorEvent;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

/// Placeholder substituted for variable message tokens
pub const WILDCARD: &str = "<*>";

// ============================================================================
// Normalization strategies
// ============================================================================

/// Strategy turning a raw message into its aggregation pattern
pub trait MessageNormalizer: Send + Sync {
    fn normalize(&self, message: &str) -> String;
}

/// Uses the message verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactNormalizer;

impl MessageNormalizer for ExactNormalizer {
    fn normalize(&self, message: &str) -> String {
        message.to_string()
    }
}

static DEFAULT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Quoted substrings first so numbers inside quotes collapse with them
        r#""[^"\n]*""#,
        r"'[^'\n]*'",
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
        r"0x[0-9a-fA-F]+",
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        r"\b\d+(\.\d+)?\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Wildcards numbers, quoted strings, UUIDs, timestamps, hex and IPv4 tokens
#[derive(Debug, Clone, Default)]
pub struct PatternNormalizer {
    extra: Vec<Regex>,
}

impl PatternNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional patterns applied after the built-in set; invalid regexes are skipped
    pub fn with_extra_patterns(patterns: &[String]) -> Self {
        Self {
            extra: patterns.iter().filter_map(|p| Regex::new(p).ok()).collect(),
        }
    }
}

impl MessageNormalizer for PatternNormalizer {
    fn normalize(&self, message: &str) -> String {
        let mut result = message.to_string();
        for re in DEFAULT_PATTERNS.iter().chain(self.extra.iter()) {
            result = re.replace_all(&result, WILDCARD).into_owned();
        }
        result.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Normalizer for the configured mode
pub fn normalizer_for(config: &AggregationConfig) -> Arc<dyn MessageNormalizer> {
    match config.mode {
        AggregationMode::Exact => Arc::new(ExactNormalizer),
        AggregationMode::Pattern => {
            Arc::new(PatternNormalizer::with_extra_patterns(&config.extra_patterns))
        }
    }
}

/// SHA-256 hex over type, normalized message and component
pub fn fingerprint(error_type: &str, normalized_message: &str, component: &str) -> String {
    const DELIMITER: &[u8] = b"\x00";
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(normalized_message.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(component.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Buckets
// ============================================================================

/// Repeated similar errors within one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    pub key: String,
    pub fingerprint: String,
    /// First event that opened the bucket
    pub representative: ErrorEvent,
    /// Always >= 1
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Exclusive: the bucket is gone at this instant
    pub window_deadline: DateTime<Utc>,
}

/// Result of offering an event to the aggregator
#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub is_new_bucket: bool,
    /// Snapshot of the bucket after this event, None when aggregation is disabled
    pub bucket: Option<AggregationBucket>,
    /// Previous bucket under the same key that expired exactly as this event arrived
    pub expired: Option<AggregationBucket>,
}

impl AggregationOutcome {
    fn standalone() -> Self {
        Self {
            is_new_bucket: true,
            bucket: None,
            expired: None,
        }
    }

    /// Occurrences counted so far under this event's key
    pub fn count(&self) -> u32 {
        self.bucket.as_ref().map(|b| b.count).unwrap_or(1)
    }
}

/// Mutex-guarded bucket map
pub struct Aggregator {
    config: AggregationConfig,
    normalizer: Arc<dyn MessageNormalizer>,
    buckets: Mutex<HashMap<String, AggregationBucket>>,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        let normalizer = normalizer_for(&config);
        Self::with_normalizer(config, normalizer)
    }

    /// Use a caller-provided normalization strategy
    pub fn with_normalizer(config: AggregationConfig, normalizer: Arc<dyn MessageNormalizer>) -> Self {
        Self {
            config,
            normalizer,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.config.window_ms).unwrap_or(i64::MAX))
    }

    fn deadline(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
        now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Aggregation key and fingerprint for an event
    pub fn key_for(&self, event: &ErrorEvent) -> (String, String) {
        let normalized = self.normalizer.normalize(&event.message);
        let fp = fingerprint(&event.error_type, &normalized, &event.component);
        let key = format!(
            "{}\u{1f}{}\u{1f}{}",
            event.error_type, event.component, normalized
        );
        (key, fp)
    }

    /// Merge `event` into its bucket or open a new one
    pub fn offer(&self, event: &ErrorEvent, now: DateTime<Utc>) -> AggregationOutcome {
        if !self.config.enabled {
            return AggregationOutcome::standalone();
        }

        let (key, fp) = self.key_for(event);
        let window = self.window();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let mut expired = None;
        if let Some(bucket) = buckets.get_mut(&key) {
            if now < bucket.window_deadline {
                bucket.count += 1;
                bucket.last_seen = now;
                return AggregationOutcome {
                    is_new_bucket: false,
                    bucket: Some(bucket.clone()),
                    expired: None,
                };
            }
            expired = buckets.remove(&key);
        }

        let bucket = AggregationBucket {
            key: key.clone(),
            fingerprint: fp,
            representative: event.clone(),
            count: 1,
            first_seen: now,
            last_seen: now,
            window_deadline: Self::deadline(now, window),
        };
        buckets.insert(key, bucket.clone());

        AggregationOutcome {
            is_new_bucket: true,
            bucket: Some(bucket),
            expired,
        }
    }

    /// Remove and return every bucket whose deadline has passed
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<AggregationBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| b.window_deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut expired: Vec<AggregationBucket> =
            due.iter().filter_map(|k| buckets.remove(k)).collect();
        expired.sort_by_key(|b| b.first_seen);
        expired
    }

    /// Remove and return all buckets (shutdown)
    pub fn drain(&self) -> Vec<AggregationBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<AggregationBucket> = buckets.drain().map(|(_, b)| b).collect();
        all.sort_by_key(|b| b.first_seen);
        all
    }

    /// Current buckets, oldest first
    pub fn snapshot(&self) -> Vec<AggregationBucket> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<AggregationBucket> = buckets.values().cloned().collect();
        all.sort_by_key(|b| b.first_seen);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContext;
    use crate::severity::Severity;

    fn event(error_type: &str, message: &str, component: &str, at: DateTime<Utc>) -> ErrorEvent {
        ErrorEvent::new(
            error_type,
            message,
            Severity::Warning,
            component,
            EventContext::new(),
            at,
        )
    }

    fn config(window_ms: u64, mode: AggregationMode) -> AggregationConfig {
        AggregationConfig {
            enabled: true,
            window_ms,
            mode,
            extra_patterns: Vec::new(),
        }
    }

    #[test]
    fn test_pattern_normalizer() {
        let n = PatternNormalizer::new();
        assert_eq!(
            n.normalize("failed to open 'chapter 12.md' after 3 retries"),
            "failed to open <*> after <*> retries"
        );
        assert_eq!(
            n.normalize("request 550e8400-e29b-41d4-a716-446655440000 failed at 0x7fff5fbf"),
            "request <*> failed at <*>"
        );
        assert_eq!(n.normalize("host 10.0.0.12 unreachable"), "host <*> unreachable");
        assert_eq!(n.normalize("word2vec   model"), "word2vec model");
    }

    #[test]
    fn test_exact_normalizer_keeps_message() {
        assert_eq!(ExactNormalizer.normalize("retry 3 of 5"), "retry 3 of 5");
    }

    #[test]
    fn test_same_triple_merges() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Pattern));
        let t0 = Utc::now();
        for i in 0..5 {
            let at = t0 + Duration::seconds(i * 2);
            let outcome = agg.offer(&event("NetworkError", "timeout contacting host", "ai.client", at), at);
            assert_eq!(outcome.is_new_bucket, i == 0);
        }
        let buckets = agg.snapshot();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 5);
    }

    #[test]
    fn test_pattern_mode_merges_variable_numbers() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Pattern));
        let t0 = Utc::now();
        agg.offer(&event("IoError", "read failed at offset 10", "fs", t0), t0);
        let outcome = agg.offer(&event("IoError", "read failed at offset 99", "fs", t0), t0);
        assert!(!outcome.is_new_bucket);
        assert_eq!(outcome.count(), 2);
    }

    #[test]
    fn test_exact_mode_separates_variable_numbers() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Exact));
        let t0 = Utc::now();
        agg.offer(&event("IoError", "read failed at offset 10", "fs", t0), t0);
        let outcome = agg.offer(&event("IoError", "read failed at offset 99", "fs", t0), t0);
        assert!(outcome.is_new_bucket);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn test_component_and_type_are_part_of_key() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Exact));
        let t0 = Utc::now();
        assert!(agg.offer(&event("A", "m", "x", t0), t0).is_new_bucket);
        assert!(agg.offer(&event("A", "m", "y", t0), t0).is_new_bucket);
        assert!(agg.offer(&event("B", "m", "x", t0), t0).is_new_bucket);
    }

    #[test]
    fn test_deadline_is_exclusive() {
        let agg = Aggregator::new(config(1_000, AggregationMode::Exact));
        let t0 = Utc::now();
        agg.offer(&event("A", "m", "", t0), t0);
        agg.offer(&event("A", "m", "", t0), t0);

        let at_deadline = t0 + Duration::milliseconds(1_000);
        let outcome = agg.offer(&event("A", "m", "", at_deadline), at_deadline);
        assert!(outcome.is_new_bucket);
        let expired = outcome.expired.expect("previous bucket handed back");
        assert_eq!(expired.count, 2);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_deadline_fixed_on_match() {
        let agg = Aggregator::new(config(1_000, AggregationMode::Exact));
        let t0 = Utc::now();
        agg.offer(&event("A", "m", "", t0), t0);
        let t1 = t0 + Duration::milliseconds(900);
        let outcome = agg.offer(&event("A", "m", "", t1), t1);
        let bucket = outcome.bucket.unwrap();
        assert_eq!(bucket.last_seen, t1);
        assert_eq!(bucket.window_deadline, t0 + Duration::milliseconds(1_000));

        assert!(agg.expire(t0 + Duration::milliseconds(999)).is_empty());
        let expired = agg.expire(t0 + Duration::milliseconds(1_000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].count, 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_steady_repeats_still_close() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Exact));
        let t0 = Utc::now();
        let mut closed = 0;
        for step in 0..30 {
            let at = t0 + Duration::seconds(step * 20);
            closed += agg.expire(at).len();
            agg.offer(&event("NetworkError", "timeout", "ai", at), at);
        }
        assert_eq!(closed, 14);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_huge_window_saturates() {
        let agg = Aggregator::new(config(u64::MAX, AggregationMode::Exact));
        let t0 = Utc::now();
        agg.offer(&event("A", "m", "", t0), t0);
        let outcome = agg.offer(&event("A", "m", "", t0), t0);
        assert_eq!(outcome.count(), 2);
        assert!(agg.expire(t0).is_empty());
    }

    #[test]
    fn test_disabled_always_new() {
        let agg = Aggregator::new(AggregationConfig {
            enabled: false,
            ..AggregationConfig::default()
        });
        let t0 = Utc::now();
        for _ in 0..3 {
            let outcome = agg.offer(&event("A", "m", "", t0), t0);
            assert!(outcome.is_new_bucket);
            assert!(outcome.bucket.is_none());
        }
        assert!(agg.is_empty());
    }

    #[test]
    fn test_drain_returns_everything() {
        let agg = Aggregator::new(config(30_000, AggregationMode::Exact));
        let t0 = Utc::now();
        agg.offer(&event("A", "m", "", t0), t0);
        agg.offer(&event("B", "m", "", t0), t0);
        assert_eq!(agg.drain().len(), 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_custom_normalizer() {
        struct FirstWord;
        impl MessageNormalizer for FirstWord {
            fn normalize(&self, message: &str) -> String {
                message.split_whitespace().next().unwrap_or("").to_string()
            }
        }

        let agg = Aggregator::with_normalizer(config(30_000, AggregationMode::Exact), Arc::new(FirstWord));
        let t0 = Utc::now();
        agg.offer(&event("A", "disk full on /dev/sda", "", t0), t0);
        let outcome = agg.offer(&event("A", "disk quota exceeded", "", t0), t0);
        assert!(!outcome.is_new_bucket);
    }

    #[test]
    fn test_fingerprint_stable() {
        let a = fingerprint("A", "m <*>", "ui");
        assert_eq!(a, fingerprint("A", "m <*>", "ui"));
        assert_ne!(a, fingerprint("A", "m <*>", "ai"));
        assert_eq!(a.len(), 64);
    }
}
