//! Faultline Configuration v0.4.0
//!
//! One typed section per component, every key optional with a named default.
//! Configuration lives in /etc/faultline/config.toml unless $FAULTLINE_CONFIG
//! or an explicit path says otherwise. Values are validated once at load time.
//!
//! ```toml
//! [aggregation]
//! window_ms = 30000
//! mode = "pattern"
//!
//! [rate_limit]
//! threshold = 5
//! window_ms = 60000
//! use_exponential_backoff = true
//!
//! [history]
//! capacity = 1000
//! durable_backend = "sqlite"
//! durable_path = "/var/lib/faultline/critical.db"
//!
//! [treatment.warning]
//! timeout_ms = 8000
//! ```

use crate::error::ConfigError;
use crate::severity::Severity;
use crate::treatment::{DialogKind, Position};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// System configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/faultline";
const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "FAULTLINE_CONFIG";

/// Upper bound for aggregation and rate-limit windows (30 days)
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

// ============================================================================
// Classifier
// ============================================================================

/// Error type to severity table, merged over the built-in mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub mappings: BTreeMap<String, Severity>,

    /// Severity for types missing from the table
    #[serde(default = "default_fallback_severity")]
    pub default_severity: Severity,
}

fn default_fallback_severity() -> Severity {
    Severity::Error
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mappings: BTreeMap::new(),
            default_severity: default_fallback_severity(),
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// How messages are keyed for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Raw message verbatim
    Exact,
    /// Numbers, quoted strings and ids replaced by a wildcard
    #[default]
    Pattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period after the last match before a bucket expires
    #[serde(default = "default_aggregation_window")]
    pub window_ms: u64,

    #[serde(default)]
    pub mode: AggregationMode,

    /// Extra regexes wildcarded in pattern mode
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_aggregation_window() -> u64 {
    30_000 // 30 seconds
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_aggregation_window(),
            mode: AggregationMode::default(),
            extra_patterns: Vec::new(),
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Granularity of rate-limit windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyMode {
    Severity,
    #[default]
    SeverityComponent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Notifications allowed per key per window
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    #[serde(default = "default_rate_window")]
    pub window_ms: u64,

    /// Suppress (instead of batch) with doubling cooldowns after overflow
    #[serde(default)]
    pub use_exponential_backoff: bool,

    /// Cap on the backoff exponent (valid: 0-20)
    #[serde(default = "default_max_backoff_level")]
    pub max_backoff_level: u32,

    #[serde(default)]
    pub key_by: RateLimitKeyMode,
}

fn default_threshold() -> u32 {
    5
}

fn default_rate_window() -> u64 {
    60_000 // 1 minute
}

fn default_max_backoff_level() -> u32 {
    6 // 64 windows
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            window_ms: default_rate_window(),
            use_exponential_backoff: false,
            max_backoff_level: default_max_backoff_level(),
            key_by: RateLimitKeyMode::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn effective_max_backoff_level(&self) -> u32 {
        self.max_backoff_level.clamp(0, 20)
    }
}

// ============================================================================
// Callbacks
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Soft budget for a synchronous callback; overruns move it to the background
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,

    /// Callbacks declaring a higher expected cost always run in the background
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

fn default_budget_ms() -> u64 {
    50
}

fn default_slow_threshold_ms() -> u64 {
    100
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            budget_ms: default_budget_ms(),
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Backend for durable critical history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurableBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// In-memory ring buffer capacity
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub durable_backend: DurableBackend,

    /// Durable critical-history location; None keeps critical history in memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_path: Option<PathBuf>,

    /// Attempts per durable write before the failure is reported
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Bounded queue depth of the background worker
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,
}

fn default_capacity() -> usize {
    1000
}

fn default_persistence_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn default_worker_queue() -> usize {
    256
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            durable_backend: DurableBackend::default(),
            durable_path: None,
            persistence_retries: default_persistence_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            worker_queue: default_worker_queue(),
        }
    }
}

// ============================================================================
// Redaction (export anonymization)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Context keys whose values are replaced (case-insensitive)
    #[serde(default = "default_redact_keys")]
    pub keys: Vec<String>,

    /// Regexes scrubbed from messages and remaining context values
    #[serde(default = "default_redact_patterns")]
    pub patterns: Vec<String>,

    #[serde(default = "default_redact_token")]
    pub token: String,
}

fn default_redact_keys() -> Vec<String> {
    [
        "path", "file", "file_path", "filename", "dir", "user", "username", "user_id", "email",
        "home", "host", "hostname",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        r"/home/[^/\s]+".to_string(),
        r"/Users/[^/\s]+".to_string(),
        r"(?i)C:\\Users\\[^\\\s]+".to_string(),
        r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}".to_string(),
    ]
}

fn default_redact_token() -> String {
    "[REDACTED]".to_string()
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            keys: default_redact_keys(),
            patterns: default_redact_patterns(),
            token: default_redact_token(),
        }
    }
}

// ============================================================================
// Treatment
// ============================================================================

/// Per-severity overrides; unset fields fall back to the built-in table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityTreatment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialog_kind: Option<DialogKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentConfig {
    #[serde(default)]
    pub info: SeverityTreatment,
    #[serde(default)]
    pub warning: SeverityTreatment,
    #[serde(default)]
    pub error: SeverityTreatment,
    #[serde(default)]
    pub critical: SeverityTreatment,
}

impl TreatmentConfig {
    pub fn for_severity(&self, severity: Severity) -> &SeverityTreatment {
        match severity {
            Severity::Info => &self.info,
            Severity::Warning => &self.warning,
            Severity::Error => &self.error,
            Severity::Critical => &self.critical,
        }
    }
}

// ============================================================================
// Janitor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Sweep interval for bucket expiry and batch flushes
    #[serde(default = "default_janitor_interval")]
    pub interval_ms: u64,
}

fn default_janitor_interval() -> u64 {
    1_000
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_janitor_interval(),
        }
    }
}

impl JanitorConfig {
    /// Clamp to 10ms-60s
    pub fn effective_interval_ms(&self) -> u64 {
        self.interval_ms.clamp(10, 60_000)
    }
}

// ============================================================================
// Complete configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FaultlineConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub callbacks: CallbackConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub redaction: RedactionConfig,

    #[serde(default)]
    pub treatment: TreatmentConfig,

    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl FaultlineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FaultlineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from $FAULTLINE_CONFIG, then /etc/faultline/config.toml, else defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        let system_path = config_path();
        if system_path.exists() {
            return Self::load_from(&system_path);
        }
        Ok(Self::default())
    }

    /// Write pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml_string()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.capacity == 0 {
            return Err(ConfigError::invalid("history.capacity", "must be at least 1"));
        }
        if self.history.worker_queue == 0 {
            return Err(ConfigError::invalid("history.worker_queue", "must be at least 1"));
        }
        if self.history.retry_base_ms > self.history.retry_max_ms {
            return Err(ConfigError::invalid(
                "history.retry_base_ms",
                "must not exceed history.retry_max_ms",
            ));
        }
        if self.aggregation.enabled && self.aggregation.window_ms == 0 {
            return Err(ConfigError::invalid("aggregation.window_ms", "must be positive"));
        }
        if self.aggregation.window_ms > MAX_WINDOW_MS {
            return Err(ConfigError::invalid("aggregation.window_ms", "must not exceed 30 days"));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.threshold == 0 {
                return Err(ConfigError::invalid("rate_limit.threshold", "must be at least 1"));
            }
            if self.rate_limit.window_ms == 0 {
                return Err(ConfigError::invalid("rate_limit.window_ms", "must be positive"));
            }
        }
        if self.rate_limit.window_ms > MAX_WINDOW_MS {
            return Err(ConfigError::invalid("rate_limit.window_ms", "must not exceed 30 days"));
        }
        if self.rate_limit.max_backoff_level > 20 {
            return Err(ConfigError::invalid("rate_limit.max_backoff_level", "must be 0-20"));
        }
        if self.janitor.interval_ms == 0 {
            return Err(ConfigError::invalid("janitor.interval_ms", "must be positive"));
        }
        if self.redaction.token.is_empty() {
            return Err(ConfigError::invalid("redaction.token", "must not be empty"));
        }
        for pattern in &self.aggregation.extra_patterns {
            Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("aggregation.extra_patterns", e.to_string()))?;
        }
        for pattern in &self.redaction.patterns {
            Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("redaction.patterns", e.to_string()))?;
        }
        for severity in Severity::ALL {
            if self.treatment.for_severity(severity).timeout_ms == Some(0) {
                return Err(ConfigError::invalid(
                    &format!("treatment.{}.timeout_ms", severity.as_str().to_lowercase()),
                    "must be positive, omit it for no timeout",
                ));
            }
        }
        Ok(())
    }
}

/// Get the system config file path
pub fn config_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE)
}
