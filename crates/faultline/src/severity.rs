//! Severity Classifier v0.4.0
//!
//! Severity is a total order INFO < WARNING < ERROR < CRITICAL.
//! Classification is data, not code dispatch: an explicit severity wins,
//! otherwise the error type is looked up in a configurable table, and
//! anything unknown falls back to the configured default (ERROR).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Severity
// ============================================================================

/// Ordered classification of error impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warning", alias = "warn")]
    Warning,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical")]
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Case-insensitive parse, accepts "warn" as an alias
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" | "crit" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Severity::Critical)
    }

    /// Color hint for terminal display
    pub fn color_code(&self) -> &'static str {
        match self {
            Severity::Info => "cyan",
            Severity::Warning => "yellow",
            Severity::Error => "red",
            Severity::Critical => "red_bold",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse(s).ok_or_else(|| format!("unknown severity '{}'", s))
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Built-in error type to severity mappings registered at engine init
pub fn default_mappings() -> HashMap<String, Severity> {
    [
        ("NotFoundError", Severity::Error),
        ("PermissionError", Severity::Error),
        ("IoError", Severity::Error),
        ("ParseError", Severity::Error),
        ("CorruptionError", Severity::Critical),
        ("OutOfMemoryError", Severity::Critical),
        ("PersistenceFailure", Severity::Critical),
        ("ValidationError", Severity::Warning),
        ("TimeoutError", Severity::Warning),
        ("ConnectionError", Severity::Warning),
        ("NetworkError", Severity::Warning),
        ("DeprecationWarning", Severity::Info),
        ("CallbackFailure", Severity::Info),
        ("Cancelled", Severity::Info),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Maps (explicit severity, error type) to a Severity
#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    table: HashMap<String, Severity>,
    fallback: Severity,
}

impl SeverityClassifier {
    /// Empty table, unknown types classify as `fallback`
    pub fn new(fallback: Severity) -> Self {
        Self {
            table: HashMap::new(),
            fallback,
        }
    }

    /// Table seeded with `default_mappings()`
    pub fn with_defaults() -> Self {
        Self {
            table: default_mappings(),
            fallback: Severity::Error,
        }
    }

    /// Register or override a mapping
    pub fn register(&mut self, error_type: impl Into<String>, severity: Severity) {
        self.table.insert(error_type.into(), severity);
    }

    /// Register many mappings; later entries override earlier ones
    pub fn extend<I, K>(&mut self, mappings: I)
    where
        I: IntoIterator<Item = (K, Severity)>,
        K: Into<String>,
    {
        for (k, v) in mappings {
            self.register(k, v);
        }
    }

    pub fn classify(&self, explicit: Option<Severity>, error_type: &str) -> Severity {
        if let Some(severity) = explicit {
            return severity;
        }
        self.table.get(error_type).copied().unwrap_or(self.fallback)
    }

    pub fn fallback(&self) -> Severity {
        self.fallback
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for SeverityClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}
