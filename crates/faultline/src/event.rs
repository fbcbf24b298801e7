//! Error events
//!
//! An ErrorEvent is created once per submission and never mutated afterwards.
//! Synthetic events (aggregation summaries, batch summaries, internal failures)
//! are new events with their own id that point back at what they summarize.

use crate::error::{CallbackError, ComponentError, ConfigError, ExportError, PersistenceError};
use crate::severity::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque key -> value context attached to an event
pub type EventContext = BTreeMap<String, String>;

/// Context key holding the free-form context string of `submit_error`
pub const CONTEXT_KEY: &str = "context";

/// Context key holding a malformed component path that was replaced
pub const MALFORMED_COMPONENT_KEY: &str = "malformed_component";

/// Context key pointing a summary at the event it represents
pub const SUMMARY_OF_KEY: &str = "summary_of";

/// Context key carrying the aggregation fingerprint on summaries
pub const FINGERPRINT_KEY: &str = "fingerprint";

// ============================================================================
// Event ID
// ============================================================================

/// Unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event
// ============================================================================

/// How an event entered the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Submitted by a producer
    #[default]
    Reported,
    /// Emitted when an aggregation bucket with count > 1 expires
    AggregatedSummary,
    /// Emitted when a rate-limit batch window closes
    BatchSummary,
    /// Raised by the engine itself (callback or persistence failure)
    Internal,
}

/// An error report flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: EventId,

    /// Explicit error tag used for classification and aggregation
    pub error_type: String,

    pub message: String,

    pub severity: Severity,

    /// Dotted component path, empty when the producer gave none
    #[serde(default)]
    pub component: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub context: EventContext,

    /// Thread that submitted the event
    #[serde(default)]
    pub origin: String,

    #[serde(default)]
    pub kind: EventKind,

    /// Number of occurrences this event stands for (1 unless it is a summary)
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
}

fn default_occurrences() -> u32 {
    1
}

impl ErrorEvent {
    /// Build a reported event stamped with the calling thread
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        component: impl Into<String>,
        context: EventContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            error_type: error_type.into(),
            message: message.into(),
            severity,
            component: component.into(),
            timestamp,
            context,
            origin: current_origin(),
            kind: EventKind::Reported,
            occurrences: 1,
        }
    }

    /// Synthetic event standing for `occurrences` repeats of `representative`
    pub fn summary_of(
        representative: &ErrorEvent,
        kind: EventKind,
        occurrences: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut context = representative.context.clone();
        context.insert(SUMMARY_OF_KEY.to_string(), representative.id.to_string());
        Self {
            id: EventId::new(),
            error_type: representative.error_type.clone(),
            message: representative.message.clone(),
            severity: representative.severity,
            component: representative.component.clone(),
            timestamp,
            context,
            origin: current_origin(),
            kind,
            occurrences,
        }
    }

    /// Copy of this event standing for `occurrences` occurrences.
    ///
    /// Used when a CRITICAL event interrupts a pending batch: the id is kept so
    /// the presented event still matches its history entry.
    pub fn coalesced(&self, occurrences: u32) -> Self {
        Self {
            occurrences,
            ..self.clone()
        }
    }

    pub fn is_internal(&self) -> bool {
        self.kind == EventKind::Internal
    }

    pub fn is_summary(&self) -> bool {
        matches!(
            self.kind,
            EventKind::AggregatedSummary | EventKind::BatchSummary
        )
    }
}

/// "thread:<name>" or "thread:<id>" for the calling thread
pub fn current_origin() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => format!("thread:{}", name),
        None => format!("thread:{:?}", thread.id()),
    }
}

// ============================================================================
// Error tags
// ============================================================================

/// Explicit classification tag for errors passed to `submit_error`.
///
/// Replaces runtime type inspection: every error that enters the engine through
/// the auto-classification path names its own type tag.
pub trait ErrorTag: std::error::Error {
    /// Stable type tag used for classification, e.g. "NotFoundError"
    fn error_type(&self) -> String;

    /// Severity the error itself suggests; the classifier table is used when None
    fn severity_hint(&self) -> Option<Severity> {
        None
    }
}

impl ErrorTag for std::io::Error {
    fn error_type(&self) -> String {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::PermissionDenied => "PermissionError",
            ErrorKind::TimedOut | ErrorKind::WouldBlock => "TimeoutError",
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe => "ConnectionError",
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => "CorruptionError",
            ErrorKind::InvalidInput => "ValidationError",
            ErrorKind::OutOfMemory => "OutOfMemoryError",
            _ => "IoError",
        }
        .to_string()
    }
}

impl ErrorTag for serde_json::Error {
    fn error_type(&self) -> String {
        "ParseError".to_string()
    }
}

impl ErrorTag for ComponentError {
    fn error_type(&self) -> String {
        "ClassificationFailure".to_string()
    }

    fn severity_hint(&self) -> Option<Severity> {
        Some(Severity::Warning)
    }
}

impl ErrorTag for CallbackError {
    fn error_type(&self) -> String {
        "CallbackFailure".to_string()
    }

    fn severity_hint(&self) -> Option<Severity> {
        Some(Severity::Info)
    }
}

impl ErrorTag for PersistenceError {
    fn error_type(&self) -> String {
        "PersistenceFailure".to_string()
    }

    fn severity_hint(&self) -> Option<Severity> {
        Some(Severity::Critical)
    }
}

impl ErrorTag for ExportError {
    fn error_type(&self) -> String {
        match self {
            ExportError::Cancelled => "Cancelled",
            _ => "ExportFailure",
        }
        .to_string()
    }
}

impl ErrorTag for ConfigError {
    fn error_type(&self) -> String {
        "ConfigError".to_string()
    }
}

/// Display text of `err` followed by its source chain, joined with ": "
pub fn describe_error(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        // thiserror messages often already embed their source
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
