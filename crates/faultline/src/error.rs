//! Error taxonomy
//!
//! One enum per failure family:
//! - ComponentError: malformed component path (recovered locally by the pipeline)
//! - CallbackError: a recovery hook panicked or returned Err (converted to an INFO event)
//! - PersistenceError: durable critical-history write/read failed (retried in background)
//! - ExportError: returned synchronously to the caller of export
//! - ConfigError: configuration rejected at load time
//! - EngineError: lifecycle failures (start without a runtime, store open failure)

use std::path::PathBuf;

/// Malformed component path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    #[error("component path is empty")]
    Empty,

    #[error("component path '{path}' has an empty segment at position {position}")]
    EmptySegment { path: String, position: usize },
}

/// Failure raised while invoking a registered callback
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    #[error("callback {id} panicked: {message}")]
    Panicked { id: u64, message: String },

    #[error("callback {id} failed: {message}")]
    Failed { id: u64, message: String },
}

impl CallbackError {
    pub fn callback_id(&self) -> u64 {
        match self {
            CallbackError::Panicked { id, .. } | CallbackError::Failed { id, .. } => *id,
        }
    }
}

/// Durable critical-history failures
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on durable store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Export failures, surfaced to the caller and never submitted into the pipeline
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write export to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize export: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("export cancelled")]
    Cancelled,

    #[error("export worker failed: {0}")]
    Worker(String),
}

/// Configuration rejected at load time
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Engine lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine must be started inside a tokio runtime")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open durable store: {0}")]
    Store(#[from] PersistenceError),
}

/// Query was cancelled before it finished scanning the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("query cancelled")]
pub struct QueryCancelled;
