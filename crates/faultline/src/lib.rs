//! Faultline - error classification and reporting engine v0.4.0
//!
//! Classifies errors submitted from many producers, merges repeats, rate-limits
//! notifications, dispatches recovery callbacks and keeps a bounded history
//! with durable retention of CRITICAL events.

pub mod aggregator;
pub mod callbacks;
pub mod clock;
pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod history;
pub mod presenter;
pub mod rate_limit;
pub mod redaction;
pub mod severity;
pub mod treatment;
pub mod worker;

pub use aggregator::{AggregationBucket, MessageNormalizer};
pub use callbacks::{Callback, CallbackFilter, CallbackId, SeverityFilter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FaultlineConfig;
pub use engine::{EngineBuilder, ErrorEngine, TickReport, CALLBACK_COMPONENT, PERSISTENCE_COMPONENT};
pub use error::*;
pub use event::{ErrorEvent, ErrorTag, EventContext, EventId, EventKind};
pub use history::{
    DurableStore, ExportFormat, ExportOptions, HistoryEntry, HistoryFilter, HistoryReport,
};
pub use presenter::{NullPresenter, Presenter, RecordingPresenter, TracingPresenter};
pub use severity::Severity;
pub use treatment::TreatmentDescriptor;
