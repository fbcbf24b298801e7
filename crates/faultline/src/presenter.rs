//! Presenter interface
//!
//! The only surface the engine talks to when something should be shown to a
//! user. Called from the submitting thread or the janitor, never concurrently
//! for the same event; implementations must not block for long.

use crate::event::ErrorEvent;
use crate::severity::Severity;
use crate::treatment::TreatmentDescriptor;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Sink for emitted notifications
pub trait Presenter: Send + Sync {
    fn present(&self, event: &ErrorEvent, treatment: &TreatmentDescriptor);
}

/// Writes notifications to the tracing pipeline (default)
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn present(&self, event: &ErrorEvent, treatment: &TreatmentDescriptor) {
        let component = if event.component.is_empty() {
            "-"
        } else {
            event.component.as_str()
        };
        match event.severity {
            Severity::Info => info!(
                id = %event.id,
                error_type = %event.error_type,
                component,
                occurrences = event.occurrences,
                timeout_ms = ?treatment.timeout_ms,
                "{}",
                event.message
            ),
            Severity::Warning => warn!(
                id = %event.id,
                error_type = %event.error_type,
                component,
                occurrences = event.occurrences,
                timeout_ms = ?treatment.timeout_ms,
                "{}",
                event.message
            ),
            Severity::Error | Severity::Critical => error!(
                id = %event.id,
                severity = %event.severity,
                error_type = %event.error_type,
                component,
                occurrences = event.occurrences,
                blocking = treatment.blocking,
                pause = treatment.pause_recommended,
                "{}",
                event.message
            ),
        }
    }
}

/// Drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn present(&self, _event: &ErrorEvent, _treatment: &TreatmentDescriptor) {}
}

/// Keeps every presented notification, in order
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    presented: Mutex<Vec<(ErrorEvent, TreatmentDescriptor)>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> Vec<(ErrorEvent, TreatmentDescriptor)> {
        self.presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.presented().into_iter().map(|(e, _)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.presented.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Presenter for RecordingPresenter {
    fn present(&self, event: &ErrorEvent, treatment: &TreatmentDescriptor) {
        self.presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((event.clone(), treatment.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreatmentConfig;
    use crate::event::EventContext;
    use crate::treatment;
    use chrono::Utc;

    #[test]
    fn test_recording_presenter_keeps_order() {
        let presenter = RecordingPresenter::new();
        for i in 0..3 {
            let event = ErrorEvent::new(
                "IoError",
                format!("event {}", i),
                Severity::Error,
                "",
                EventContext::new(),
                Utc::now(),
            );
            let t = treatment::resolve(event.severity, &TreatmentConfig::default());
            presenter.present(&event, &t);
        }
        let messages: Vec<String> = presenter.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["event 0", "event 1", "event 2"]);

        presenter.clear();
        assert!(presenter.is_empty());
    }

    #[test]
    fn test_tracing_presenter_does_not_panic() {
        let event = ErrorEvent::new(
            "NetworkError",
            "timeout",
            Severity::Warning,
            "ai.client",
            EventContext::new(),
            Utc::now(),
        );
        let t = treatment::resolve(event.severity, &TreatmentConfig::default());
        TracingPresenter.present(&event, &t);
        NullPresenter.present(&event, &t);
    }
}
