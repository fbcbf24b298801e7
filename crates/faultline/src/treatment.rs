//! Treatment Resolver
//!
//! Pure mapping from severity (plus per-severity overrides) to a presentation
//! policy. The engine hands the descriptor to the presenter; it never acts on
//! it itself.

use crate::config::TreatmentConfig;
use crate::severity::Severity;
use serde::{Deserialize, Serialize};

/// Kind of surface the UI should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    Notification,
    Modal,
}

/// Where a notification should appear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    Center,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

/// How a UI layer should present an event of a given severity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentDescriptor {
    pub dialog_kind: DialogKind,
    pub blocking: bool,
    /// Auto-dismiss after this many milliseconds, None = stays until dismissed
    pub timeout_ms: Option<u64>,
    pub position: Position,
    pub icon: String,
    pub color: String,
    /// Producers should pause in-flight work (CRITICAL only)
    pub pause_recommended: bool,
}

/// Built-in treatment for a severity before overrides
pub fn default_treatment(severity: Severity) -> TreatmentDescriptor {
    match severity {
        Severity::Info => TreatmentDescriptor {
            dialog_kind: DialogKind::Notification,
            blocking: false,
            timeout_ms: Some(3_000),
            position: Position::BottomRight,
            icon: "info".to_string(),
            color: "#2196F3".to_string(),
            pause_recommended: false,
        },
        Severity::Warning => TreatmentDescriptor {
            dialog_kind: DialogKind::Notification,
            blocking: false,
            timeout_ms: Some(5_000),
            position: Position::TopRight,
            icon: "warning".to_string(),
            color: "#FF9800".to_string(),
            pause_recommended: false,
        },
        Severity::Error => TreatmentDescriptor {
            dialog_kind: DialogKind::Modal,
            blocking: true,
            timeout_ms: None,
            position: Position::Center,
            icon: "error".to_string(),
            color: "#F44336".to_string(),
            pause_recommended: false,
        },
        Severity::Critical => TreatmentDescriptor {
            dialog_kind: DialogKind::Modal,
            blocking: true,
            timeout_ms: None,
            position: Position::Center,
            icon: "critical".to_string(),
            color: "#B71C1C".to_string(),
            pause_recommended: true,
        },
    }
}

/// Resolve the treatment for `severity`, applying configured overrides
pub fn resolve(severity: Severity, config: &TreatmentConfig) -> TreatmentDescriptor {
    let mut descriptor = default_treatment(severity);
    let overrides = config.for_severity(severity);

    if let Some(kind) = overrides.dialog_kind {
        descriptor.dialog_kind = kind;
        // A notification is non-blocking unless explicitly told otherwise
        if overrides.blocking.is_none() {
            descriptor.blocking = kind == DialogKind::Modal;
        }
    }
    if let Some(blocking) = overrides.blocking {
        descriptor.blocking = blocking;
    }
    if overrides.timeout_ms.is_some() {
        descriptor.timeout_ms = overrides.timeout_ms;
    }
    if let Some(position) = overrides.position {
        descriptor.position = position;
    }
    if let Some(icon) = &overrides.icon {
        descriptor.icon = icon.clone();
    }
    if let Some(color) = &overrides.color {
        descriptor.color = color.clone();
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeverityTreatment;

    #[test]
    fn test_defaults_by_severity() {
        let config = TreatmentConfig::default();

        let info = resolve(Severity::Info, &config);
        assert_eq!(info.dialog_kind, DialogKind::Notification);
        assert!(!info.blocking);
        assert!(info.timeout_ms.is_some());

        let warning = resolve(Severity::Warning, &config);
        assert!(!warning.blocking);
        assert!(warning.timeout_ms.is_some());

        let error = resolve(Severity::Error, &config);
        assert_eq!(error.dialog_kind, DialogKind::Modal);
        assert!(error.blocking);
        assert!(!error.pause_recommended);

        let critical = resolve(Severity::Critical, &config);
        assert!(critical.blocking);
        assert!(critical.pause_recommended);
    }

    #[test]
    fn test_overrides_apply() {
        let config = TreatmentConfig {
            warning: SeverityTreatment {
                timeout_ms: Some(8_000),
                position: Some(Position::TopCenter),
                ..SeverityTreatment::default()
            },
            ..TreatmentConfig::default()
        };
        let warning = resolve(Severity::Warning, &config);
        assert_eq!(warning.timeout_ms, Some(8_000));
        assert_eq!(warning.position, Position::TopCenter);
        assert_eq!(warning.icon, "warning");
    }

    #[test]
    fn test_dialog_kind_override_implies_blocking() {
        let config = TreatmentConfig {
            error: SeverityTreatment {
                dialog_kind: Some(DialogKind::Notification),
                ..SeverityTreatment::default()
            },
            ..TreatmentConfig::default()
        };
        let error = resolve(Severity::Error, &config);
        assert_eq!(error.dialog_kind, DialogKind::Notification);
        assert!(!error.blocking);
    }

    #[test]
    fn test_resolution_is_pure() {
        let config = TreatmentConfig::default();
        assert_eq!(
            resolve(Severity::Critical, &config),
            resolve(Severity::Critical, &config)
        );
    }
}
