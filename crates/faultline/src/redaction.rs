//! Export anonymization
//!
//! Scrubs user paths, emails and other identifying data from events before
//! they leave the process. Severity, component and timestamp are structural
//! and are never touched.

use crate::config::RedactionConfig;
use crate::error::ConfigError;
use crate::event::ErrorEvent;
use regex::Regex;
use std::collections::HashSet;

/// Compiled redaction rules
#[derive(Debug, Clone)]
pub struct Redactor {
    /// Lowercased context keys whose values are replaced wholesale
    keys: HashSet<String>,
    patterns: Vec<Regex>,
    token: String,
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::invalid("redaction.patterns", e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            keys: config.keys.iter().map(|k| k.to_lowercase()).collect(),
            patterns,
            token: config.token.clone(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Replace every pattern match in `text` with the token
    pub fn redact_text(&self, text: &str) -> String {
        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern
                .replace_all(&result, self.token.as_str())
                .into_owned();
        }
        result
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.keys.contains(&key.to_lowercase())
    }

    /// Anonymized copy of `event`
    pub fn redact_event(&self, event: &ErrorEvent) -> ErrorEvent {
        let mut redacted = event.clone();
        redacted.message = self.redact_text(&event.message);
        redacted.origin = self.redact_text(&event.origin);
        for (key, value) in redacted.context.iter_mut() {
            *value = if self.is_sensitive_key(key) {
                self.token.clone()
            } else {
                self.redact_text(value)
            };
        }
        redacted
    }
}
