//! Rate Limiter v0.4.0
//!
//! Fixed-window notification limiter keyed by severity (or severity + component).
//!
//! - Up to `threshold` EMIT decisions per window
//! - Overflow answers BATCH (a single summary goes out at window end), or
//!   SUPPRESS with a cooldown of `window * 2^backoff_level` when exponential
//!   backoff is enabled
//! - Backoff level rises after an overflowing window, decays by one after a
//!   calm window and resets to zero once a whole window passes with no events
//! - CRITICAL is never suppressed, at worst batched

use crate::config::{RateLimitConfig, RateLimitKeyMode};
use crate::event::ErrorEvent;
use crate::severity::Severity;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

// ============================================================================
// Keys and decisions
// ============================================================================

/// Rate-limit bucket key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub severity: Severity,
    /// None when keyed by severity only
    pub component: Option<String>,
}

impl RateLimitKey {
    pub fn new(severity: Severity, component: Option<&str>) -> Self {
        Self {
            severity,
            component: component.map(str::to_string),
        }
    }

    pub fn for_event(event: &ErrorEvent, mode: RateLimitKeyMode) -> Self {
        match mode {
            RateLimitKeyMode::Severity => Self::new(event.severity, None),
            RateLimitKeyMode::SeverityComponent => {
                Self::new(event.severity, Some(&event.component))
            }
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(c) => write!(f, "{}/{}", self.severity, c),
            None => write!(f, "{}", self.severity),
        }
    }
}

/// Outcome of admitting one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Present now
    Emit,
    /// Hold; a single summary is presented at `flush_at`
    Batch { flush_at: DateTime<Utc> },
    /// Record only, nothing is presented before `until`
    Suppress { until: DateTime<Utc> },
}

impl Decision {
    pub fn is_emit(&self) -> bool {
        matches!(self, Decision::Emit)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Decision::Batch { .. })
    }

    pub fn is_suppress(&self) -> bool {
        matches!(self, Decision::Suppress { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Emit => "emit",
            Decision::Batch { .. } => "batch",
            Decision::Suppress { .. } => "suppress",
        }
    }
}

// ============================================================================
// Window state
// ============================================================================

/// `window * factor`, saturating instead of overflowing
fn scaled(window: Duration, factor: i32) -> Duration {
    window.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// `at + span`, saturating at the latest representable instant
fn later(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    at.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-key window bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub window_start: DateTime<Utc>,
    pub count_in_window: u32,
    pub backoff_level: u32,
    pub next_allowed_at: Option<DateTime<Utc>>,
    /// Current window exceeded the threshold
    pub overflowed: bool,
    pub last_seen: DateTime<Utc>,
}

impl RateLimitState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count_in_window: 0,
            backoff_level: 0,
            next_allowed_at: None,
            overflowed: false,
            last_seen: now,
        }
    }

    /// Roll the window forward if it has ended
    fn roll(&mut self, now: DateTime<Utc>, window: Duration, max_level: u32) {
        let elapsed = now - self.window_start;
        if elapsed <= window {
            return;
        }
        if elapsed > scaled(window, 2) {
            // A whole window went by without a single event
            self.backoff_level = 0;
        } else if self.overflowed {
            self.backoff_level = (self.backoff_level + 1).min(max_level);
        } else {
            self.backoff_level = self.backoff_level.saturating_sub(1);
        }
        self.window_start = now;
        self.count_in_window = 0;
        self.overflowed = false;
    }
}

/// Mutex-guarded per-key limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    states: Mutex<HashMap<RateLimitKey, RateLimitState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.config.window_ms).unwrap_or(i64::MAX))
    }

    /// Count one notification for `key` and decide what to do with it
    pub fn admit(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Decision {
        if !self.config.enabled {
            return Decision::Emit;
        }

        let window = self.window();
        let max_level = self.config.effective_max_backoff_level();
        let backoff = self.config.use_exponential_backoff;
        let suppressible = !key.severity.is_critical();

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(key.clone())
            .or_insert_with(|| RateLimitState::new(now));

        state.roll(now, window, max_level);
        state.count_in_window += 1;
        state.last_seen = now;

        let over_threshold = state.count_in_window > self.config.threshold;
        if over_threshold {
            state.overflowed = true;
        }

        if backoff && suppressible {
            if let Some(until) = state.next_allowed_at {
                if now < until {
                    return Decision::Suppress { until };
                }
            }
        }

        if !over_threshold {
            return Decision::Emit;
        }

        if backoff && suppressible {
            let factor = 2i32.checked_pow(state.backoff_level).unwrap_or(i32::MAX);
            let until = later(state.window_start, scaled(window, factor));
            state.next_allowed_at = Some(until);
            Decision::Suppress { until }
        } else {
            Decision::Batch {
                flush_at: later(state.window_start, window),
            }
        }
    }

    /// Snapshot of the state for `key`
    pub fn state(&self, key: &RateLimitKey) -> Option<RateLimitState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Drop keys idle for four windows with no backoff pending; returns how many
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let idle = scaled(self.window(), 4);
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let before = states.len();
        states.retain(|_, s| {
            let quiet = now - s.last_seen > idle;
            let cooled = s.next_allowed_at.map(|t| t <= now).unwrap_or(true);
            !(quiet && cooled)
        });
        before - states.len()
    }

    pub fn key_count(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ============================================================================
// Batch accumulation
// ============================================================================

/// Events held back by BATCH decisions for one key
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub key: RateLimitKey,
    /// Most recent batched event, used as the summary's representative
    pub latest: ErrorEvent,
    pub count: u32,
    pub flush_at: DateTime<Utc>,
}

/// Pending batches, flushed by the janitor at window end
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    pending: Mutex<HashMap<RateLimitKey, PendingBatch>>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `occurrences` held back by `event` to the batch for `key`; returns
    /// the batch size
    pub fn add(
        &self,
        key: &RateLimitKey,
        event: &ErrorEvent,
        occurrences: u32,
        flush_at: DateTime<Utc>,
    ) -> u32 {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
            key: key.clone(),
            latest: event.clone(),
            count: 0,
            flush_at,
        });
        batch.latest = event.clone();
        batch.count = batch.count.saturating_add(occurrences);
        batch.count
    }

    /// Remove the batch for `key` (used when a CRITICAL event interrupts it)
    pub fn take(&self, key: &RateLimitKey) -> Option<PendingBatch> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Remove batches whose window has closed
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<PendingBatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<RateLimitKey> = pending
            .iter()
            .filter(|(_, b)| b.flush_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut batches: Vec<PendingBatch> = due.iter().filter_map(|k| pending.remove(k)).collect();
        batches.sort_by_key(|b| b.flush_at);
        batches
    }

    /// Remove every batch (shutdown)
    pub fn drain(&self) -> Vec<PendingBatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut batches: Vec<PendingBatch> = pending.drain().map(|(_, b)| b).collect();
        batches.sort_by_key(|b| b.flush_at);
        batches
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
