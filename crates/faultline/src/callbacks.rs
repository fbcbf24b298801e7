//! Callback Dispatcher v0.4.0
//!
//! Ordered, filtered recovery hooks.
//!
//! - Registrations are kept sorted: priority descending, then registration order
//! - Filters are optional and AND-combined (error type, severity, component subtree)
//! - A panic or Err in one callback is caught, reported through the failure hook
//!   and never aborts the remaining callbacks
//! - Internal events (callback/persistence failures raised by the engine) are
//!   never dispatched, so a failing callback cannot feed itself
//! - Callbacks declaring a cost above `slow_threshold_ms`, or that overran
//!   `budget_ms` once, run on the blocking pool instead of the caller's stack

use crate::component::is_descendant_or_equal;
use crate::config::CallbackConfig;
use crate::error::CallbackError;
use crate::event::ErrorEvent;
use crate::severity::Severity;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Identifier handed out by `register`
pub type CallbackId = u64;

/// Recovery hook; an Err is handled exactly like a panic
pub type CallbackHandler = Arc<dyn Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync>;

/// Receives every callback failure
pub type FailureHook = Arc<dyn Fn(CallbackError) + Send + Sync>;

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityFilter {
    Exactly(Severity),
    AtLeast(Severity),
}

impl SeverityFilter {
    pub fn matches(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::Exactly(s) => severity == *s,
            SeverityFilter::AtLeast(s) => severity >= *s,
        }
    }
}

/// Which events a callback wants; None is a wildcard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackFilter {
    pub error_type: Option<String>,
    pub severity: Option<SeverityFilter>,
    /// Matches this component and everything below it
    pub component: Option<String>,
}

impl CallbackFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn severity(mut self, filter: SeverityFilter) -> Self {
        self.severity = Some(filter);
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn matches(&self, event: &ErrorEvent) -> bool {
        if let Some(t) = &self.error_type {
            if *t != event.error_type {
                return false;
            }
        }
        if let Some(s) = &self.severity {
            if !s.matches(event.severity) {
                return false;
            }
        }
        if let Some(c) = &self.component {
            if !is_descendant_or_equal(&event.component, c) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Registrations
// ============================================================================

/// A callback before registration
#[derive(Clone)]
pub struct Callback {
    pub name: String,
    pub filter: CallbackFilter,
    /// Higher runs first
    pub priority: i32,
    /// Declared cost; above `slow_threshold_ms` the callback always runs in the background
    pub expected_cost_ms: u64,
    handler: CallbackHandler,
}

impl Callback {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filter: CallbackFilter::any(),
            priority: 0,
            expected_cost_ms: 0,
            handler: Arc::new(handler),
        }
    }

    pub fn filter(mut self, filter: CallbackFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expected_cost_ms(mut self, cost: u64) -> Self {
        self.expected_cost_ms = cost;
        self
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("priority", &self.priority)
            .field("expected_cost_ms", &self.expected_cost_ms)
            .finish()
    }
}

struct CallbackRegistration {
    id: CallbackId,
    sequence: u64,
    callback: Callback,
    /// Set after the callback overran its budget once
    demoted: AtomicBool,
}

impl CallbackRegistration {
    fn invoke(&self, event: &ErrorEvent) -> Result<(), CallbackError> {
        let handler = &self.callback.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallbackError::Failed {
                id: self.id,
                message: format!("{:#}", e),
            }),
            Err(payload) => Err(CallbackError::Panicked {
                id: self.id,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Registrations whose filter matched
    pub matched: usize,
    /// Ran synchronously
    pub invoked: usize,
    /// Synchronous invocations that failed
    pub failed: usize,
    /// Handed to the blocking pool
    pub deferred: usize,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct CallbackDispatcher {
    config: CallbackConfig,
    registrations: RwLock<Vec<Arc<CallbackRegistration>>>,
    next_id: AtomicU64,
    runtime: Option<Handle>,
    failure_hook: RwLock<Option<FailureHook>>,
}

impl CallbackDispatcher {
    /// Dispatcher without a runtime: every callback runs inline
    pub fn new(config: CallbackConfig) -> Self {
        Self {
            config,
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            runtime: None,
            failure_hook: RwLock::new(None),
        }
    }

    /// Slow callbacks are moved to this runtime's blocking pool
    pub fn with_runtime(config: CallbackConfig, runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..Self::new(config)
        }
    }

    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self.failure_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn register(&self, callback: Callback) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(CallbackRegistration {
            id,
            sequence: id,
            callback,
            demoted: AtomicBool::new(false),
        });

        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        registrations.push(registration);
        registrations.sort_by(|a, b| {
            b.callback
                .priority
                .cmp(&a.callback.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids in invocation order
    pub fn order(&self) -> Vec<CallbackId> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.id)
            .collect()
    }

    /// Invoke every matching callback
    pub fn dispatch(&self, event: &ErrorEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        if event.is_internal() {
            return report;
        }

        // Snapshot so callbacks may register/unregister without deadlocking
        let matching: Vec<Arc<CallbackRegistration>> = self
            .registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.callback.filter.matches(event))
            .cloned()
            .collect();
        report.matched = matching.len();

        let budget = Duration::from_millis(self.config.budget_ms);
        for registration in matching {
            let slow = registration.callback.expected_cost_ms > self.config.slow_threshold_ms
                || registration.demoted.load(Ordering::Relaxed);

            if slow {
                if let Some(runtime) = &self.runtime {
                    let event = event.clone();
                    let hook = self.hook();
                    runtime.spawn_blocking(move || {
                        if let Err(e) = registration.invoke(&event) {
                            report_failure(hook.as_ref(), e);
                        }
                    });
                    report.deferred += 1;
                    continue;
                }
                debug!(
                    callback = %registration.callback.name,
                    "No runtime for slow callback, running inline"
                );
            }

            let started = Instant::now();
            let result = registration.invoke(event);
            let elapsed = started.elapsed();
            report.invoked += 1;

            if elapsed > budget && !registration.demoted.swap(true, Ordering::Relaxed) {
                warn!(
                    callback = %registration.callback.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.config.budget_ms,
                    "Callback exceeded its budget, moving it to the background"
                );
            }

            if let Err(e) = result {
                report.failed += 1;
                report_failure(self.hook().as_ref(), e);
            }
        }
        report
    }

    fn hook(&self) -> Option<FailureHook> {
        self.failure_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn report_failure(hook: Option<&FailureHook>, error: CallbackError) {
    warn!(callback_id = error.callback_id(), error = %error, "Callback failed");
    if let Some(hook) = hook {
        hook(error);
    }
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("config", &self.config)
            .field("registrations", &self.len())
            .field("has_runtime", &self.runtime.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
