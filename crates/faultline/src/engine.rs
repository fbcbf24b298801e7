//! Error Engine v0.4.0
//!
//! Explicitly constructed pipeline, no global instance:
//!
//! ```text
//! submit -> classify -> resolve component -> aggregate -> rate limit
//!        -> present + callbacks (EMIT) | batch | suppress
//!        -> history (always) -> durable store (CRITICAL, background)
//! ```
//!
//! Lifecycle: `ErrorEngine::builder(config).start().await` registers severity
//! mappings, loads durable critical history and spawns the janitor and the
//! persistence worker; `shutdown().await` stops the janitor, drains pending
//! aggregation summaries and batches, and waits for queued durable writes.

use crate::aggregator::{AggregationBucket, Aggregator, MessageNormalizer};
use crate::callbacks::{Callback, CallbackDispatcher, CallbackId};
use crate::clock::{Clock, SystemClock};
use crate::component::ComponentRegistry;
use crate::config::FaultlineConfig;
use crate::error::{
    CallbackError, ComponentError, EngineError, ExportError, PersistenceError, QueryCancelled,
};
use crate::event::{
    describe_error, ErrorEvent, ErrorTag, EventContext, EventId, EventKind, CONTEXT_KEY,
    FINGERPRINT_KEY, MALFORMED_COMPONENT_KEY,
};
use crate::history::{
    open_store, DurableStore, ExportOptions, HistoryEntry, HistoryFilter, HistoryReport,
    HistoryStore,
};
use crate::presenter::{Presenter, TracingPresenter};
use crate::rate_limit::{BatchAccumulator, Decision, PendingBatch, RateLimitKey, RateLimiter};
use crate::redaction::Redactor;
use crate::severity::{default_mappings, Severity, SeverityClassifier};
use crate::treatment;
use crate::worker::{FailureSink, PersistenceWorker, RetryPolicy, WorkerStats};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Component of the event raised when a durable write is abandoned
pub const PERSISTENCE_COMPONENT: &str = "errorhandler.persistence";

/// Component of the internal events raised for failing callbacks
pub const CALLBACK_COMPONENT: &str = "errorhandler.callbacks";

const REPORT_TOP_COMPONENTS: usize = 10;

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder {
    config: FaultlineConfig,
    presenter: Option<Arc<dyn Presenter>>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn DurableStore>>,
    normalizer: Option<Arc<dyn MessageNormalizer>>,
}

impl EngineBuilder {
    /// Where emitted notifications go (default: tracing)
    pub fn presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the store configured in `[history]`
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the aggregation normalizer selected by `aggregation.mode`
    pub fn normalizer(mut self, normalizer: Arc<dyn MessageNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Build the engine and spawn its background tasks on the current runtime
    pub async fn start(self) -> Result<ErrorEngine, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let config = self.config;
        config.validate()?;

        let mut classifier = SeverityClassifier::new(config.classifier.default_severity);
        classifier.extend(default_mappings());
        classifier.extend(config.classifier.mappings.clone());

        let redactor = Redactor::new(&config.redaction)?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.history)?,
        };

        let loader = store.clone();
        let persisted = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))??;

        let history = HistoryStore::new(config.history.capacity, store.clone());
        let restored = persisted.len();
        for entry in persisted {
            history.append(entry);
        }

        let aggregator = match self.normalizer {
            Some(normalizer) => Aggregator::with_normalizer(config.aggregation.clone(), normalizer),
            None => Aggregator::new(config.aggregation.clone()),
        };

        let presenter: Arc<dyn Presenter> = match self.presenter {
            Some(presenter) => presenter,
            None => Arc::new(TracingPresenter),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let policy = RetryPolicy::from_config(&config.history);
        let queue = config.history.worker_queue;
        let store_name = store.describe();

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let sink_engine = weak.clone();
            let on_failure: FailureSink = Arc::new(move |entry, err| {
                if let Some(engine) = sink_engine.upgrade() {
                    engine.report_persistence_failure(entry, err);
                }
            });
            let worker = PersistenceWorker::spawn(runtime.clone(), store, policy, queue, on_failure);

            let dispatcher =
                CallbackDispatcher::with_runtime(config.callbacks.clone(), runtime.clone());
            let hook_engine = weak.clone();
            dispatcher.set_failure_hook(Arc::new(move |err| {
                if let Some(engine) = hook_engine.upgrade() {
                    engine.report_callback_failure(err);
                }
            }));

            EngineInner {
                limiter: RateLimiter::new(config.rate_limit.clone()),
                classifier: RwLock::new(classifier),
                registry: ComponentRegistry::new(),
                aggregator,
                batches: BatchAccumulator::new(),
                dispatcher,
                history,
                presenter,
                redactor,
                worker,
                clock,
                cancel: CancellationToken::new(),
                janitor: Mutex::new(None),
                stopped: AtomicBool::new(false),
                runtime: runtime.clone(),
                config,
            }
        });

        let janitor = spawn_janitor(&inner);
        *inner.janitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(janitor);

        info!(
            store = %store_name,
            restored,
            capacity = inner.config.history.capacity,
            "Error engine started"
        );
        Ok(ErrorEngine { inner })
    }
}

fn spawn_janitor(inner: &Arc<EngineInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let period = Duration::from_millis(inner.config.janitor.effective_interval_ms());

    inner.runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(engine) = weak.upgrade() else { break };
                    engine.tick();
                }
            }
        }
        debug!("Janitor stopped");
    })
}

// ============================================================================
// Engine
// ============================================================================

/// Result of one janitor pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired_buckets: usize,
    /// Aggregation summaries produced (buckets with count > 1)
    pub summaries: usize,
    pub flushed_batches: usize,
    pub swept_keys: usize,
}

struct EngineInner {
    config: FaultlineConfig,
    clock: Arc<dyn Clock>,
    classifier: RwLock<SeverityClassifier>,
    registry: ComponentRegistry,
    aggregator: Aggregator,
    limiter: RateLimiter,
    batches: BatchAccumulator,
    dispatcher: CallbackDispatcher,
    history: HistoryStore,
    presenter: Arc<dyn Presenter>,
    redactor: Redactor,
    worker: PersistenceWorker,
    runtime: Handle,
    cancel: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Cheap, cloneable handle to a running engine
#[derive(Clone)]
pub struct ErrorEngine {
    inner: Arc<EngineInner>,
}

impl ErrorEngine {
    pub fn builder(config: FaultlineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            presenter: None,
            clock: None,
            store: None,
            normalizer: None,
        }
    }

    /// Start with defaults for everything but the configuration
    pub async fn start(config: FaultlineConfig) -> Result<Self, EngineError> {
        Self::builder(config).start().await
    }

    /// Submit an error. Never fails: malformed input degrades, and the event is
    /// recorded in history whatever happens to its presentation.
    pub fn submit(
        &self,
        error_type: &str,
        message: &str,
        severity: Option<Severity>,
        component: &str,
        context: EventContext,
    ) -> EventId {
        self.inner
            .submit(error_type, message, severity, component, context, EventKind::Reported)
    }

    /// Submit a typed error; its tag drives classification, its source chain
    /// becomes the message, `context` is kept under the "context" key.
    pub fn submit_error<E: ErrorTag>(
        &self,
        err: &E,
        context: &str,
        severity: Option<Severity>,
        component: &str,
    ) -> EventId {
        let mut ctx = EventContext::new();
        if !context.is_empty() {
            ctx.insert(CONTEXT_KEY.to_string(), context.to_string());
        }
        let severity = severity.or_else(|| err.severity_hint());
        self.submit(&err.error_type(), &describe_error(err), severity, component, ctx)
    }

    pub fn register_component(
        &self,
        path: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ComponentError> {
        self.inner.registry.register(path, metadata)
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.inner.registry
    }

    /// Add or override an error type -> severity mapping
    pub fn register_severity_mapping(&self, error_type: &str, severity: Severity) {
        self.inner
            .classifier
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(error_type, severity);
    }

    pub fn classify(&self, explicit: Option<Severity>, error_type: &str) -> Severity {
        self.inner
            .classifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .classify(explicit, error_type)
    }

    pub fn register_callback(&self, callback: Callback) -> CallbackId {
        self.inner.dispatcher.register(callback)
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.inner.dispatcher.unregister(id)
    }

    /// In-memory history, newest first
    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.inner.history.query(filter)
    }

    pub fn query_cancellable(
        &self,
        filter: &HistoryFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryEntry>, QueryCancelled> {
        self.inner.history.query_cancellable(filter, cancel)
    }

    /// Empty the in-memory history; durable critical records stay
    pub fn clear_history(&self) {
        self.inner.history.clear();
    }

    /// Export the in-memory history off the calling thread
    pub async fn export(
        &self,
        path: impl Into<PathBuf>,
        options: ExportOptions,
        cancel: CancellationToken,
    ) -> Result<usize, ExportError> {
        let path = path.into();
        let format = options.format;
        let inner = self.inner.clone();
        let written = tokio::task::spawn_blocking(move || {
            inner
                .history
                .export(&path, &options, &inner.redactor, &cancel)
        })
        .await
        .map_err(|e| ExportError::Worker(e.to_string()))??;
        debug!(written, format = format.as_str(), "History exported");
        Ok(written)
    }

    /// Durable CRITICAL records (blocking read)
    pub fn critical_history(&self) -> Result<Vec<HistoryEntry>, PersistenceError> {
        self.inner.history.critical_history()
    }

    pub fn purge_critical(&self, id: &EventId) -> Result<bool, PersistenceError> {
        self.inner.history.purge_critical(id)
    }

    pub fn purge_all_critical(&self) -> Result<usize, PersistenceError> {
        self.inner.history.purge_all_critical()
    }

    /// History statistics; the durable store is counted off the calling thread
    pub async fn report(&self) -> HistoryReport {
        let mut report = self.inner.history.memory_report(REPORT_TOP_COMPONENTS);
        let durable = self.inner.history.durable().clone();
        report.durable_critical = match tokio::task::spawn_blocking(move || durable.load_all()).await {
            Ok(Ok(entries)) => Some(entries.len()),
            Ok(Err(e)) => {
                warn!(error = %e, "Durable store unreadable for report");
                None
            }
            Err(e) => {
                warn!(error = %e, "Durable count task failed");
                None
            }
        };
        report
    }

    /// Open aggregation buckets, oldest first
    pub fn aggregation_buckets(&self) -> Vec<AggregationBucket> {
        self.inner.aggregator.snapshot()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.inner.worker.stats()
    }

    pub fn config(&self) -> &FaultlineConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// One janitor pass: expire buckets, flush due batches, sweep idle limiter keys
    pub fn tick(&self) -> TickReport {
        self.inner.tick()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the janitor, drain pending summaries and batches, and wait for
    /// queued durable writes. Submissions after this still reach history.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for ErrorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorEngine")
            .field("history", &self.inner.history)
            .field("callbacks", &self.inner.dispatcher.len())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Occurrences behind `event` that have not yet reached the presenter.
///
/// The first occurrence of an aggregation bucket went through the limiter on
/// its own when the bucket opened, so its summary only carries the rest.
fn unpresented(event: &ErrorEvent) -> u32 {
    match event.kind {
        EventKind::AggregatedSummary => event.occurrences.saturating_sub(1).max(1),
        _ => event.occurrences,
    }
}

impl EngineInner {
    fn submit(
        &self,
        error_type: &str,
        message: &str,
        severity: Option<Severity>,
        component: &str,
        mut context: EventContext,
        kind: EventKind,
    ) -> EventId {
        let now = self.clock.now();
        let severity = self
            .classifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .classify(severity, error_type);

        let component = match self.registry.resolve_or_anonymous(component) {
            Ok(node) => node.name,
            Err(e) => {
                debug!(component, error = %e, "Malformed component, using anonymous root");
                context.insert(MALFORMED_COMPONENT_KEY.to_string(), component.to_string());
                String::new()
            }
        };

        let mut event = ErrorEvent::new(error_type, message, severity, component, context, now);
        event.kind = kind;
        let id = event.id;
        self.process(event, now);
        id
    }

    fn process(&self, event: ErrorEvent, now: DateTime<Utc>) {
        // CRITICAL and internal events are never merged
        if !event.severity.is_critical() && !event.is_internal() {
            let outcome = self.aggregator.offer(&event, now);
            if let Some(expired) = outcome.expired.clone() {
                self.emit_bucket_summary(expired, now);
            }
            if !outcome.is_new_bucket {
                trace!(id = %event.id, count = outcome.count(), "Merged into aggregation bucket");
                self.record(event, false, 1, now);
                return;
            }
        }
        self.admit(event, now);
    }

    /// Rate-limit a new (or summary) event and record it
    fn admit(&self, event: ErrorEvent, now: DateTime<Utc>) {
        let key = RateLimitKey::for_event(&event, self.config.rate_limit.key_by);
        match self.limiter.admit(&key, now) {
            Decision::Emit => {
                self.present(&event);
                let count = event.occurrences;
                self.record(event, true, count, now);
            }
            Decision::Batch { flush_at } if event.severity.is_critical() => {
                // CRITICAL interrupts the batch and takes its pending count along
                let pending = self.batches.take(&key).map(|b| b.count).unwrap_or(0);
                let coalesced = event.coalesced(event.occurrences.saturating_add(pending));
                debug!(
                    id = %coalesced.id,
                    pending,
                    window_end = %flush_at,
                    "CRITICAL interrupts batch"
                );
                self.present(&coalesced);
                let count = coalesced.occurrences;
                self.record(coalesced, true, count, now);
            }
            Decision::Batch { flush_at } => {
                let pending = self.batches.add(&key, &event, unpresented(&event), flush_at);
                trace!(id = %event.id, key = %key, pending, "Batched");
                let count = event.occurrences;
                self.record(event, false, count, now);
            }
            Decision::Suppress { until } => {
                trace!(id = %event.id, key = %key, until = %until, "Suppressed");
                let count = event.occurrences;
                self.record(event, false, count, now);
            }
        }
    }

    fn present(&self, event: &ErrorEvent) {
        let descriptor = treatment::resolve(event.severity, &self.config.treatment);
        let presenter = &self.presenter;
        if panic::catch_unwind(AssertUnwindSafe(|| presenter.present(event, &descriptor))).is_err() {
            error!(id = %event.id, "Presenter panicked");
        }
        self.dispatcher.dispatch(event);
    }

    fn record(&self, event: ErrorEvent, emitted: bool, count: u32, now: DateTime<Utc>) {
        let critical = event.severity.is_critical();
        let entry = HistoryEntry::new(event, emitted, count, now);
        if critical {
            self.worker.submit(entry.clone());
        }
        if let Some(evicted) = self.history.append(entry) {
            trace!(id = %evicted.event.id, severity = %evicted.event.severity, "History entry evicted");
        }
    }

    /// Summary for an expired bucket; a single occurrence was already handled
    fn emit_bucket_summary(&self, bucket: AggregationBucket, now: DateTime<Utc>) -> bool {
        if bucket.count <= 1 {
            return false;
        }
        let mut summary = ErrorEvent::summary_of(
            &bucket.representative,
            EventKind::AggregatedSummary,
            bucket.count,
            now,
        );
        summary
            .context
            .insert(FINGERPRINT_KEY.to_string(), bucket.fingerprint.clone());
        debug!(
            error_type = %summary.error_type,
            component = %summary.component,
            count = bucket.count,
            "Aggregation window closed"
        );
        self.admit(summary, now);
        true
    }

    fn flush_batch(&self, batch: PendingBatch, now: DateTime<Utc>) {
        let summary = ErrorEvent::summary_of(&batch.latest, EventKind::BatchSummary, batch.count, now);
        debug!(key = %batch.key, count = batch.count, "Batch window closed");
        self.present(&summary);
        self.record(summary, true, batch.count, now);
    }

    fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for bucket in self.aggregator.expire(now) {
            report.expired_buckets += 1;
            if self.emit_bucket_summary(bucket, now) {
                report.summaries += 1;
            }
        }
        for batch in self.batches.take_due(now) {
            self.flush_batch(batch, now);
            report.flushed_batches += 1;
        }
        report.swept_keys = self.limiter.sweep(now);
        report
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let janitor = self.janitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(janitor) = janitor {
            if let Err(e) = janitor.await {
                warn!(error = %e, "Janitor ended abnormally");
            }
        }

        let now = self.clock.now();
        let buckets = self.aggregator.drain();
        let drained_buckets = buckets.len();
        for bucket in buckets {
            self.emit_bucket_summary(bucket, now);
        }
        let batches = self.batches.drain();
        let drained_batches = batches.len();
        for batch in batches {
            self.flush_batch(batch, now);
        }

        self.worker.shutdown().await;
        info!(
            buckets = drained_buckets,
            batches = drained_batches,
            history = self.history.len(),
            "Error engine stopped"
        );
    }

    // ========================================================================
    // Internal failures
    // ========================================================================

    fn report_callback_failure(&self, err: CallbackError) {
        let mut context = EventContext::new();
        context.insert("callback_id".to_string(), err.callback_id().to_string());
        self.submit(
            &err.error_type(),
            &err.to_string(),
            err.severity_hint(),
            CALLBACK_COMPONENT,
            context,
            EventKind::Internal,
        );
    }

    fn report_persistence_failure(&self, entry: HistoryEntry, err: PersistenceError) {
        if entry.event.component == PERSISTENCE_COMPONENT {
            // The failure report itself could not be stored; stop here
            error!(
                id = %entry.event.id,
                error = %err,
                "Durable write of persistence failure report failed"
            );
            return;
        }
        let mut context = EventContext::new();
        context.insert("failed_event".to_string(), entry.event.id.to_string());
        context.insert("store".to_string(), self.history.durable().describe());
        self.submit(
            &err.error_type(),
            &describe_error(&err),
            Some(Severity::Critical),
            PERSISTENCE_COMPONENT,
            context,
            EventKind::Reported,
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
