//! Persistence worker v0.4.0
//!
//! Durable CRITICAL writes run off the submitting thread:
//! - Bounded tokio mpsc queue (`history.worker_queue`)
//! - Each write retried with exponential backoff (base * 2^attempt, capped)
//! - Exhausted retries go to the failure sink (the engine resubmits them)
//! - Queue full: the write gets its own task instead of being dropped
//! - After shutdown: writes happen inline on the caller

use crate::config::HistoryConfig;
use crate::error::PersistenceError;
use crate::history::{DurableStore, HistoryEntry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Called once per entry whose durable write failed for good
pub type FailureSink = Arc<dyn Fn(HistoryEntry, PersistenceError) + Send + Sync>;

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self {
            attempts: config.persistence_retries.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&HistoryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub written: u64,
    pub retried: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    on_failure: FailureSink,
    counters: Counters,
}

impl Shared {
    fn record_failure(&self, entry: HistoryEntry, error: PersistenceError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            id = %entry.event.id,
            store = %self.store.describe(),
            attempts = self.policy.attempts,
            error = %error,
            "Durable write failed, giving up"
        );
        (self.on_failure)(entry, error);
    }

    async fn persist(&self, entry: HistoryEntry) {
        let mut last_error = None;
        for attempt in 0..self.policy.attempts {
            if attempt > 0 {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.policy.delay_for(attempt - 1)).await;
            }

            let store = self.store.clone();
            let record = entry.clone();
            let result = tokio::task::spawn_blocking(move || store.append(&record))
                .await
                .unwrap_or_else(|e| Err(PersistenceError::Unavailable(e.to_string())));

            match result {
                Ok(()) => {
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    debug!(id = %entry.event.id, attempt, error = %e, "Durable write attempt failed");
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            self.record_failure(entry, e);
        }
    }

    /// Same retry loop on the calling thread
    fn persist_blocking(&self, entry: HistoryEntry) {
        let mut last_error = None;
        for attempt in 0..self.policy.attempts {
            if attempt > 0 {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(self.policy.delay_for(attempt - 1));
            }
            match self.store.append(&entry) {
                Ok(()) => {
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error {
            self.record_failure(entry, e);
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct PersistenceWorker {
    shared: Arc<Shared>,
    runtime: Handle,
    tx: Mutex<Option<mpsc::Sender<HistoryEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Writes that overflowed the queue
    overflow: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceWorker {
    /// Spawn the worker loop on `runtime`
    pub fn spawn(
        runtime: Handle,
        store: Arc<dyn DurableStore>,
        policy: RetryPolicy,
        queue: usize,
        on_failure: FailureSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            policy,
            on_failure,
            counters: Counters::default(),
        });
        let (tx, mut rx) = mpsc::channel::<HistoryEntry>(queue.max(1));

        let loop_shared = shared.clone();
        let task = runtime.spawn(async move {
            while let Some(entry) = rx.recv().await {
                loop_shared.persist(entry).await;
            }
            debug!("Persistence worker drained");
        });

        Self {
            shared,
            runtime,
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            overflow: Mutex::new(Vec::new()),
        }
    }

    /// Queue a durable write; never blocks on I/O unless the worker is stopped
    pub fn submit(&self, entry: HistoryEntry) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let Some(tx) = tx else {
            self.shared.persist_blocking(entry);
            return;
        };

        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                warn!(id = %entry.event.id, "Persistence queue full, writing from a dedicated task");
                let shared = self.shared.clone();
                let handle = self.runtime.spawn(async move { shared.persist(entry).await });
                let mut overflow = self.overflow.lock().unwrap_or_else(|e| e.into_inner());
                overflow.retain(|h| !h.is_finished());
                overflow.push(handle);
            }
            Err(TrySendError::Closed(entry)) => self.shared.persist_blocking(entry),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.shared.counters;
        WorkerStats {
            written: c.written.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for queued writes to finish
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Persistence worker ended abnormally");
            }
            let overflow: Vec<JoinHandle<()>> = self
                .overflow
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            for handle in overflow {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Overflow write ended abnormally");
                }
            }
            let stats = self.stats();
            info!(
                written = stats.written,
                retried = stats.retried,
                failed = stats.failed,
                "Persistence worker stopped"
            );
        }
    }
}

impl std::fmt::Debug for PersistenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWorker")
            .field("store", &self.shared.store.describe())
            .field("policy", &self.shared.policy)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
