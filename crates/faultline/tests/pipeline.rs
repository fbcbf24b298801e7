//! Pipeline tests - end-to-end behaviour of a running engine
//!
//! Time is driven with ManualClock + tick() so window behaviour is exact.

use faultline::config::DurableBackend;
use faultline::event::MALFORMED_COMPONENT_KEY;
use faultline::history::MemoryStore;
use faultline::{
    Callback, CallbackFilter, ErrorEngine, EventContext, EventId, EventKind, FaultlineConfig,
    HistoryFilter, ManualClock, NullPresenter, RecordingPresenter, Severity, SeverityFilter,
    CALLBACK_COMPONENT, PERSISTENCE_COMPONENT,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn test_config() -> FaultlineConfig {
    let mut config = FaultlineConfig::default();
    config.history.retry_base_ms = 1;
    config.history.retry_max_ms = 4;
    config
}

async fn engine_with(
    config: FaultlineConfig,
    clock: &ManualClock,
    presenter: Arc<RecordingPresenter>,
) -> ErrorEngine {
    ErrorEngine::builder(config)
        .presenter(presenter)
        .clock(Arc::new(clock.clone()))
        .durable_store(Arc::new(MemoryStore::new()))
        .start()
        .await
        .expect("engine should start")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_are_never_lost() {
    let engine = ErrorEngine::builder(test_config())
        .presenter(Arc::new(NullPresenter))
        .durable_store(Arc::new(MemoryStore::new()))
        .start()
        .await
        .unwrap();

    let severities = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];
    let mut producers = Vec::new();
    for producer in 0..8 {
        let engine = engine.clone();
        producers.push(std::thread::spawn(move || {
            (0..50)
                .map(|i| {
                    engine.submit(
                        "IoError",
                        &format!("write {} failed on block {}", producer, i),
                        Some(severities[i % 4]),
                        &format!("io.worker{}", producer),
                        EventContext::new(),
                    )
                })
                .collect::<Vec<EventId>>()
        }));
    }

    let mut submitted = Vec::new();
    for producer in producers {
        submitted.extend(producer.join().expect("producer thread panicked"));
    }
    engine.shutdown().await;

    let reported: Vec<EventId> = engine
        .query(&HistoryFilter::new())
        .into_iter()
        .filter(|e| e.event.kind == EventKind::Reported)
        .map(|e| e.event.id)
        .collect();

    let mut seen: HashMap<EventId, usize> = HashMap::new();
    for id in &reported {
        *seen.entry(*id).or_insert(0) += 1;
    }
    assert_eq!(submitted.len(), 400);
    for id in &submitted {
        assert_eq!(seen.get(id), Some(&1), "event {} should be recorded exactly once", id);
    }

    let critical = engine.critical_history().unwrap();
    assert_eq!(critical.len(), 100, "every CRITICAL must reach the durable store");
}

#[tokio::test]
async fn repeated_network_errors_produce_one_summary() {
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(test_config(), &clock, presenter.clone()).await;

    for _ in 0..5 {
        engine.submit(
            "NetworkError",
            "timeout contacting host",
            None,
            "ai.client",
            EventContext::new(),
        );
        clock.advance_ms(2_000);
    }
    assert_eq!(presenter.len(), 1, "only the first occurrence is presented immediately");

    clock.advance_ms(31_000);
    let tick = engine.tick();
    assert_eq!(tick.summaries, 1);

    let summaries = engine
        .query(&HistoryFilter::new())
        .into_iter()
        .filter(|e| e.event.kind == EventKind::AggregatedSummary)
        .collect::<Vec<_>>();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].aggregated_count, 5);
    assert_eq!(summaries[0].event.severity, Severity::Warning);
    assert!(summaries[0].emitted);

    assert_eq!(engine.query(&HistoryFilter::new()).len(), 6);
    engine.shutdown().await;
}

#[tokio::test]
async fn rate_limit_records_overflow_silently() {
    let mut config = test_config();
    config.aggregation.enabled = false;
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(config, &clock, presenter.clone()).await;

    for i in 0..8 {
        engine.submit("IoError", &format!("disk write {}", i), None, "io", EventContext::new());
        clock.advance_ms(100);
    }

    assert_eq!(presenter.len(), 5);
    let entries = engine.query(&HistoryFilter::new().component("io"));
    assert_eq!(entries.len(), 8);
    assert_eq!(entries.iter().filter(|e| e.emitted).count(), 5);
    assert_eq!(entries.iter().filter(|e| !e.emitted).count(), 3);

    clock.advance_ms(60_000);
    assert_eq!(engine.tick().flushed_batches, 1);
    let batch = presenter.events().pop().unwrap();
    assert_eq!(batch.kind, EventKind::BatchSummary);
    assert_eq!(batch.occurrences, 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn callbacks_filter_by_component_subtree() {
    let clock = ManualClock::starting_now();
    let engine = engine_with(test_config(), &clock, Arc::new(RecordingPresenter::new())).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.register_callback(
        Callback::new("editor-recovery", move |event| {
            sink.lock().unwrap().push(event.component.clone());
            Ok(())
        })
        .filter(CallbackFilter::any().component("ui.editor")),
    );

    let critical_hits = Arc::new(AtomicUsize::new(0));
    let counter = critical_hits.clone();
    engine.register_callback(
        Callback::new("critical-only", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .filter(CallbackFilter::any().severity(SeverityFilter::Exactly(Severity::Critical))),
    );

    engine.submit("ParseError", "bad token", None, "ui.editor", EventContext::new());
    engine.submit("ParseError", "bad heading", None, "ui.editor.toolbar", EventContext::new());
    engine.submit("ParseError", "bad label", None, "ui.binder", EventContext::new());
    engine.submit("ParseError", "bad file", None, "ui.editorial", EventContext::new());
    engine.submit("CorruptionError", "index lost", None, "store", EventContext::new());

    assert_eq!(
        seen.lock().unwrap().clone(),
        vec!["ui.editor".to_string(), "ui.editor.toolbar".to_string()]
    );
    assert_eq!(critical_hits.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn critical_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.history.durable_backend = DurableBackend::Jsonl;
    config.history.durable_path = Some(dir.path().join("critical.jsonl"));

    let engine = ErrorEngine::builder(config.clone())
        .presenter(Arc::new(NullPresenter))
        .start()
        .await
        .unwrap();
    let id = engine.submit("CorruptionError", "index lost", None, "", EventContext::new());
    engine.submit("IoError", "not durable", None, "io", EventContext::new());
    engine.shutdown().await;

    let restarted = ErrorEngine::builder(config)
        .presenter(Arc::new(NullPresenter))
        .start()
        .await
        .unwrap();

    let durable = restarted.critical_history().unwrap();
    assert_eq!(durable.len(), 1);
    assert_eq!(durable[0].event.id, id);
    assert_eq!(durable[0].event.component, "");
    assert_eq!(durable[0].event.severity, Severity::Critical);

    let restored = restarted.query(&HistoryFilter::new());
    assert_eq!(restored.len(), 1, "only CRITICAL entries are restored");

    assert!(restarted.purge_critical(&id).unwrap());
    assert!(restarted.critical_history().unwrap().is_empty());
    restarted.shutdown().await;
}

#[tokio::test]
async fn sqlite_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.history.durable_backend = DurableBackend::Sqlite;
    config.history.durable_path = Some(dir.path().join("critical.db"));

    let engine = ErrorEngine::builder(config.clone())
        .presenter(Arc::new(NullPresenter))
        .start()
        .await
        .unwrap();
    let id = engine.submit("OutOfMemoryError", "allocation failed", None, "ai.model", EventContext::new());
    engine.shutdown().await;

    let restarted = ErrorEngine::builder(config)
        .presenter(Arc::new(NullPresenter))
        .start()
        .await
        .unwrap();
    let ids: HashSet<EventId> = restarted
        .critical_history()
        .unwrap()
        .into_iter()
        .map(|e| e.event.id)
        .collect();
    assert!(ids.contains(&id));
    restarted.shutdown().await;
}

#[tokio::test]
async fn persistence_failure_is_reported_once() {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = ErrorEngine::builder(test_config())
        .presenter(presenter.clone())
        .durable_store(store.clone())
        .start()
        .await
        .unwrap();

    let id = engine.submit("CorruptionError", "bad block", None, "store", EventContext::new());
    engine.shutdown().await;

    let failures = engine.query(&HistoryFilter::new().component(PERSISTENCE_COMPONENT));
    assert_eq!(failures.len(), 1, "the failure report must not recurse");
    assert_eq!(failures[0].event.error_type, "PersistenceFailure");
    assert_eq!(failures[0].event.severity, Severity::Critical);
    assert_eq!(failures[0].event.context["failed_event"], id.to_string());

    // original event is still in the in-memory history
    assert_eq!(engine.query(&HistoryFilter::new().text("bad block")).len(), 1);
    assert_eq!(engine.worker_stats().failed, 2);
}

#[tokio::test]
async fn failing_callback_is_isolated() {
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(test_config(), &clock, presenter.clone()).await;

    engine.register_callback(Callback::new("panics", |_| panic!("recovery blew up")).priority(10));
    let after = Arc::new(AtomicUsize::new(0));
    let counter = after.clone();
    engine.register_callback(Callback::new("still-runs", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    engine.submit("IoError", "disk", None, "io", EventContext::new());
    assert_eq!(after.load(Ordering::SeqCst), 1, "later callbacks still run");

    let internal = engine.query(&HistoryFilter::new().error_type("CallbackFailure"));
    assert_eq!(internal.len(), 1);
    assert_eq!(internal[0].event.severity, Severity::Info);
    assert_eq!(internal[0].event.component, CALLBACK_COMPONENT);
    assert_eq!(internal[0].event.kind, EventKind::Internal);
    engine.shutdown().await;
}

#[tokio::test]
async fn malformed_component_degrades_to_root() {
    let clock = ManualClock::starting_now();
    let engine = engine_with(test_config(), &clock, Arc::new(RecordingPresenter::new())).await;

    engine.submit("IoError", "x", None, ".ui.", EventContext::new());
    let entry = &engine.query(&HistoryFilter::new())[0];
    assert_eq!(entry.event.component, "");
    assert_eq!(entry.event.context[MALFORMED_COMPONENT_KEY], ".ui.");
    engine.shutdown().await;
}

#[tokio::test]
async fn runtime_severity_mapping_applies() {
    let clock = ManualClock::starting_now();
    let engine = engine_with(test_config(), &clock, Arc::new(RecordingPresenter::new())).await;

    assert_eq!(engine.classify(None, "QuotaExceeded"), Severity::Error);
    engine.register_severity_mapping("QuotaExceeded", Severity::Warning);
    engine.submit("QuotaExceeded", "too many requests", None, "ai", EventContext::new());
    assert_eq!(
        engine.query(&HistoryFilter::new())[0].event.severity,
        Severity::Warning
    );
    assert_eq!(
        engine.classify(Some(Severity::Info), "QuotaExceeded"),
        Severity::Info,
        "explicit severity always wins"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn steady_repeats_still_close_their_window() {
    let mut config = test_config();
    config.rate_limit.enabled = false;
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(config, &clock, presenter.clone()).await;

    let summaries = |p: &RecordingPresenter| {
        p.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::AggregatedSummary)
            .collect::<Vec<_>>()
    };

    // One occurrence every 20s against a 30s window, for ten minutes
    for step in 0..30 {
        engine.submit("NetworkError", "timeout contacting host", None, "ai.client", EventContext::new());
        clock.advance_ms(20_000);
        engine.tick();
        if step == 1 {
            let first = summaries(presenter.as_ref());
            assert_eq!(first.len(), 1, "summary due at the first deadline");
            assert_eq!(first[0].occurrences, 2);
        }
    }

    assert_eq!(summaries(presenter.as_ref()).len(), 15);
    assert!(engine.aggregation_buckets().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn batched_aggregation_summary_keeps_its_occurrences() {
    let mut config = test_config();
    config.aggregation.window_ms = 1_000;
    config.rate_limit.threshold = 1;
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(config, &clock, presenter.clone()).await;

    for _ in 0..5 {
        engine.submit("DiskError", "disk full", Some(Severity::Error), "io", EventContext::new());
    }
    assert_eq!(presenter.len(), 1);

    clock.advance_ms(1_000);
    let tick = engine.tick();
    assert_eq!(tick.summaries, 1);
    assert_eq!(presenter.len(), 1, "summary goes into the pending batch");

    clock.advance_ms(60_000);
    assert_eq!(engine.tick().flushed_batches, 1);
    let presented = presenter.events();
    assert_eq!(presented.len(), 2);
    assert_eq!(presented[1].kind, EventKind::BatchSummary);
    // The first occurrence was presented on its own
    assert_eq!(presented[1].occurrences, 4);

    let merged = engine
        .query(&HistoryFilter::new().error_type("DiskError"))
        .into_iter()
        .filter(|e| e.event.kind == EventKind::Reported)
        .collect::<Vec<_>>();
    assert_eq!(merged.len(), 5);
    assert!(merged.iter().all(|e| e.aggregated_count == 1));

    let report = engine.report().await;
    assert_eq!(report.total_entries, 7);
    assert_eq!(report.total_occurrences, 5);
    assert_eq!(report.emitted, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn oversized_window_is_rejected_at_start() {
    let mut config = test_config();
    config.aggregation.window_ms = 9_000_000_000_000_000;
    let result = ErrorEngine::builder(config)
        .durable_store(Arc::new(MemoryStore::new()))
        .start()
        .await;
    assert!(matches!(result, Err(faultline::EngineError::Config(_))));

    let mut config = test_config();
    config.rate_limit.window_ms = u64::MAX;
    let result = ErrorEngine::builder(config)
        .durable_store(Arc::new(MemoryStore::new()))
        .start()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn backoff_suppresses_but_never_critical() {
    let mut config = test_config();
    config.aggregation.enabled = false;
    config.rate_limit.threshold = 2;
    config.rate_limit.use_exponential_backoff = true;
    let clock = ManualClock::starting_now();
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = engine_with(config, &clock, presenter.clone()).await;

    for i in 0..5 {
        engine.submit("IoError", &format!("slow write {}", i), Some(Severity::Warning), "io", EventContext::new());
    }
    for i in 0..4 {
        engine.submit("CorruptionError", &format!("block {}", i), None, "io", EventContext::new());
    }

    let warnings = engine.query(&HistoryFilter::new().severity(Severity::Warning));
    assert_eq!(warnings.len(), 5);
    assert_eq!(warnings.iter().filter(|e| e.emitted).count(), 2);
    assert_eq!(warnings.iter().filter(|e| !e.emitted).count(), 3);

    let criticals = engine.query(&HistoryFilter::new().severity(Severity::Critical));
    assert_eq!(criticals.len(), 4);
    assert!(criticals.iter().all(|e| e.emitted));

    let presented = presenter.events();
    assert_eq!(presented.iter().filter(|e| e.severity == Severity::Warning).count(), 2);
    assert_eq!(presented.iter().filter(|e| e.severity == Severity::Critical).count(), 4);

    // Suppressed events never come back as a batch
    clock.advance_ms(60_000);
    assert_eq!(engine.tick().flushed_batches, 0);
    assert_eq!(presenter.len(), 6);

    // Past the cooldown, the key emits again
    clock.advance_ms(1_000);
    engine.submit("IoError", "slow write again", Some(Severity::Warning), "io", EventContext::new());
    assert_eq!(presenter.len(), 7);
    engine.shutdown().await;
}
