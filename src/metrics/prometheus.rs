//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the orchestrator and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all orchestrator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks handled by workers, labeled by outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task processing duration in seconds, labeled by downstream dependency.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of live entries per stream.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of worker loops currently running.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Total worker restarts after reaching the per-worker task limit.
pub static WORKER_RESTARTS: OnceLock<Counter> = OnceLock::new();

/// Breaker state per dependency: 0 closed, 1 half-open, 2 open.
pub static BREAKER_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Calls rejected by an open breaker, labeled by dependency.
pub static BREAKER_REJECTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Total events published on the event bus.
pub static EVENTS_EMITTED: OnceLock<Counter> = OnceLock::new();

/// Total event deliveries dropped because a subscriber was full.
pub static EVENTS_DROPPED: OnceLock<Counter> = OnceLock::new();

/// Total jobs created, labeled by job type.
pub static JOBS_CREATED: OnceLock<CounterVec> = OnceLock::new();

/// Total jobs reaching a terminal status, labeled by status.
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through [`super::MetricsCollector`] is a
/// no-op until this has run, so library users that never scrape metrics pay
/// nothing.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    // Serializes racing callers so every handle comes from one registry.
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("rag_orchestrator_tasks_total", "Total number of tasks handled"),
        &["outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rag_orchestrator_task_duration_seconds",
            "Task processing duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
        &["dependency"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("rag_orchestrator_queue_depth", "Number of live entries per stream"),
        &["stream"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "rag_orchestrator_active_workers",
        "Number of worker loops currently running",
    )?;

    let worker_restarts = Counter::new(
        "rag_orchestrator_worker_restarts_total",
        "Worker restarts after reaching the task limit",
    )?;

    // Breaker metrics
    let breaker_state = GaugeVec::new(
        Opts::new(
            "rag_orchestrator_breaker_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
        ),
        &["dependency"],
    )?;

    let breaker_rejections = CounterVec::new(
        Opts::new(
            "rag_orchestrator_breaker_rejections_total",
            "Calls rejected by an open circuit breaker",
        ),
        &["dependency"],
    )?;

    // Event bus metrics
    let events_emitted = Counter::new(
        "rag_orchestrator_events_emitted_total",
        "Total events published",
    )?;

    let events_dropped = Counter::new(
        "rag_orchestrator_events_dropped_total",
        "Event deliveries dropped on full subscribers",
    )?;

    // Job metrics
    let jobs_created = CounterVec::new(
        Opts::new("rag_orchestrator_jobs_created_total", "Total jobs created"),
        &["job_type"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new(
            "rag_orchestrator_jobs_finished_total",
            "Total jobs reaching a terminal status",
        ),
        &["status"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(worker_restarts.clone()))?;
    registry.register(Box::new(breaker_state.clone()))?;
    registry.register(Box::new(breaker_rejections.clone()))?;
    registry.register(Box::new(events_emitted.clone()))?;
    registry.register(Box::new(events_dropped.clone()))?;
    registry.register(Box::new(jobs_created.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = WORKER_RESTARTS.set(worker_restarts);
    let _ = BREAKER_STATE.set(breaker_state);
    let _ = BREAKER_REJECTIONS.set(breaker_rejections);
    let _ = EVENTS_EMITTED.set(events_emitted);
    let _ = EVENTS_DROPPED.set(events_dropped);
    let _ = JOBS_CREATED.set(jobs_created);
    let _ = JOBS_FINISHED.set(jobs_finished);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
