//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the worker pool, task queue depth, circuit breakers, the event bus
//! and job lifecycle counts.
//!
//! # Example
//!
//! ```ignore
//! use rag_orchestrator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_queue_depth("shield:ingestion_queue", 42);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BREAKER_REJECTIONS, BREAKER_STATE, EVENTS_DROPPED, EVENTS_EMITTED,
    JOBS_CREATED, JOBS_FINISHED, QUEUE_DEPTH, REGISTRY, TASKS_TOTAL, TASK_DURATION,
    WORKER_RESTARTS,
};
