//! High-level recording interface over the raw Prometheus metrics.
//!
//! `MetricsCollector` is a zero-sized handle; every method checks whether the
//! corresponding metric has been initialized and silently does nothing if not.

use super::prometheus::{
    ACTIVE_WORKERS, BREAKER_REJECTIONS, BREAKER_STATE, EVENTS_DROPPED, EVENTS_EMITTED,
    JOBS_CREATED, JOBS_FINISHED, QUEUE_DEPTH, TASKS_TOTAL, TASK_DURATION, WORKER_RESTARTS,
};
use crate::resilience::CircuitState;

/// Metrics collector for recording orchestrator operational metrics.
///
/// # Example
///
/// ```ignore
/// use rag_orchestrator::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("success", "lightrag", 0.42);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one processed task.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "success", "failure" or "rejected"
    /// * `dependency` - Breaker name the task was processed through
    /// * `duration_secs` - Wall-clock processing time
    pub fn record_task(&self, outcome: &str, dependency: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[dependency])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            dependency = dependency,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Update the live entry count of a stream.
    pub fn update_queue_depth(&self, stream: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[stream]).set(depth as f64);
        }

        tracing::trace!(stream = stream, depth = depth, "Updated queue depth metric");
    }

    /// Increment the running worker gauge.
    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    /// Decrement the running worker gauge.
    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn record_worker_restart(&self) {
        if let Some(restarts) = WORKER_RESTARTS.get() {
            restarts.inc();
        }
    }

    /// Publish the current state of a circuit breaker.
    pub fn update_breaker_state(&self, dependency: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };

        if let Some(breaker_state) = BREAKER_STATE.get() {
            breaker_state.with_label_values(&[dependency]).set(value);
        }

        tracing::trace!(dependency = dependency, state = %state, "Updated breaker state metric");
    }

    pub fn record_breaker_rejection(&self, dependency: &str) {
        if let Some(rejections) = BREAKER_REJECTIONS.get() {
            rejections.with_label_values(&[dependency]).inc();
        }
    }

    /// Record one published event and how many deliveries were dropped.
    pub fn record_event(&self, dropped: u64) {
        if let Some(emitted) = EVENTS_EMITTED.get() {
            emitted.inc();
        }

        if dropped > 0 {
            if let Some(events_dropped) = EVENTS_DROPPED.get() {
                events_dropped.inc_by(dropped as f64);
            }
        }
    }

    pub fn record_job_created(&self, job_type: &str) {
        if let Some(jobs_created) = JOBS_CREATED.get() {
            jobs_created.with_label_values(&[job_type]).inc();
        }
    }

    pub fn record_job_finished(&self, status: &str) {
        if let Some(jobs_finished) = JOBS_FINISHED.get() {
            jobs_finished.with_label_values(&[status]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_task() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_task("success", "lightrag", 0.25);
        collector.record_task("failure", "lightrag", 1.5);
        collector.record_task("rejected", "vector_store", 0.0);
    }

    #[test]
    fn test_breaker_state_exported() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_breaker_state("embeddings", CircuitState::Open);
        collector.record_breaker_rejection("embeddings");

        let text = export_metrics();
        assert!(text.contains("rag_orchestrator_breaker_state"));
    }

    #[test]
    fn test_worker_and_event_counters() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_active_workers();
        collector.dec_active_workers();
        collector.record_worker_restart();
        collector.record_event(0);
        collector.record_event(3);
        collector.update_queue_depth("shield:ingestion_queue", 12);
        collector.record_job_created("lightrag_ingestion");
        collector.record_job_finished("completed");
    }
}
