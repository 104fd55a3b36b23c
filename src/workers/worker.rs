//! A single worker loop.
//!
//! State machine: `starting → running → (stopping → stopped)`, with
//! `restarting` set by the supervisor between incarnations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{SharedPoolStats, WorkerPoolConfig};
use super::processor::{ProcessError, ProcessOutcome, TaskProcessor};
use crate::events::{event_types, EventSink};
use crate::metrics::MetricsCollector;
use crate::queue::{QueueError, Task, TaskQueue};
use crate::resilience::BreakerRegistry;
use crate::tracker::{percent_complete, JobStatus, JobTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

/// Why a worker incarnation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The pool is stopping.
    Shutdown,
    /// Reached `max_tasks_per_worker`; the supervisor restarts it.
    MaxTasks,
    /// The processor reported cancellation.
    Cancelled,
    /// Still running when the shutdown timeout expired.
    Aborted,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Shutdown => "shutdown",
            ExitReason::MaxTasks => "max_tasks",
            ExitReason::Cancelled => "cancelled",
            ExitReason::Aborted => "aborted",
        }
    }
}

/// Per-worker view reported by `WorkerPool::stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub consumer_name: String,
    pub state: WorkerState,
    /// Tasks handled by the current incarnation.
    pub tasks_processed: u64,
    /// Tasks handled across all incarnations.
    pub total_processed: u64,
    pub restarts: u32,
}

/// Supervisor-owned status of one worker position.
pub(crate) struct WorkerSlot {
    status: Mutex<WorkerStatus>,
    /// Set between `worker.started` and `worker.stopped`.
    live: AtomicBool,
}

impl WorkerSlot {
    pub(crate) fn new(worker_id: usize, consumer_name: String) -> Self {
        Self {
            status: Mutex::new(WorkerStatus {
                worker_id,
                consumer_name,
                state: WorkerState::Starting,
                tasks_processed: 0,
                total_processed: 0,
                restarts: 0,
            }),
            live: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerStatus> {
        self.status.lock().expect("worker slot lock poisoned")
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.lock().clone()
    }

    pub(crate) fn worker_id(&self) -> usize {
        self.lock().worker_id
    }

    pub(crate) fn consumer_name(&self) -> String {
        self.lock().consumer_name.clone()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.lock().state = state;
    }

    pub(crate) fn record_restart(&self) {
        let mut status = self.lock();
        status.restarts += 1;
        status.state = WorkerState::Restarting;
    }

    fn begin(&self) {
        let mut status = self.lock();
        status.tasks_processed = 0;
        status.state = WorkerState::Running;
        self.live.store(true, Ordering::SeqCst);
    }

    fn record_task(&self) {
        let mut status = self.lock();
        status.tasks_processed += 1;
        status.total_processed += 1;
    }
}

/// Shared by every worker of a pool.
pub(crate) struct WorkerContext {
    pub(crate) config: WorkerPoolConfig,
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) tracker: Arc<JobTracker>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) breakers: Arc<BreakerRegistry>,
    pub(crate) processor: Arc<dyn TaskProcessor>,
    pub(crate) stats: SharedPoolStats,
    pub(crate) metrics: MetricsCollector,
}

/// Publishes `worker.stopped` once per incarnation. Returns false if this
/// incarnation was already reported.
pub(crate) fn announce_stopped(ctx: &WorkerContext, slot: &WorkerSlot, reason: ExitReason) -> bool {
    if !slot.live.swap(false, Ordering::SeqCst) {
        return false;
    }
    slot.set_state(WorkerState::Stopped);
    ctx.metrics.dec_active_workers();

    let status = slot.status();
    ctx.events.publish(
        event_types::WORKER_STOPPED,
        None,
        Some(json!({
            "worker_id": status.worker_id,
            "consumer_name": status.consumer_name,
            "tasks_processed": status.tasks_processed,
            "reason": reason.as_str(),
        })),
        None,
    );
    info!(
        worker_id = status.worker_id,
        consumer = %status.consumer_name,
        tasks_processed = status.tasks_processed,
        reason = reason.as_str(),
        "Worker stopped"
    );
    true
}

/// One incarnation of a worker.
pub(crate) struct Worker {
    slot: Arc<WorkerSlot>,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
    worker_id: usize,
    consumer_name: String,
}

impl Worker {
    pub(crate) fn new(
        slot: Arc<WorkerSlot>,
        ctx: Arc<WorkerContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_id = slot.worker_id();
        let consumer_name = slot.consumer_name();
        Self {
            slot,
            ctx,
            shutdown,
            worker_id,
            consumer_name,
        }
    }

    /// Runs until shutdown, cancellation or the task limit.
    pub(crate) async fn run(self) -> ExitReason {
        self.slot.begin();
        self.ctx.metrics.inc_active_workers();
        self.ctx.events.publish(
            event_types::WORKER_STARTED,
            None,
            Some(json!({
                "worker_id": self.worker_id,
                "consumer_name": self.consumer_name,
            })),
            None,
        );
        info!(worker_id = self.worker_id, consumer = %self.consumer_name, "Worker started");

        let reason = self.run_loop().await;
        if reason == ExitReason::Shutdown {
            self.slot.set_state(WorkerState::Stopping);
        }
        announce_stopped(&self.ctx, &self.slot, reason);
        reason
    }

    async fn run_loop(&self) -> ExitReason {
        let config = &self.ctx.config;
        let mut processed: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return ExitReason::Shutdown;
            }

            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return ExitReason::Shutdown,
                read = self.ctx.queue.read_batch(
                    &config.consumer_group,
                    &self.consumer_name,
                    config.batch_size,
                    config.block_duration,
                ) => read,
            };

            let tasks = match read {
                Ok(tasks) => tasks,
                Err(e) => {
                    self.recover_from_read_error(e).await;
                    continue;
                }
            };

            if !tasks.is_empty() {
                debug!(worker_id = self.worker_id, count = tasks.len(), "Read task batch");
            }

            for task in tasks {
                // Unstarted tasks stay pending and are reclaimed after the idle timeout.
                if self.shutdown.is_cancelled() {
                    return ExitReason::Shutdown;
                }
                if let Err(e) = self.handle_task(&task).await {
                    warn!(
                        worker_id = self.worker_id,
                        message_id = %task.message_id,
                        error = %e,
                        "Task processing cancelled"
                    );
                    return ExitReason::Cancelled;
                }
                processed += 1;
                self.slot.record_task();
            }

            if config.max_tasks_per_worker > 0 && processed >= config.max_tasks_per_worker {
                info!(
                    worker_id = self.worker_id,
                    processed = processed,
                    "Worker reached max tasks"
                );
                return ExitReason::MaxTasks;
            }
        }
    }

    async fn recover_from_read_error(&self, error: QueueError) {
        warn!(
            worker_id = self.worker_id,
            consumer = %self.consumer_name,
            error = %error,
            "Failed to read from task queue"
        );

        if let QueueError::UnknownGroup(ref group) = error {
            if let Err(e) = self.ctx.queue.ensure_consumer_group(group).await {
                warn!(group = %group, error = %e, "Failed to recreate consumer group");
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.config.error_backoff) => {}
        }
    }

    /// Processes one task. Only a cancellation is returned as an error;
    /// every other failure is reported and the task is left unacknowledged.
    async fn handle_task(&self, task: &Task) -> Result<(), ProcessError> {
        let processor: &dyn TaskProcessor = self.ctx.processor.as_ref();
        let dependency = processor.dependency();
        let breaker = self.ctx.breakers.get_or_create(dependency);
        let started = Instant::now();

        let result = breaker
            .call_filtered(
                || processor.process(task),
                |e: &ProcessError| e.counts_against_dependency(),
            )
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => {
                self.ctx.stats.record_completion(elapsed);
                self.ctx
                    .metrics
                    .record_task("success", dependency, elapsed.as_secs_f64());
                self.complete(task, outcome).await;
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.ctx.stats.record_failure(elapsed);
                let outcome = match &e {
                    ProcessError::CircuitOpen(_) => "rejected",
                    _ => "failure",
                };
                self.ctx
                    .metrics
                    .record_task(outcome, dependency, elapsed.as_secs_f64());
                self.report_failure(task, &e);
                Ok(())
            }
        }
    }

    async fn complete(&self, task: &Task, outcome: ProcessOutcome) {
        let group = &self.ctx.config.consumer_group;
        if let Err(e) = self.ctx.queue.acknowledge(group, &task.message_id).await {
            warn!(
                worker_id = self.worker_id,
                message_id = %task.message_id,
                error = %e,
                "Failed to acknowledge task, it will be redelivered"
            );
        }

        debug!(
            worker_id = self.worker_id,
            job_id = %task.job_id,
            chunk_id = %task.chunk_id,
            reference = ?outcome.reference,
            "Processed task"
        );

        let tracker = &self.ctx.tracker;
        let count = match tracker.increment_processed(&task.job_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(job_id = %task.job_id, error = %e, "Failed to record job progress");
                return;
            }
        };
        let progress = match tracker.get_progress(&task.job_id).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(job_id = %task.job_id, error = %e, "Failed to read job progress");
                return;
            }
        };

        if progress.status == JobStatus::Queued {
            if let Err(e) = tracker
                .update_job(&task.job_id, Some(JobStatus::Processing), None)
                .await
            {
                warn!(job_id = %task.job_id, error = %e, "Failed to mark job processing");
            }
        }

        self.ctx.events.publish(
            event_types::JOB_PROGRESS,
            Some(&task.job_id),
            Some(json!({
                "chunk_id": task.chunk_id,
                "tasks_processed": count,
                "tasks_total": progress.tasks_total,
                "percent_complete": percent_complete(count, progress.tasks_total),
            })),
            None,
        );

        if count >= progress.tasks_total && !progress.status.is_terminal() {
            match tracker
                .update_job(&task.job_id, Some(JobStatus::Completed), None)
                .await
            {
                // A redelivered copy finishing alongside the original
                // must not announce the job twice.
                Ok(false) => {
                    debug!(job_id = %task.job_id, "Job already settled by another task");
                }
                Ok(true) => {
                    self.ctx.events.publish(
                        event_types::JOB_COMPLETED,
                        Some(&task.job_id),
                        Some(json!({
                            "tasks_total": progress.tasks_total,
                            "tasks_processed": count,
                        })),
                        None,
                    );
                    info!(job_id = %task.job_id, tasks = count, "Job completed");
                }
                Err(e) => {
                    warn!(job_id = %task.job_id, error = %e, "Failed to mark job completed");
                }
            }
        }
    }

    fn report_failure(&self, task: &Task, error: &ProcessError) {
        warn!(
            worker_id = self.worker_id,
            message_id = %task.message_id,
            job_id = %task.job_id,
            retry_count = task.retry_count,
            error = %error,
            "Task failed, leaving it for redelivery"
        );

        let mut data = json!({
            "worker_id": self.worker_id,
            "consumer_name": self.consumer_name,
            "message_id": task.message_id,
            "job_id": task.job_id,
            "chunk_id": task.chunk_id,
            "retry_count": task.retry_count,
            "error": error.to_string(),
        });
        if let (Some(retry_after), Value::Object(map)) = (error.retry_after(), &mut data) {
            map.insert(
                "retry_after_ms".to_string(),
                json!(retry_after.as_millis() as u64),
            );
        }

        self.ctx.events.publish(
            event_types::WORKER_TASK_FAILED,
            Some(&task.job_id),
            Some(data),
            None,
        );
    }
}
