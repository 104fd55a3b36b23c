//! Worker pool consuming the ingestion stream.
//!
//! The pool owns one supervisor task per worker position. A supervisor runs
//! a [`Worker`] until it exits and starts a fresh incarnation under the same
//! consumer name when the exit was caused by the task limit.
//!
//! # Features
//!
//! - Configurable number of workers and read batch size
//! - Graceful shutdown through a shared cancellation token
//! - Stragglers aborted after the shutdown timeout
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::processor::TaskProcessor;
use super::worker::{
    announce_stopped, ExitReason, Worker, WorkerContext, WorkerSlot, WorkerState, WorkerStatus,
};
use crate::events::{event_types, EventSink};
use crate::metrics::MetricsCollector;
use crate::queue::{QueueError, TaskQueue, DEFAULT_CONSUMER_GROUP};
use crate::resilience::BreakerRegistry;
use crate::tracker::JobTracker;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    #[error("Invalid pool size: {0}")]
    InvalidPoolSize(usize),

    /// The consumer group could not be prepared.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers to run.
    pub pool_size: usize,
    /// Consumer group shared by all workers.
    pub consumer_group: String,
    /// Consumer names are `{consumer_prefix}-{index}`.
    pub consumer_prefix: String,
    /// Maximum entries per read.
    pub batch_size: usize,
    /// How long a read blocks when the stream is empty.
    pub block_duration: Duration,
    /// Tasks after which a worker is replaced. Zero disables replacement.
    pub max_tasks_per_worker: u64,
    /// Pause after a failed read.
    pub error_backoff: Duration,
    /// Pause before a replaced worker starts.
    pub restart_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_prefix: "worker".to_string(),
            batch_size: 10,
            block_duration: Duration::from_secs(5),
            max_tasks_per_worker: 1000,
            error_backoff: Duration::from_secs(1),
            restart_delay: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_block_duration(mut self, block: Duration) -> Self {
        self.block_duration = block;
        self
    }

    pub fn with_max_tasks_per_worker(mut self, max_tasks: u64) -> Self {
        self.max_tasks_per_worker = max_tasks;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Consumer name of the worker at `index`.
    pub fn consumer_name(&self, index: usize) -> String {
        format!("{}-{}", self.consumer_prefix, index)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Number of worker positions.
    pub pool_size: usize,
    /// Workers in the `running` state.
    pub active_workers: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_task_duration: Duration,
    pub running: bool,
    pub workers: Vec<WorkerStatus>,
}

impl PoolStats {
    /// Returns the total number of tasks handled (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Counters shared by every worker of a pool.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(
        &self,
        pool_size: usize,
        running: bool,
        workers: Vec<WorkerStatus>,
    ) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_task_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            pool_size,
            active_workers: workers
                .iter()
                .filter(|w| w.state == WorkerState::Running)
                .count(),
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration,
            running,
            workers,
        }
    }
}

struct RunningPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    slots: Vec<Arc<WorkerSlot>>,
}

/// Fixed-size pool of queue consumers.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    running: tokio::sync::Mutex<Option<RunningPool>>,
    /// Slots of the current (or last) run, for `stats`.
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn TaskQueue>,
        tracker: Arc<JobTracker>,
        events: Arc<dyn EventSink>,
        breakers: Arc<BreakerRegistry>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                config,
                queue,
                tracker,
                events,
                breakers,
                processor,
                stats: SharedPoolStats::default(),
                metrics: MetricsCollector::new(),
            }),
            running: tokio::sync::Mutex::new(None),
            slots: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.ctx.config
    }

    /// Starts `config.pool_size` workers.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.start_with_size(self.ctx.config.pool_size).await
    }

    /// Starts `pool_size` workers, overriding the configured size.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::Queue` if the consumer group cannot be created.
    pub async fn start_with_size(&self, pool_size: usize) -> Result<(), PoolError> {
        if pool_size == 0 {
            return Err(PoolError::InvalidPoolSize(pool_size));
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        let config = &self.ctx.config;
        self.ctx
            .queue
            .ensure_consumer_group(&config.consumer_group)
            .await?;

        self.ctx.events.publish(
            event_types::WORKER_POOL_STARTED,
            None,
            Some(json!({ "pool_size": pool_size })),
            None,
        );

        let shutdown = CancellationToken::new();
        let slots: Vec<Arc<WorkerSlot>> = (0..pool_size)
            .map(|i| Arc::new(WorkerSlot::new(i, config.consumer_name(i))))
            .collect();

        let handles = slots
            .iter()
            .map(|slot| {
                tokio::spawn(supervise(
                    Arc::clone(slot),
                    Arc::clone(&self.ctx),
                    shutdown.clone(),
                ))
            })
            .collect();

        *self.slots.lock().expect("pool slots lock poisoned") = slots.clone();
        *running = Some(RunningPool {
            shutdown,
            handles,
            slots,
        });
        self.is_running.store(true, Ordering::SeqCst);

        info!(
            pool_size = pool_size,
            stream = %self.ctx.queue.stream_name(),
            group = %config.consumer_group,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stops the pool with the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<usize, PoolError> {
        self.stop(self.ctx.config.shutdown_timeout).await
    }

    /// Signals every worker to stop and waits up to `timeout` for them to
    /// finish their in-flight task. Workers still running afterwards are
    /// aborted. Returns the number of aborted workers.
    pub async fn stop(&self, timeout: Duration) -> Result<usize, PoolError> {
        let mut running = self.running.lock().await;
        let Some(mut pool) = running.take() else {
            return Err(PoolError::NotRunning);
        };

        info!("Initiating worker pool shutdown");
        pool.shutdown.cancel();

        let mut stragglers = Vec::new();
        let joined = tokio::time::timeout(timeout, join_all(pool.handles.iter_mut())).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
            }
            Err(_) => {
                for handle in pool.handles.drain(..) {
                    if !handle.is_finished() {
                        handle.abort();
                        stragglers.push(handle);
                    }
                }
                warn!(
                    aborted = stragglers.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutdown timed out, aborting workers"
                );
            }
        }

        let aborted = stragglers.len();
        for handle in stragglers {
            // Resolves with a cancellation error once the abort lands.
            let _ = handle.await;
        }

        // Workers that never reached their own stop path.
        for slot in &pool.slots {
            announce_stopped(&self.ctx, slot, ExitReason::Aborted);
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.ctx.events.publish(
            event_types::WORKER_POOL_STOPPED,
            None,
            Some(json!({ "pool_size": pool.slots.len(), "aborted": aborted })),
            None,
        );
        info!(aborted = aborted, "Worker pool shutdown complete");

        Ok(aborted)
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let workers: Vec<WorkerStatus> = self
            .slots
            .lock()
            .expect("pool slots lock poisoned")
            .iter()
            .map(|slot| slot.status())
            .collect();
        let pool_size = if workers.is_empty() {
            self.ctx.config.pool_size
        } else {
            workers.len()
        };
        self.ctx
            .stats
            .to_pool_stats(pool_size, self.is_running(), workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Runs worker incarnations for one position until shutdown.
async fn supervise(slot: Arc<WorkerSlot>, ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    loop {
        let worker = Worker::new(Arc::clone(&slot), Arc::clone(&ctx), shutdown.clone());
        let reason = worker.run().await;

        if reason != ExitReason::MaxTasks || shutdown.is_cancelled() {
            return;
        }

        slot.record_restart();
        ctx.metrics.record_worker_restart();
        let status = slot.status();
        ctx.events.publish(
            event_types::WORKER_RESTARTING,
            None,
            Some(json!({
                "worker_id": status.worker_id,
                "consumer_name": status.consumer_name,
                "restarts": status.restarts,
            })),
            None,
        );
        info!(
            worker_id = status.worker_id,
            consumer = %status.consumer_name,
            restarts = status.restarts,
            "Restarting worker"
        );

        if !ctx.config.restart_delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(ctx.config.restart_delay) => {}
            }
        }
    }
}
