//! Ingestion service facade.
//!
//! Ties the queue, tracker, event bus and breakers together behind the
//! operations an API layer exposes: submit, status, listing, event streaming
//! and health.

use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::events::{event_types, EventBus, EventBusStats, Subscription};
use crate::metrics::MetricsCollector;
use crate::queue::{NewTask, TaskQueue};
use crate::resilience::{BreakerRegistry, BreakerSnapshot};
use crate::tracker::{JobProgress, JobStatus, JobSummary, JobTracker};
use crate::workers::{PoolStats, WorkerPool};

/// One chunk of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    pub text: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChunkInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_uri: None,
            metadata: Map::new(),
        }
    }

    pub fn with_source_uri(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }
}

/// Returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub tasks_total: u64,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// At least one worker is active and every breaker is closed.
    Up,
    /// Workers are active but a breaker is open or the queue is unreachable.
    Degraded,
    /// No worker is active.
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub stream: String,
    pub depth: Option<u64>,
    pub pending: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub queue: QueueHealth,
    /// Absent when this process runs no worker pool.
    pub workers: Option<PoolStats>,
    pub breakers: Vec<BreakerSnapshot>,
    pub events: EventBusStats,
}

/// Submission, status, streaming and health operations.
pub struct IngestionService {
    queue: Arc<dyn TaskQueue>,
    tracker: Arc<JobTracker>,
    events: EventBus,
    breakers: Arc<BreakerRegistry>,
    pool: Option<Arc<WorkerPool>>,
    consumer_group: String,
    started_at: Instant,
    metrics: MetricsCollector,
}

impl IngestionService {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        tracker: Arc<JobTracker>,
        events: EventBus,
        breakers: Arc<BreakerRegistry>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            tracker,
            events,
            breakers,
            pool: None,
            consumer_group: consumer_group.into(),
            started_at: Instant::now(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Attaches the local worker pool so health can report on it.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Creates a job and enqueues one task per chunk.
    ///
    /// Chunk ids are `{job_id}::{index}` and each task carries its
    /// `chunk_index` in metadata. If enqueueing fails the job is marked
    /// `failed` with the error and the error is returned.
    pub async fn submit(
        &self,
        job_type: &str,
        chunks: Vec<ChunkInput>,
        source_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<SubmitReceipt, OrchestratorError> {
        if chunks.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "submission has no chunks".to_string(),
            ));
        }

        let tasks_total = chunks.len() as u64;
        let job_id = self
            .tracker
            .create_job(job_type, tasks_total, metadata.clone(), None)
            .await?;

        let tasks: Vec<NewTask> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                NewTask::new(&job_id, format!("{}::{}", job_id, index), chunk.text)
                    .with_source(chunk.source_uri.unwrap_or_default(), source_type)
                    .with_metadata(chunk.metadata)
                    .with_meta("chunk_index", index as u64)
            })
            .collect();

        let enqueued = match self.queue.ensure_consumer_group(&self.consumer_group).await {
            Ok(()) => self.queue.enqueue_batch(tasks).await,
            Err(e) => Err(e),
        };

        let message_ids = match enqueued {
            Ok(ids) => ids,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to enqueue job tasks");
                if let Err(update_err) = self
                    .tracker
                    .update_job(&job_id, Some(JobStatus::Failed), Some(e.to_string()))
                    .await
                {
                    warn!(job_id = %job_id, error = %update_err, "Failed to mark job failed");
                }
                return Err(e.into());
            }
        };

        self.events.publish(
            event_types::INGESTION_QUEUED,
            Some(&job_id),
            Some(json!({
                "chunks_total": tasks_total,
                "source_type": source_type,
                "metadata": metadata,
            })),
            None,
        );
        info!(
            job_id = %job_id,
            chunks = tasks_total,
            stream = %self.queue.stream_name(),
            "Queued ingestion job"
        );

        Ok(SubmitReceipt {
            job_id,
            tasks_total,
            message_ids,
        })
    }

    pub async fn get_progress(&self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        Ok(self.tracker.get_progress(job_id).await?)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobSummary>, OrchestratorError> {
        Ok(self.tracker.list_jobs(status, limit).await?)
    }

    pub fn subscribe(
        &self,
        event_types: Option<Vec<String>>,
        include_history: bool,
    ) -> Result<Subscription, OrchestratorError> {
        Ok(self.events.subscribe(event_types, include_history)?)
    }

    /// SSE frames for a streaming endpoint; `cancel` fires on disconnect.
    pub fn sse_stream(
        &self,
        event_types: Option<Vec<String>>,
        include_history: bool,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = String> + Send + 'static, OrchestratorError> {
        Ok(self.events.sse_stream(event_types, include_history, cancel)?)
    }

    pub async fn health(&self) -> HealthReport {
        let stream = self.queue.stream_name().to_string();
        let queue = match self.queue.depth().await {
            Ok(depth) => {
                self.metrics.update_queue_depth(&stream, depth);
                let pending = self.queue.pending(&self.consumer_group).await.ok();
                QueueHealth {
                    stream,
                    depth: Some(depth),
                    pending,
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Queue unreachable during health check");
                QueueHealth {
                    stream,
                    depth: None,
                    pending: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let workers = self.pool.as_ref().map(|pool| pool.stats());
        let breakers = self.breakers.snapshots();
        let active_workers = workers.as_ref().map(|w| w.active_workers).unwrap_or(0);

        let status = if active_workers == 0 {
            HealthStatus::Down
        } else if self.breakers.any_tripped() || queue.error.is_some() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            queue,
            workers,
            breakers,
            events: self.events.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::queue::{InMemoryTaskQueue, QueueConfig, QueueError, Task};
    use crate::resilience::BreakerConfig;
    use crate::tracker::INGESTION_JOB_TYPE;
    use async_trait::async_trait;
    use std::time::Duration;

    const GROUP: &str = "lightrag-workers";

    fn service_with(queue: Arc<dyn TaskQueue>) -> IngestionService {
        IngestionService::new(
            queue,
            Arc::new(JobTracker::in_memory()),
            EventBus::new(EventBusConfig::default()),
            Arc::new(BreakerRegistry::with_defaults(BreakerConfig::default())),
            GROUP,
        )
    }

    /// Queue whose writes always fail.
    struct BrokenQueue;

    #[async_trait]
    impl TaskQueue for BrokenQueue {
        fn stream_name(&self) -> &str {
            "broken"
        }
        async fn enqueue(&self, _task: NewTask) -> Result<String, QueueError> {
            Err(QueueError::ConnectionFailed("refused".to_string()))
        }
        async fn enqueue_batch(&self, _tasks: Vec<NewTask>) -> Result<Vec<String>, QueueError> {
            Err(QueueError::ConnectionFailed("refused".to_string()))
        }
        async fn ensure_consumer_group(&self, _group: &str) -> Result<(), QueueError> {
            Ok(())
        }
        async fn read_batch(
            &self,
            _group: &str,
            _consumer: &str,
            _max_count: usize,
            _block: Duration,
        ) -> Result<Vec<Task>, QueueError> {
            Err(QueueError::ConnectionFailed("refused".to_string()))
        }
        async fn acknowledge(&self, _group: &str, _message_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
        async fn depth(&self) -> Result<u64, QueueError> {
            Err(QueueError::ConnectionFailed("refused".to_string()))
        }
        async fn pending(&self, _group: &str) -> Result<u64, QueueError> {
            Err(QueueError::ConnectionFailed("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_submit_enqueues_every_chunk() {
        let queue = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let service = service_with(queue.clone());
        let mut events = service.subscribe(None, true).unwrap();

        let mut metadata = Map::new();
        metadata.insert("collection".to_string(), json!("docs"));
        let receipt = service
            .submit(
                INGESTION_JOB_TYPE,
                vec![
                    ChunkInput::new("first").with_source_uri("s3://b/doc.pdf"),
                    ChunkInput::new("second"),
                ],
                "pdf",
                metadata,
            )
            .await
            .unwrap();

        assert_eq!(receipt.tasks_total, 2);
        assert_eq!(receipt.message_ids.len(), 2);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let tasks = queue
            .read_batch(GROUP, "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(tasks[0].chunk_id, format!("{}::0", receipt.job_id));
        assert_eq!(tasks[0].source_uri, "s3://b/doc.pdf");
        assert_eq!(tasks[0].source_type, "pdf");
        assert_eq!(tasks[1].metadata.get("chunk_index"), Some(&json!(1)));

        let progress = service.get_progress(&receipt.job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Queued);
        assert_eq!(progress.tasks_total, 2);
        assert_eq!(progress.metadata.get("collection"), Some(&json!("docs")));

        let queued = events.try_recv().unwrap();
        assert_eq!(queued.event_type, event_types::INGESTION_QUEUED);
        assert_eq!(queued.job_id.as_deref(), Some(receipt.job_id.as_str()));
        assert_eq!(queued.data_field("chunks_total"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty() {
        let service = service_with(Arc::new(InMemoryTaskQueue::default()));
        let err = service
            .submit(INGESTION_JOB_TYPE, Vec::new(), "text", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_job_failed() {
        let service = service_with(Arc::new(BrokenQueue));
        let err = service
            .submit(INGESTION_JOB_TYPE, vec![ChunkInput::new("x")], "text", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(_)));

        let jobs = service.list_jobs(Some(JobStatus::Failed), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let progress = service.get_progress(&jobs[0].job_id).await.unwrap();
        assert!(progress.error.unwrap().contains("refused"));
        assert_eq!(service.events().stats().events_emitted, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let service = service_with(Arc::new(InMemoryTaskQueue::default()));
        let err = service.get_progress("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_health_without_workers_is_down() {
        let service = service_with(Arc::new(InMemoryTaskQueue::default()));
        let report = service.health().await;

        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.workers.is_none());
        assert_eq!(report.queue.depth, Some(0));
        assert_eq!(report.breakers.len(), 3);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "down");
    }

    #[tokio::test]
    async fn test_health_reports_queue_error() {
        let service = service_with(Arc::new(BrokenQueue));
        let report = service.health().await;
        assert!(report.queue.error.unwrap().contains("refused"));
        assert_eq!(report.queue.depth, None);
    }
}
