//! Job progress tracking.
//!
//! A job is created once per submission and advanced by the workers as its
//! tasks are processed. Live state is held in a TTL-bounded [`JobCache`]
//! (Redis in production); when a [`JobStore`] is attached every mutation is
//! written through to it so that jobs outlive their cache entry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   create / update / increment   ┌──────────────┐
//! │  JobTracker  │────────────────────────────────►│   JobCache   │  job:{id} hash + TTL
//! │              │                                 └──────────────┘
//! │              │   write-through, GREATEST       ┌──────────────┐
//! │              │────────────────────────────────►│   JobStore   │  ingestion_jobs table
//! └──────────────┘◄──── fallback on cache miss ────└──────────────┘
//! ```

pub mod cache;
pub mod job;
pub mod redis_cache;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::storage::StoreError;

pub use cache::{InMemoryJobCache, JobCache};
pub use job::{
    percent_complete, JobPatch, JobProgress, JobRecord, JobStatus, JobSummary,
    INGESTION_JOB_TYPE,
};
pub use redis_cache::RedisJobCache;
pub use store::{InMemoryJobStore, JobStore};

/// Default lifetime of a cached job record.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

/// Errors raised by the job tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job cache unavailable: {0}")]
    Cache(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

/// Creates, advances and reports on jobs.
pub struct JobTracker {
    cache: Arc<dyn JobCache>,
    store: Option<Arc<dyn JobStore>>,
    ttl: Duration,
    metrics: MetricsCollector,
}

impl JobTracker {
    pub fn new(cache: Arc<dyn JobCache>, ttl: Duration) -> Self {
        Self {
            cache,
            store: None,
            ttl,
            metrics: MetricsCollector,
        }
    }

    /// Tracker backed by an in-process cache and no durable store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryJobCache::new()), DEFAULT_JOB_TTL)
    }

    /// Attaches a durable store for write-through and cache-miss fallback.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Creates a job in `queued` status and returns its id.
    ///
    /// A fresh UUID is generated when `job_id` is `None`.
    pub async fn create_job(
        &self,
        job_type: &str,
        tasks_total: u64,
        metadata: Map<String, Value>,
        job_id: Option<String>,
    ) -> Result<String, TrackerError> {
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = JobRecord::new(job_id.clone(), job_type, tasks_total, metadata);

        self.cache.put(&record, self.ttl).await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.insert(&record).await {
                warn!(job_id = %job_id, error = %e, "Failed to persist new job");
            }
        }

        self.metrics.record_job_created(job_type);
        info!(job_id = %job_id, job_type = job_type, tasks_total = tasks_total, "Created job");
        Ok(job_id)
    }

    /// Merges `status` and `error` into the job and extends its TTL.
    ///
    /// `started_at` is stamped the first time the job enters `processing`
    /// and `completed_at` whenever it enters a terminal status. Returns true
    /// when this call changed the job's status; terminal statuses are final,
    /// so of several racing completions exactly one sees the transition.
    pub async fn update_job(
        &self,
        job_id: &str,
        status: Option<JobStatus>,
        error: Option<String>,
    ) -> Result<bool, TrackerError> {
        let patch = JobPatch::for_update(status, error);
        if patch.is_empty() {
            return Ok(false);
        }

        let previous = match self.cache.merge(job_id, &patch, self.ttl).await? {
            Some(previous) => previous,
            None => {
                self.rewarm(job_id).await?;
                self.cache
                    .merge(job_id, &patch, self.ttl)
                    .await?
                    .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))?
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.apply_patch(job_id, &patch).await {
                warn!(job_id = job_id, error = %e, "Failed to persist job update");
            }
        }

        let transitioned = status.is_some_and(|s| s != previous && !previous.is_terminal());
        if let Some(status) = status.filter(|_| transitioned) {
            if status.is_terminal() {
                self.metrics.record_job_finished(status.as_str());
            }
            debug!(job_id = job_id, from = %previous, to = %status, "Updated job status");
        }
        Ok(transitioned)
    }

    /// Atomically increments the processed-task count and returns it.
    ///
    /// The count never exceeds `tasks_total`, so redelivered tasks do not
    /// push a job past 100%.
    pub async fn increment_processed(&self, job_id: &str) -> Result<u64, TrackerError> {
        let count = match self.cache.increment_processed(job_id, self.ttl).await? {
            Some(count) => count,
            None => {
                self.rewarm(job_id).await?;
                self.cache
                    .increment_processed(job_id, self.ttl)
                    .await?
                    .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))?
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.record_progress(job_id, count).await {
                warn!(job_id = job_id, error = %e, "Failed to persist job progress");
            }
        }

        Ok(count)
    }

    /// Returns the job's progress, reading the cache first and the durable
    /// store when the cache entry has expired.
    pub async fn get_progress(&self, job_id: &str) -> Result<JobProgress, TrackerError> {
        if let Some(record) = self.cache.get(job_id).await? {
            return Ok(record.into());
        }

        let Some(record) = self.load_from_store(job_id).await? else {
            return Err(TrackerError::JobNotFound(job_id.to_string()));
        };
        match self.cache.put_if_absent(&record, self.ttl).await {
            Ok(true) => Ok(record.into()),
            // Another caller re-warmed first and may have moved on.
            Ok(false) => match self.cache.get(job_id).await? {
                Some(cached) => Ok(cached.into()),
                None => Ok(record.into()),
            },
            Err(e) => {
                warn!(job_id = job_id, error = %e, "Failed to re-cache job");
                Ok(record.into())
            }
        }
    }

    /// Lists jobs most recent first.
    ///
    /// Uses the durable store when one is attached, since the cache only
    /// holds jobs touched within the TTL.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobSummary>, TrackerError> {
        let records = match &self.store {
            Some(store) => match store.list(status, limit).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Job store unavailable, listing from cache");
                    self.cache.list(status, limit).await?
                }
            },
            None => self.cache.list(status, limit).await?,
        };

        Ok(records.iter().map(JobSummary::from).collect())
    }

    /// Reloads an expired job from the store into the cache. An entry that
    /// a concurrent caller cached first is left untouched.
    async fn rewarm(&self, job_id: &str) -> Result<(), TrackerError> {
        let Some(record) = self.load_from_store(job_id).await? else {
            return Err(TrackerError::JobNotFound(job_id.to_string()));
        };
        if !self.cache.put_if_absent(&record, self.ttl).await? {
            debug!(job_id = job_id, "Job already re-cached by another caller");
        }
        Ok(())
    }

    async fn load_from_store(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError> {
        match &self.store {
            Some(store) => {
                let record = store.get(job_id).await?;
                if record.is_some() {
                    debug!(job_id = job_id, "Loaded job from store after cache miss");
                }
                Ok(record)
            }
            None => Ok(None),
        }
    }
}
