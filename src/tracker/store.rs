//! Durable job store seam.
//!
//! The PostgreSQL implementation lives in [`crate::storage`]; the in-memory
//! one here backs tests and `--backend memory`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::job::{JobPatch, JobRecord, JobStatus};
use crate::storage::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new record. An existing row with the same id is replaced.
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Merges `patch` into the stored row. Returns false if there is none.
    async fn apply_patch(&self, job_id: &str, patch: &JobPatch) -> Result<bool, StoreError>;

    /// Raises the stored processed count to `processed`. Never lowers it.
    async fn record_progress(&self, job_id: &str, processed: u64) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Most recent first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    rows: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("job store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.rows
            .write()
            .expect("job store lock poisoned")
            .insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn apply_patch(&self, job_id: &str, patch: &JobPatch) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().expect("job store lock poisoned");
        match rows.get_mut(job_id) {
            Some(row) => {
                row.apply(patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_progress(&self, job_id: &str, processed: u64) -> Result<(), StoreError> {
        if let Some(row) = self
            .rows
            .write()
            .expect("job store lock poisoned")
            .get_mut(job_id)
        {
            row.tasks_processed = row.tasks_processed.max(processed);
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .rows
            .read()
            .expect("job store lock poisoned")
            .get(job_id)
            .cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self
            .rows
            .read()
            .expect("job store lock poisoned")
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}
