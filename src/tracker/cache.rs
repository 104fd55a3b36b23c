//! Fast, TTL-bounded job cache.
//!
//! The cache is the source of truth for live reads. Every mutation extends
//! the entry's TTL. `increment_processed` must be atomic across callers and
//! never raise the count past `tasks_total`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::job::{JobPatch, JobRecord, JobStatus};
use super::TrackerError;

#[async_trait]
pub trait JobCache: Send + Sync {
    /// Writes a fresh record, replacing any previous one.
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), TrackerError>;

    /// Writes `record` only if no live entry exists for its id. Returns
    /// true when written.
    async fn put_if_absent(&self, record: &JobRecord, ttl: Duration)
        -> Result<bool, TrackerError>;

    /// Merges `patch` into an existing record and returns the status it
    /// held before the merge, or `None` if absent.
    async fn merge(
        &self,
        job_id: &str,
        patch: &JobPatch,
        ttl: Duration,
    ) -> Result<Option<JobStatus>, TrackerError>;

    /// Atomically increments `tasks_processed`, capped at `tasks_total`.
    /// Returns the new count, or `None` if the record is absent.
    async fn increment_processed(
        &self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, TrackerError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError>;

    /// Most recent first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, TrackerError>;
}

#[derive(Debug)]
struct CachedJob {
    record: Mutex<JobRecord>,
    processed: AtomicU64,
    expires_at: Mutex<Instant>,
}

impl CachedJob {
    fn touch(&self, ttl: Duration) {
        *self.expires_at.lock().expect("job cache lock poisoned") = Instant::now() + ttl;
    }

    fn expired(&self) -> bool {
        Instant::now() >= *self.expires_at.lock().expect("job cache lock poisoned")
    }

    fn snapshot(&self) -> JobRecord {
        let mut record = self.record.lock().expect("job cache lock poisoned").clone();
        record.tasks_processed = self.processed.load(Ordering::SeqCst);
        record
    }
}

/// Job cache held in process memory, with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryJobCache {
    jobs: RwLock<HashMap<String, Arc<CachedJob>>>,
}

impl CachedJob {
    fn new(record: &JobRecord, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            processed: AtomicU64::new(record.tasks_processed),
            record: Mutex::new(record.clone()),
            expires_at: Mutex::new(Instant::now() + ttl),
        })
    }
}

impl InMemoryJobCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, job_id: &str) -> Option<Arc<CachedJob>> {
        let entry = self
            .jobs
            .read()
            .expect("job cache lock poisoned")
            .get(job_id)
            .cloned()?;

        if entry.expired() {
            let mut jobs = self.jobs.write().expect("job cache lock poisoned");
            // A concurrent re-warm may already have replaced the expired entry.
            if jobs.get(job_id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                jobs.remove(job_id);
            }
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl JobCache for InMemoryJobCache {
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), TrackerError> {
        self.jobs
            .write()
            .expect("job cache lock poisoned")
            .insert(record.job_id.clone(), CachedJob::new(record, ttl));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        record: &JobRecord,
        ttl: Duration,
    ) -> Result<bool, TrackerError> {
        let mut jobs = self.jobs.write().expect("job cache lock poisoned");
        match jobs.entry(record.job_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().expired() {
                    return Ok(false);
                }
                occupied.insert(CachedJob::new(record, ttl));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedJob::new(record, ttl));
            }
        }
        Ok(true)
    }

    async fn merge(
        &self,
        job_id: &str,
        patch: &JobPatch,
        ttl: Duration,
    ) -> Result<Option<JobStatus>, TrackerError> {
        let Some(entry) = self.live(job_id) else {
            return Ok(None);
        };
        let previous = {
            let mut record = entry.record.lock().expect("job cache lock poisoned");
            let previous = record.status;
            record.apply(patch);
            previous
        };
        entry.touch(ttl);
        Ok(Some(previous))
    }

    async fn increment_processed(
        &self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, TrackerError> {
        let Some(entry) = self.live(job_id) else {
            return Ok(None);
        };
        let total = entry
            .record
            .lock()
            .expect("job cache lock poisoned")
            .tasks_total;

        let count = match entry
            .processed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                (done < total).then_some(done + 1)
            }) {
            Ok(previous) => previous + 1,
            Err(unchanged) => unchanged,
        };
        entry.touch(ttl);
        Ok(Some(count))
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError> {
        Ok(self.live(job_id).map(|entry| entry.snapshot()))
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, TrackerError> {
        let entries: Vec<Arc<CachedJob>> = {
            let mut jobs = self.jobs.write().expect("job cache lock poisoned");
            jobs.retain(|_, entry| !entry.expired());
            jobs.values().cloned().collect()
        };

        let mut records: Vec<JobRecord> = entries
            .iter()
            .map(|e| e.snapshot())
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    const TTL: Duration = Duration::from_secs(3600);

    fn record(id: &str, total: u64) -> JobRecord {
        JobRecord::new(id, "lightrag_ingestion", total, Map::new())
    }

    #[tokio::test]
    async fn test_increment_is_capped_at_total() {
        let cache = InMemoryJobCache::new();
        cache.put(&record("j", 2), TTL).await.unwrap();

        assert_eq!(cache.increment_processed("j", TTL).await.unwrap(), Some(1));
        assert_eq!(cache.increment_processed("j", TTL).await.unwrap(), Some(2));
        assert_eq!(cache.increment_processed("j", TTL).await.unwrap(), Some(2));
        assert_eq!(cache.increment_processed("nope", TTL).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_exact() {
        let cache = Arc::new(InMemoryJobCache::new());
        cache.put(&record("j", 1000), TTL).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.increment_processed("j", TTL).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = cache.get("j").await.unwrap().unwrap();
        assert_eq!(stored.tasks_processed, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_and_mutations_extend_ttl() {
        let cache = InMemoryJobCache::new();
        let ttl = Duration::from_secs(10);
        cache.put(&record("j", 3), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.increment_processed("j", ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("j").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get("j").await.unwrap().is_none());
        assert!(cache
            .merge("j", &JobPatch::default(), ttl)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_if_absent_keeps_live_entry() {
        let cache = InMemoryJobCache::new();
        let ttl = Duration::from_secs(10);
        cache.put(&record("j", 5), ttl).await.unwrap();
        cache.increment_processed("j", ttl).await.unwrap();

        // A stale copy must not clobber the live count.
        assert!(!cache.put_if_absent(&record("j", 5), ttl).await.unwrap());
        assert_eq!(cache.get("j").await.unwrap().unwrap().tasks_processed, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let mut stored = record("j", 5);
        stored.tasks_processed = 1;
        assert!(cache.put_if_absent(&stored, ttl).await.unwrap());
        assert_eq!(cache.increment_processed("j", ttl).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_merge_reports_previous_status() {
        let cache = InMemoryJobCache::new();
        cache.put(&record("j", 1), TTL).await.unwrap();
        let complete = JobPatch::for_update(Some(JobStatus::Completed), None);

        assert_eq!(
            cache.merge("j", &complete, TTL).await.unwrap(),
            Some(JobStatus::Queued)
        );
        assert_eq!(
            cache.merge("j", &complete, TTL).await.unwrap(),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_drops_expired_entries() {
        let cache = InMemoryJobCache::new();
        let ttl = Duration::from_secs(10);
        cache.put(&record("a", 1), ttl).await.unwrap();
        cache.put(&record("b", 1), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put(&record("c", 1), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let listed = cache.list(None, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id, "c");
        assert_eq!(cache.jobs.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let cache = InMemoryJobCache::new();
        let mut older = record("old", 1);
        older.created_at -= chrono::Duration::seconds(60);
        cache.put(&older, TTL).await.unwrap();
        cache.put(&record("new", 1), TTL).await.unwrap();
        cache
            .merge(
                "old",
                &JobPatch::for_update(Some(JobStatus::Failed), None),
                TTL,
            )
            .await
            .unwrap();

        let all = cache.list(None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let failed = cache.list(Some(JobStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, "old");

        assert_eq!(cache.list(None, 1).await.unwrap().len(), 1);
    }
}
