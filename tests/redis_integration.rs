//! Integration tests for the Redis queue and job cache.
//!
//! These tests need a running Redis server and write to uniquely named keys.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use uuid::Uuid;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use rag_orchestrator::queue::{NewTask, QueueConfig, RedisTaskQueue, TaskQueue};
use rag_orchestrator::tracker::redis_cache::job_key;
use rag_orchestrator::tracker::{
    JobCache, JobPatch, JobRecord, JobStatus, JobTracker, RedisJobCache, DEFAULT_JOB_TTL,
    INGESTION_JOB_TYPE,
};

const GROUP: &str = "lightrag-workers";

fn redis_url() -> String {
    std::env::var("REDIS_URL")
        .expect("REDIS_URL environment variable must be set for integration tests")
}

async fn raw_connection() -> ConnectionManager {
    let client = redis::Client::open(redis_url()).expect("Should parse REDIS_URL");
    ConnectionManager::new(client)
        .await
        .expect("Should connect to Redis")
}

async fn fresh_queue(claim_idle: Duration) -> RedisTaskQueue {
    let stream = format!("test:ingestion:{}", Uuid::new_v4());
    let config = QueueConfig::new(stream).with_claim_idle(claim_idle);
    let queue = RedisTaskQueue::connect(&redis_url(), config)
        .await
        .expect("Should connect to Redis");
    queue
        .ensure_consumer_group(GROUP)
        .await
        .expect("Should create consumer group");
    queue
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_stream_enqueue_read_ack() {
    let queue = fresh_queue(Duration::from_secs(300)).await;

    // Creating the group twice is fine.
    queue.ensure_consumer_group(GROUP).await.unwrap();

    let ids = queue
        .enqueue_batch(vec![
            NewTask::new("job-1", "job-1::0", "alpha").with_source("s3://a", "text"),
            NewTask::new("job-1", "job-1::1", "beta").with_meta("chunk_index", 1u64),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(queue.depth().await.unwrap(), 2);

    let tasks = queue
        .read_batch(GROUP, "worker-0", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].message_id, ids[0]);
    assert_eq!(tasks[0].content, "alpha");
    assert_eq!(tasks[0].source_uri, "s3://a");
    assert_eq!(tasks[0].retry_count, 0);
    assert_eq!(queue.pending(GROUP).await.unwrap(), 2);

    for task in &tasks {
        queue.acknowledge(GROUP, &task.message_id).await.unwrap();
    }
    assert_eq!(queue.pending(GROUP).await.unwrap(), 0);
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_idle_pending_task_is_redelivered() {
    let queue = fresh_queue(Duration::from_millis(100)).await;
    queue
        .enqueue(NewTask::new("job-2", "job-2::0", "gamma"))
        .await
        .unwrap();

    let first = queue
        .read_batch(GROUP, "worker-0", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = queue
        .read_batch(GROUP, "worker-1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert!(second[0].retry_count >= 1);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_stale_entry_behind_live_entry_is_reclaimed() {
    let queue = fresh_queue(Duration::from_millis(300)).await;
    let ids = queue
        .enqueue_batch(vec![
            NewTask::new("job-3", "job-3::0", "held"),
            NewTask::new("job-3", "job-3::1", "orphaned"),
        ])
        .await
        .unwrap();

    let first = queue
        .read_batch(GROUP, "worker-0", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;

    // worker-0 is still working on the older entry, which resets its idle time.
    let mut conn = raw_connection().await;
    let _: redis::Value = redis::cmd("XCLAIM")
        .arg(queue.stream_name())
        .arg(GROUP)
        .arg("worker-0")
        .arg(0)
        .arg(&ids[0])
        .arg("JUSTID")
        .query_async(&mut conn)
        .await
        .unwrap();

    let reclaimed = queue
        .read_batch(GROUP, "worker-1", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message_id, ids[1]);
    assert_eq!(reclaimed[0].content, "orphaned");
    assert!(reclaimed[0].retry_count >= 1);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_cache_scripts_on_missing_and_full_jobs() {
    let cache = RedisJobCache::connect(&redis_url())
        .await
        .expect("Should connect to Redis");
    let mut conn = raw_connection().await;
    let ttl = Duration::from_secs(60);

    let missing = format!("test-missing-{}", Uuid::new_v4());
    let patch = JobPatch::for_update(Some(JobStatus::Failed), Some("late".to_string()));
    assert_eq!(cache.merge(&missing, &patch, ttl).await.unwrap(), None);
    assert_eq!(cache.increment_processed(&missing, ttl).await.unwrap(), None);
    let exists: bool = conn.exists(job_key(&missing)).await.unwrap();
    assert!(!exists, "scripts must not create a partial hash");

    let record = JobRecord::new(
        format!("test-{}", Uuid::new_v4()),
        INGESTION_JOB_TYPE,
        2,
        Map::new(),
    );
    assert!(cache.put_if_absent(&record, ttl).await.unwrap());
    assert_eq!(cache.increment_processed(&record.job_id, ttl).await.unwrap(), Some(1));
    assert!(!cache.put_if_absent(&record, ttl).await.unwrap());
    assert_eq!(cache.increment_processed(&record.job_id, ttl).await.unwrap(), Some(2));
    assert_eq!(cache.increment_processed(&record.job_id, ttl).await.unwrap(), Some(2));

    let complete = JobPatch::for_update(Some(JobStatus::Completed), None);
    assert_eq!(
        cache.merge(&record.job_id, &complete, ttl).await.unwrap(),
        Some(JobStatus::Queued)
    );
    assert_eq!(
        cache.merge(&record.job_id, &patch, ttl).await.unwrap(),
        Some(JobStatus::Completed)
    );

    let stored = cache.get(&record.job_id).await.unwrap().unwrap();
    assert_eq!(stored.tasks_processed, 2);
    assert_eq!(stored.status, JobStatus::Completed);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_tracker_over_redis_cache() {
    let cache = RedisJobCache::connect(&redis_url())
        .await
        .expect("Should connect to Redis");
    let tracker = Arc::new(JobTracker::new(Arc::new(cache), DEFAULT_JOB_TTL));

    let job_id = tracker
        .create_job(
            INGESTION_JOB_TYPE,
            2,
            Map::new(),
            Some(format!("test-{}", Uuid::new_v4())),
        )
        .await
        .unwrap();

    tracker
        .update_job(&job_id, Some(JobStatus::Processing), None)
        .await
        .unwrap();

    // Concurrent increments never pass the total.
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let tracker = tracker.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move { tracker.increment_processed(&job_id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    tracker
        .update_job(&job_id, Some(JobStatus::Completed), None)
        .await
        .unwrap();
    tracker
        .update_job(&job_id, Some(JobStatus::Processing), None)
        .await
        .unwrap();

    let progress = tracker.get_progress(&job_id).await.unwrap();
    assert_eq!(progress.tasks_processed, 2);
    assert_eq!(progress.status, JobStatus::Completed);
    assert!(progress.completed_at.is_some());

    let missing = tracker.get_progress("test-missing-job").await;
    assert!(missing.is_err());
}
