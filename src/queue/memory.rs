//! In-process [`TaskQueue`] with the same consumer-group semantics as the
//! Redis adapter. Used by tests and by `--backend memory` runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::task::{NewTask, Task};
use super::{QueueConfig, QueueError, TaskQueue};

#[derive(Debug)]
struct Entry {
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest sequence handed out by a `>` read.
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    last_ms: i64,
    entries: BTreeMap<u64, Entry>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: HashMap<String, String>) -> String {
        self.next_seq += 1;
        self.last_ms = self.last_ms.max(Utc::now().timestamp_millis());
        let seq = self.next_seq;
        let id = format!("{}-{}", self.last_ms, seq);
        self.entries.insert(
            seq,
            Entry {
                id: id.clone(),
                fields,
            },
        );
        id
    }

    /// Drops the oldest settled entries until the stream is back under
    /// `max_len`. An entry is settled once every group has read past it and
    /// none holds it pending; unread and pending entries are never trimmed.
    fn trim(&mut self, max_len: usize) {
        if self.entries.len() <= max_len {
            return;
        }

        let excess = self.entries.len() - max_len;
        let groups = &self.groups;
        let removable: Vec<u64> = self
            .entries
            .keys()
            .copied()
            .filter(|seq| {
                groups
                    .values()
                    .all(|g| *seq <= g.last_delivered && !g.pending.contains_key(seq))
            })
            .take(excess)
            .collect();

        let trimmed = removable.len();
        for seq in removable {
            self.entries.remove(&seq);
        }

        if trimmed < excess {
            debug!(
                retained = self.entries.len(),
                max_len = max_len,
                "Stream above max length, remaining entries are unsettled"
            );
        }
    }

    fn read(
        &mut self,
        group: &str,
        consumer: &str,
        max_count: usize,
        claim_idle: Duration,
    ) -> Result<Vec<Task>, QueueError> {
        let now = Instant::now();
        let Self {
            entries, groups, ..
        } = self;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::UnknownGroup(group.to_string()))?;

        let mut tasks = Vec::new();

        // Reclaim idle pending entries first.
        let stale: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= claim_idle)
            .map(|(seq, _)| *seq)
            .take(max_count)
            .collect();

        for seq in stale {
            let Some(entry) = entries.get(&seq) else {
                // Entry trimmed or deleted while pending.
                state.pending.remove(&seq);
                continue;
            };
            let Some(pending) = state.pending.get_mut(&seq) else {
                continue;
            };
            let prior = pending.deliveries;
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            tasks.push(Task::from_fields(&entry.id, &entry.fields, prior)?);
        }

        // Then new entries past the group's offset.
        let fresh: Vec<u64> = entries
            .range(state.last_delivered + 1..)
            .map(|(seq, _)| *seq)
            .take(max_count.saturating_sub(tasks.len()))
            .collect();

        for seq in fresh {
            let entry = &entries[&seq];
            state.last_delivered = seq;
            state.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            tasks.push(Task::from_fields(&entry.id, &entry.fields, 0)?);
        }

        Ok(tasks)
    }
}

/// Task queue held in process memory.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    config: QueueConfig,
    state: Mutex<StreamState>,
    appended: Notify,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryTaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StreamState::default()),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().expect("in-memory queue lock poisoned")
    }

    /// Consumer currently holding `message_id` for `group`, if pending.
    pub fn pending_owner(&self, group: &str, message_id: &str) -> Option<String> {
        let seq = parse_seq(message_id)?;
        self.lock()
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|p| p.consumer.clone())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    async fn enqueue(&self, task: NewTask) -> Result<String, QueueError> {
        let mut ids = self.enqueue_batch(vec![task]).await?;
        ids.pop().ok_or_else(|| QueueError::MalformedEntry {
            message_id: String::new(),
            reason: "append produced no id".to_string(),
        })
    }

    async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<String>, QueueError> {
        let mut encoded = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let fields: HashMap<String, String> = task
                .to_fields()?
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            encoded.push(fields);
        }

        let ids = {
            let mut state = self.lock();
            let ids: Vec<String> = encoded.into_iter().map(|f| state.append(f)).collect();
            state.trim(self.config.max_len);
            ids
        };

        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn ensure_consumer_group(&self, group: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let tail = state.next_seq;
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: tail,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Task>, QueueError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let tasks = self
                .lock()
                .read(group, consumer, max_count, self.config.claim_idle)?;
            if !tasks.is_empty() || Instant::now() >= deadline {
                return Ok(tasks);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self
                    .lock()
                    .read(group, consumer, max_count, self.config.claim_idle);
            }
        }
    }

    async fn acknowledge(&self, group: &str, message_id: &str) -> Result<(), QueueError> {
        let Some(seq) = parse_seq(message_id) else {
            return Ok(());
        };

        let mut state = self.lock();
        let acked = state
            .groups
            .get_mut(group)
            .map(|g| g.pending.remove(&seq).is_some())
            .unwrap_or(false);

        if acked && self.config.delete_on_ack {
            state.entries.remove(&seq);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock().entries.len() as u64)
    }

    async fn pending(&self, group: &str) -> Result<u64, QueueError> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| QueueError::UnknownGroup(group.to_string()))
    }
}

fn parse_seq(message_id: &str) -> Option<u64> {
    message_id.rsplit_once('-')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const GROUP: &str = "lightrag-workers";

    async fn queue_with_group(config: QueueConfig) -> InMemoryTaskQueue {
        let queue = InMemoryTaskQueue::new(config);
        queue.ensure_consumer_group(GROUP).await.unwrap();
        queue
    }

    fn task(n: usize) -> NewTask {
        NewTask::new("job-1", format!("job-1::{}", n), format!("chunk {}", n))
            .with_meta("chunk_index", n)
    }

    #[tokio::test]
    async fn test_enqueue_then_read_preserves_task() {
        let queue = queue_with_group(QueueConfig::default()).await;
        let id = queue
            .enqueue(task(0).with_source("file:///a.txt", "text"))
            .await
            .unwrap();

        let batch = queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].job_id, "job-1");
        assert_eq!(batch[0].chunk_id, "job-1::0");
        assert_eq!(batch[0].content, "chunk 0");
        assert_eq!(batch[0].metadata["chunk_index"], 0);
        assert_eq!(batch[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_batch_is_in_append_order_and_bounded() {
        let queue = queue_with_group(QueueConfig::default()).await;
        for i in 0..5 {
            queue.enqueue(task(i)).await.unwrap();
        }

        let first = queue
            .read_batch(GROUP, "worker-0", 3, Duration::ZERO)
            .await
            .unwrap();
        let second = queue
            .read_batch(GROUP, "worker-1", 3, Duration::ZERO)
            .await
            .unwrap();

        let chunks: Vec<&str> = first.iter().map(|t| t.chunk_id.as_str()).collect();
        assert_eq!(chunks, vec!["job-1::0", "job-1::1", "job-1::2"]);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].chunk_id, "job-1::3");
    }

    #[tokio::test]
    async fn test_group_starts_at_tail() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(task(0)).await.unwrap();
        queue.ensure_consumer_group(GROUP).await.unwrap();
        queue.enqueue(task(1)).await.unwrap();

        let batch = queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].chunk_id, "job-1::1");
    }

    #[tokio::test]
    async fn test_ensure_consumer_group_is_idempotent() {
        let queue = queue_with_group(QueueConfig::default()).await;
        queue.enqueue(task(0)).await.unwrap();
        queue.ensure_consumer_group(GROUP).await.unwrap();

        let batch = queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_group_is_an_error() {
        let queue = InMemoryTaskQueue::default();
        let err = queue
            .read_batch("missing", "worker-0", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn test_acknowledge_removes_entry() {
        let queue = queue_with_group(QueueConfig::default()).await;
        let id = queue.enqueue(task(0)).await.unwrap();
        queue
            .read_batch(GROUP, "worker-0", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queue.pending(GROUP).await.unwrap(), 1);

        queue.acknowledge(GROUP, &id).await.unwrap();
        queue.acknowledge(GROUP, &id).await.unwrap();

        assert_eq!(queue.pending(GROUP).await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_without_delete_keeps_depth() {
        let queue = queue_with_group(QueueConfig::default().with_delete_on_ack(false)).await;
        let id = queue.enqueue(task(0)).await.unwrap();
        queue
            .read_batch(GROUP, "worker-0", 1, Duration::ZERO)
            .await
            .unwrap();
        queue.acknowledge(GROUP, &id).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 1);
        assert_eq!(queue.pending(GROUP).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_task_is_redelivered_to_other_consumer() {
        let queue = queue_with_group(
            QueueConfig::default().with_claim_idle(Duration::from_secs(30)),
        )
        .await;
        let id = queue.enqueue(task(0)).await.unwrap();

        let first = queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Not idle long enough yet.
        let none = queue
            .read_batch(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let again = queue
            .read_batch(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, id);
        assert_eq!(again[0].retry_count, 1);
        assert_eq!(queue.pending_owner(GROUP, &id).as_deref(), Some("worker-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_task_is_not_redelivered() {
        let queue = queue_with_group(
            QueueConfig::default().with_claim_idle(Duration::from_secs(1)),
        )
        .await;
        let id = queue.enqueue(task(0)).await.unwrap();
        queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();
        queue.acknowledge(GROUP, &id).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let batch = queue
            .read_batch(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let queue = queue_with_group(QueueConfig::default()).await;
        let started = Instant::now();

        let batch = queue
            .read_batch(GROUP, "worker-0", 10, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_enqueue() {
        let queue = Arc::new(queue_with_group(QueueConfig::default()).await);

        let reader = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            reader
                .read_batch(GROUP, "worker-0", 10, Duration::from_secs(30))
                .await
        });

        tokio::task::yield_now().await;
        queue.enqueue(task(7)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reader should wake")
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].chunk_id, "job-1::7");
    }

    #[tokio::test]
    async fn test_trim_never_drops_unsettled_entries() {
        let queue = queue_with_group(QueueConfig::default().with_max_len(2)).await;
        queue.enqueue(task(0)).await.unwrap();
        let pending = queue
            .read_batch(GROUP, "worker-0", 1, Duration::ZERO)
            .await
            .unwrap();

        queue.enqueue(task(1)).await.unwrap();
        queue.enqueue(task(2)).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 3);
        assert!(queue
            .pending_owner(GROUP, &pending[0].message_id)
            .is_some());
    }

    #[tokio::test]
    async fn test_trim_drops_oldest_acknowledged_entries() {
        let queue = queue_with_group(
            QueueConfig::default()
                .with_max_len(2)
                .with_delete_on_ack(false),
        )
        .await;
        let id = queue.enqueue(task(0)).await.unwrap();
        queue
            .read_batch(GROUP, "worker-0", 1, Duration::ZERO)
            .await
            .unwrap();
        queue.acknowledge(GROUP, &id).await.unwrap();

        queue.enqueue(task(1)).await.unwrap();
        queue.enqueue(task(2)).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        let batch = queue
            .read_batch(GROUP, "worker-0", 10, Duration::ZERO)
            .await
            .unwrap();
        let chunks: Vec<&str> = batch.iter().map(|t| t.chunk_id.as_str()).collect();
        assert_eq!(chunks, vec!["job-1::1", "job-1::2"]);
    }

    #[tokio::test]
    async fn test_enqueue_batch_returns_ids_in_order() {
        let queue = queue_with_group(QueueConfig::default()).await;
        let ids = queue
            .enqueue_batch((0..3).map(task).collect())
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        let seqs: Vec<u64> = ids.iter().filter_map(|id| parse_seq(id)).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
