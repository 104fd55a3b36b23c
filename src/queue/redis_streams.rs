//! Redis Streams adapter for [`TaskQueue`].
//!
//! | Operation               | Redis                                   |
//! |-------------------------|-----------------------------------------|
//! | `enqueue`               | `XADD stream MAXLEN ~ n * field value…` |
//! | `ensure_consumer_group` | `XGROUP CREATE stream group $ MKSTREAM` |
//! | `read_batch`            | `XPENDING … IDLE` + `XCLAIM`, then `XREADGROUP … >` |
//! | `acknowledge`           | `XACK` (+ `XDEL` when `delete_on_ack`)  |
//! | `depth`                 | `XLEN`                                  |
//!
//! Reclaiming filters on idle time server side (`XPENDING … IDLE`, Redis
//! 6.2+), so an orphaned entry is found even behind entries still held by
//! live consumers.
//!
//! Blocking reads run on a connection owned by the reading consumer so that
//! a worker parked in `XREADGROUP BLOCK` does not stall enqueues and acks
//! sharing the main multiplexed connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::task::{NewTask, Task};
use super::{QueueConfig, QueueError, TaskQueue};

/// Task queue backed by a Redis stream.
pub struct RedisTaskQueue {
    client: redis::Client,
    /// Shared connection for non-blocking commands.
    redis: ConnectionManager,
    /// One connection per consumer for blocking reads.
    readers: Mutex<HashMap<String, ConnectionManager>>,
    config: QueueConfig,
}

impl RedisTaskQueue {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        info!(stream = %config.stream_name, "Connected task queue to Redis");

        Ok(Self {
            client,
            redis,
            readers: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn reader(&self, consumer: &str) -> Result<ConnectionManager, QueueError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Moves entries idle longer than `claim_idle` to `consumer`.
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let idle_ms = self.config.claim_idle.as_millis() as usize;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max_count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_group_error(e, group))?;

        let stale: HashMap<String, usize> = pending
            .ids
            .into_iter()
            .map(|p| (p.id, p.times_delivered))
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&String> = stale.keys().collect();
        let claimed: StreamClaimReply = conn
            .xclaim(&self.config.stream_name, group, consumer, idle_ms, ids.as_slice())
            .await?;

        let mut tasks = Vec::with_capacity(claimed.ids.len());
        for entry in &claimed.ids {
            let prior = stale.get(&entry.id).copied().unwrap_or(1) as u32;
            match decode(entry, prior) {
                Ok(task) => tasks.push(task),
                Err(e) => self.discard(group, &entry.id, &e).await,
            }
        }
        tasks.sort_by(|a, b| compare_ids(&a.message_id, &b.message_id));

        if !tasks.is_empty() {
            info!(
                stream = %self.config.stream_name,
                group = group,
                consumer = consumer,
                count = tasks.len(),
                "Reclaimed idle pending entries"
            );
        }

        Ok(tasks)
    }

    /// Acknowledges an entry that can never be decoded so it is not
    /// redelivered forever.
    async fn discard(&self, group: &str, message_id: &str, error: &QueueError) {
        warn!(
            stream = %self.config.stream_name,
            message_id = message_id,
            error = %error,
            "Discarding malformed stream entry"
        );
        if let Err(e) = self.acknowledge(group, message_id).await {
            warn!(message_id = message_id, error = %e, "Failed to discard malformed entry");
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    async fn enqueue(&self, task: NewTask) -> Result<String, QueueError> {
        let fields = task.to_fields()?;
        let mut conn = self.redis.clone();
        let id: String = conn
            .xadd_maxlen(
                &self.config.stream_name,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &fields,
            )
            .await?;

        debug!(stream = %self.config.stream_name, message_id = %id, job_id = %task.job_id, "Enqueued task");
        Ok(id)
    }

    async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<String>, QueueError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let encoded: Result<Vec<_>, _> = tasks.iter().map(NewTask::to_fields).collect();
        let encoded = encoded?;

        let mut pipe = redis::pipe();
        for fields in &encoded {
            pipe.xadd_maxlen(
                &self.config.stream_name,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                fields,
            );
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;
        Ok(ids)
    }

    async fn ensure_consumer_group(&self, group: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream_name, group, "$")
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.config.stream_name, group = group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
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

        let mut tasks = self.claim_stale(group, consumer, max_count).await?;
        if tasks.len() >= max_count {
            return Ok(tasks);
        }

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count - tasks.len());

        // Reclaimed work is returned immediately rather than held back by a
        // blocking read.
        let mut conn = if tasks.is_empty() && !block.is_zero() {
            options = options.block(block.as_millis() as usize);
            self.reader(consumer).await?
        } else {
            self.redis.clone()
        };

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream_name], &[">"], &options)
            .await
            .map_err(|e| map_group_error(e, group))?;

        if let Some(reply) = reply {
            for key in &reply.keys {
                for entry in &key.ids {
                    match decode(entry, 0) {
                        Ok(task) => tasks.push(task),
                        Err(e) => self.discard(group, &entry.id, &e).await,
                    }
                }
            }
        }

        Ok(tasks)
    }

    async fn acknowledge(&self, group: &str, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        if self.config.delete_on_ack {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .xack(&self.config.stream_name, group, &[message_id])
                .xdel(&self.config.stream_name, &[message_id]);
            pipe.query_async::<_, ()>(&mut conn).await?;
        } else {
            conn.xack::<_, _, _, ()>(&self.config.stream_name, group, &[message_id])
                .await?;
        }

        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    async fn pending(&self, group: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let reply: StreamPendingReply = conn
            .xpending(&self.config.stream_name, group)
            .await
            .map_err(|e| map_group_error(e, group))?;
        Ok(reply.count() as u64)
    }
}

fn decode(entry: &StreamId, prior_deliveries: u32) -> Result<Task, QueueError> {
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (key, value) in &entry.map {
        let value: String =
            redis::from_redis_value(value).map_err(|e| QueueError::MalformedEntry {
                message_id: entry.id.clone(),
                reason: format!("field '{}': {}", key, e),
            })?;
        fields.insert(key.clone(), value);
    }
    Task::from_fields(&entry.id, &fields, prior_deliveries)
}

fn map_group_error(e: redis::RedisError, group: &str) -> QueueError {
    if e.to_string().contains("NOGROUP") {
        QueueError::UnknownGroup(group.to_string())
    } else {
        QueueError::RedisError(e)
    }
}

/// Orders stream ids (`<ms>-<seq>`) numerically.
fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(id: &str) -> (u64, u64) {
        let mut it = id.splitn(2, '-');
        let ms = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let seq = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (ms, seq)
    }
    parts(a).cmp(&parts(b))
}
