//! Durable task queue with consumer-group semantics.
//!
//! The queue is an append-only log ("stream") with named consumer groups.
//! Each group has its own read offset; an entry read by one consumer stays
//! pending for that group until it is acknowledged, and pending entries idle
//! for longer than the claim timeout are handed to the next reader. That is
//! the at-least-once guarantee the worker pool relies on.
//!
//! # Adapters
//!
//! - **RedisTaskQueue**: Redis Streams (`XADD`, `XREADGROUP`, `XCLAIM`, `XACK`)
//! - **InMemoryTaskQueue**: same semantics inside the process, for tests and
//!   local runs
//!
//! # Stream layout
//!
//! ```text
//!   XADD ──► [ 1-0 | 2-0 | 3-0 | 4-0 | 5-0 ] ◄── MAXLEN ~ trims from the left
//!                     ▲           ▲
//!                     │           └── group "lightrag-workers" last delivered
//!                     └── pending, idle > claim_idle: reclaimed on next read
//! ```

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis_streams;
pub mod task;

pub use self::memory::InMemoryTaskQueue;
pub use self::redis_streams::RedisTaskQueue;
pub use self::task::{NewTask, Task};

/// Default ingestion stream.
pub const DEFAULT_STREAM: &str = "shield:ingestion_queue";

/// Default consumer group shared by ingestion workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "lightrag-workers";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse task metadata.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A stream entry could not be decoded into a task.
    #[error("Malformed entry {message_id}: {reason}")]
    MalformedEntry { message_id: String, reason: String },

    /// Read from a consumer group that was never created.
    #[error("Consumer group '{0}' does not exist")]
    UnknownGroup(String),
}

/// Settings shared by both adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name of the stream.
    pub stream_name: String,
    /// Approximate number of entries retained before the oldest are trimmed.
    pub max_len: usize,
    /// How long an entry may stay pending before another consumer can claim it.
    pub claim_idle: Duration,
    /// Delete entries from the stream once acknowledged.
    pub delete_on_ack: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream_name: DEFAULT_STREAM.to_string(),
            max_len: 10_000,
            claim_idle: Duration::from_secs(300),
            delete_on_ack: true,
        }
    }
}

impl QueueConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn with_delete_on_ack(mut self, delete: bool) -> Self {
        self.delete_on_ack = delete;
        self
    }
}

/// Operations the worker pool and submitters need from a queue.
///
/// A queue instance is bound to one stream.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Name of the stream this queue reads and writes.
    fn stream_name(&self) -> &str;

    /// Appends a task and returns its message id. Never waits on consumers.
    async fn enqueue(&self, task: NewTask) -> Result<String, QueueError>;

    /// Appends several tasks in one round trip, returning ids in order.
    async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<String>, QueueError>;

    /// Creates `group` at the current tail of the stream if it does not exist.
    async fn ensure_consumer_group(&self, group: &str) -> Result<(), QueueError>;

    /// Claims up to `max_count` tasks for `consumer`.
    ///
    /// Entries pending longer than the claim timeout are reclaimed first,
    /// then new entries are read. Waits up to `block` when nothing is
    /// available and returns an empty batch on timeout.
    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Task>, QueueError>;

    /// Marks an entry processed for `group`. Unknown ids are ignored.
    async fn acknowledge(&self, group: &str, message_id: &str) -> Result<(), QueueError>;

    /// Number of entries currently retained in the stream.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Number of entries delivered to `group` but not yet acknowledged.
    async fn pending(&self, group: &str) -> Result<u64, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "shield:ingestion_queue");
        assert_eq!(config.max_len, 10_000);
        assert_eq!(config.claim_idle, Duration::from_secs(300));
        assert!(config.delete_on_ack);
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::new("custom")
            .with_max_len(50)
            .with_claim_idle(Duration::from_millis(10))
            .with_delete_on_ack(false);

        assert_eq!(config.stream_name, "custom");
        assert_eq!(config.max_len, 50);
        assert_eq!(config.claim_idle, Duration::from_millis(10));
        assert!(!config.delete_on_ack);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::UnknownGroup("workers".to_string());
        assert!(err.to_string().contains("workers"));

        let err = QueueError::MalformedEntry {
            message_id: "1-0".to_string(),
            reason: "missing field".to_string(),
        };
        assert!(err.to_string().contains("1-0"));
    }
}
