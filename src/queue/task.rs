//! Work items carried by the task queue.
//!
//! A [`NewTask`] is what a submitter hands to `enqueue`; a [`Task`] is what a
//! consumer gets back from `read_batch`, with the queue-assigned message id
//! and the number of earlier delivery attempts. Both adapters store a task as
//! a flat list of string fields, the same shape as a Redis stream entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::QueueError;

/// Stream entry field names.
pub mod fields {
    pub const JOB_ID: &str = "job_id";
    pub const CHUNK_ID: &str = "chunk_id";
    pub const CONTENT: &str = "content";
    pub const SOURCE_URI: &str = "source_uri";
    pub const SOURCE_TYPE: &str = "source_type";
    pub const METADATA: &str = "metadata";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const TIMESTAMP: &str = "timestamp";
}

/// A task to be appended to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub job_id: String,
    pub chunk_id: String,
    pub content: String,
    pub source_uri: String,
    pub source_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewTask {
    pub fn new(
        job_id: impl Into<String>,
        chunk_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            chunk_id: chunk_id.into(),
            content: content.into(),
            source_uri: String::new(),
            source_type: "text".to_string(),
            metadata: Map::new(),
        }
    }

    pub fn with_source(mut self, uri: impl Into<String>, source_type: impl Into<String>) -> Self {
        self.source_uri = uri.into();
        self.source_type = source_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds one metadata key.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Encodes the task as stream entry fields.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        Ok(vec![
            (fields::JOB_ID, self.job_id.clone()),
            (fields::CHUNK_ID, self.chunk_id.clone()),
            (fields::CONTENT, self.content.clone()),
            (fields::SOURCE_URI, self.source_uri.clone()),
            (fields::SOURCE_TYPE, self.source_type.clone()),
            (fields::METADATA, serde_json::to_string(&self.metadata)?),
            (fields::RETRY_COUNT, "0".to_string()),
            (fields::TIMESTAMP, Utc::now().to_rfc3339()),
        ])
    }
}

/// A task delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Queue-assigned id, used for acknowledgment.
    pub message_id: String,
    pub job_id: String,
    pub chunk_id: String,
    pub content: String,
    pub source_uri: String,
    pub source_type: String,
    pub metadata: Map<String, Value>,
    /// Earlier delivery attempts that were not acknowledged.
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Decodes a stream entry.
    ///
    /// `prior_deliveries` is the number of times the entry was handed out
    /// before this delivery; it is added to the stored retry count.
    pub fn from_fields(
        message_id: &str,
        entry: &HashMap<String, String>,
        prior_deliveries: u32,
    ) -> Result<Self, QueueError> {
        let required = |name: &str| -> Result<String, QueueError> {
            entry
                .get(name)
                .cloned()
                .ok_or_else(|| QueueError::MalformedEntry {
                    message_id: message_id.to_string(),
                    reason: format!("missing field '{}'", name),
                })
        };

        let metadata = match entry.get(fields::METADATA) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Map::new(),
        };

        let stored_retries: u32 = entry
            .get(fields::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let enqueued_at = entry
            .get(fields::TIMESTAMP)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            message_id: message_id.to_string(),
            job_id: required(fields::JOB_ID)?,
            chunk_id: required(fields::CHUNK_ID)?,
            content: required(fields::CONTENT)?,
            source_uri: entry.get(fields::SOURCE_URI).cloned().unwrap_or_default(),
            source_type: entry.get(fields::SOURCE_TYPE).cloned().unwrap_or_default(),
            metadata,
            retry_count: stored_retries + prior_deliveries,
            enqueued_at,
        })
    }
}
