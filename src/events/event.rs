//! Lifecycle events and their SSE encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names published by the orchestrator.
pub mod event_types {
    pub const INGESTION_QUEUED: &str = "ingestion.queued";
    pub const WORKER_POOL_STARTED: &str = "worker_pool.started";
    pub const WORKER_POOL_STOPPED: &str = "worker_pool.stopped";
    pub const WORKER_STARTED: &str = "worker.started";
    pub const WORKER_STOPPED: &str = "worker.stopped";
    pub const WORKER_RESTARTING: &str = "worker.restarting";
    pub const WORKER_TASK_FAILED: &str = "worker.task_failed";
    pub const JOB_PROGRESS: &str = "job.progress";
    pub const JOB_COMPLETED: &str = "job.completed";
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the bus's publish order, starting at 1.
    pub seq: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<String>,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
}

impl Event {
    pub fn new(
        seq: u64,
        event_type: impl Into<String>,
        job_id: Option<String>,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            seq,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            job_id,
            data,
            metadata,
        }
    }

    /// Renders the event as one Server-Sent Events frame.
    ///
    /// Line breaks are stripped from the event type so it cannot end the
    /// `event:` field early. The JSON payload never contains raw newlines.
    pub fn to_sse(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        let event_type = self.event_type.replace(['\r', '\n'], "");
        format!("event: {}\ndata: {}\n\n", event_type, payload)
    }

    /// Reads a field from `data`.
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}

/// SSE comment frame sent to idle clients.
pub const SSE_KEEPALIVE: &str = ": keepalive\n\n";
