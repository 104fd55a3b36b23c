//! Job records and the views handed to status callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TrackerError;

/// Job type used by the ingestion flow.
pub const INGESTION_JOB_TYPE: &str = "lightrag_ingestion";

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true for statuses a job never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(TrackerError::InvalidStatus(other.to_string())),
        }
    }
}

/// Full job record as held by the cache and the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub tasks_total: u64,
    pub tasks_processed: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        job_type: impl Into<String>,
        tasks_total: u64,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            status: JobStatus::Queued,
            tasks_total,
            tasks_processed: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata,
        }
    }

    /// Percentage of tasks processed, rounded to two decimals.
    pub fn percent_complete(&self) -> f64 {
        percent_complete(self.tasks_processed, self.tasks_total)
    }

    /// Applies a patch the same way the cache adapters do.
    ///
    /// A terminal status is final: later patches leave `status` and
    /// `completed_at` untouched.
    pub fn apply(&mut self, patch: &JobPatch) {
        let settled = self.status.is_terminal();
        if let Some(status) = patch.status.filter(|_| !settled) {
            self.status = status;
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
        if self.started_at.is_none() {
            self.started_at = patch.started_at;
        }
        if patch.completed_at.is_some() && !settled {
            self.completed_at = patch.completed_at;
        }
    }
}

/// Fields merged into an existing record by `update_job`.
///
/// `started_at` is only written if the record has none yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    /// Builds the patch for a status/error update, stamping lifecycle times.
    pub fn for_update(status: Option<JobStatus>, error: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            error,
            started_at: match status {
                Some(JobStatus::Processing) => Some(now),
                _ => None,
            },
            completed_at: match status {
                Some(s) if s.is_terminal() => Some(now),
                _ => None,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }
}

/// Progress view returned by `get_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub tasks_total: u64,
    pub tasks_processed: u64,
    pub percent_complete: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl From<JobRecord> for JobProgress {
    fn from(record: JobRecord) -> Self {
        Self {
            percent_complete: record.percent_complete(),
            job_id: record.job_id,
            job_type: record.job_type,
            status: record.status,
            tasks_total: record.tasks_total,
            tasks_processed: record.tasks_processed,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error,
            metadata: record.metadata,
        }
    }
}

/// Row returned by `list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub tasks_total: u64,
    pub tasks_processed: u64,
    pub percent_complete: f64,
    pub created_at: DateTime<Utc>,
    /// Seconds from start (or creation) to completion, for finished jobs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_secs: Option<f64>,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            job_type: record.job_type.clone(),
            status: record.status,
            tasks_total: record.tasks_total,
            tasks_processed: record.tasks_processed,
            percent_complete: record.percent_complete(),
            created_at: record.created_at,
            duration_secs: record.completed_at.map(|done| {
                let start = record.started_at.unwrap_or(record.created_at);
                (done - start).num_milliseconds().max(0) as f64 / 1000.0
            }),
        }
    }
}

/// `100 * processed / total` rounded to two decimals, 0 when `total` is 0.
pub fn percent_complete(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = processed as f64 * 100.0 / total as f64;
    (raw * 100.0).round() / 100.0
}
