//! Processing seam between the worker pool and downstream services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::queue::Task;
use crate::resilience::{dependencies, CircuitOpenError};

/// Errors from processing a single task.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Shutdown signal. The only error that stops a worker.
    #[error("Processing cancelled")]
    Cancelled,
}

impl ProcessError {
    /// Whether the error says something about the dependency's health.
    pub fn counts_against_dependency(&self) -> bool {
        !matches!(
            self,
            ProcessError::InvalidTask(_) | ProcessError::Cancelled | ProcessError::CircuitOpen(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProcessError::Cancelled)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProcessError::CircuitOpen(e) => Some(e.retry_after),
            _ => None,
        }
    }
}

/// Result of a successful processing call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Identifier assigned by the downstream service, if any.
    pub reference: Option<String>,
    /// Raw response body.
    pub detail: Option<Value>,
}

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Breaker name guarding this processor's dependency.
    fn dependency(&self) -> &str;

    async fn process(&self, task: &Task) -> Result<ProcessOutcome, ProcessError>;
}

#[derive(Debug, Serialize)]
struct InsertTextRequest<'a> {
    text: &'a str,
    file_source: &'a str,
}

#[derive(Debug, Deserialize)]
struct InsertTextResponse {
    #[serde(default)]
    track_id: Option<String>,
}

/// Inserts chunk text into LightRAG over HTTP.
#[derive(Debug, Clone)]
pub struct LightRagProcessor {
    http_client: Client,
    base_url: String,
    timeout: Duration,
}

impl LightRagProcessor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessError::Http(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TaskProcessor for LightRagProcessor {
    fn dependency(&self) -> &str {
        dependencies::LIGHTRAG
    }

    async fn process(&self, task: &Task) -> Result<ProcessOutcome, ProcessError> {
        if task.content.trim().is_empty() {
            return Err(ProcessError::InvalidTask(format!(
                "chunk {} has no content",
                task.chunk_id
            )));
        }

        let file_source = if task.source_uri.is_empty() {
            task.chunk_id.as_str()
        } else {
            task.source_uri.as_str()
        };
        let url = format!("{}/documents/text", self.base_url);

        let http_response = self
            .http_client
            .post(&url)
            .json(&InsertTextRequest {
                text: &task.content,
                file_source,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProcessError::Timeout(self.timeout)
                } else {
                    ProcessError::Http(e.to_string())
                }
            })?;

        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| ProcessError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ProcessError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let detail: Option<Value> = serde_json::from_str(&body).ok();
        let reference = detail
            .clone()
            .and_then(|v| serde_json::from_value::<InsertTextResponse>(v).ok())
            .and_then(|r| r.track_id);

        Ok(ProcessOutcome { reference, detail })
    }
}
