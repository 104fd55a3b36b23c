//! Crate-level error type.
//!
//! Each subsystem owns its error enum next to its code; this module only
//! aggregates them for the service facade:
//! - Circuit breaker rejections
//! - Queue and job tracking failures
//! - Event bus subscription limits
//! - Worker pool lifecycle and configuration errors

use thiserror::Error;

use crate::config::ConfigError;
use crate::events::EventBusError;
use crate::queue::QueueError;
use crate::resilience::CircuitOpenError;
use crate::storage::StoreError;
use crate::tracker::TrackerError;
use crate::workers::{PoolError, ProcessError};

/// Errors surfaced by [`crate::service::IngestionService`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event bus error: {0}")]
    Events(#[from] EventBusError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl OrchestratorError {
    /// True when the caller asked for a job that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::Tracker(TrackerError::JobNotFound(_)))
    }

    /// Retry hint for fail-fast rejections.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            OrchestratorError::CircuitOpen(e) => Some(e.retry_after),
            OrchestratorError::Process(e) => e.retry_after(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_not_found_classification() {
        let err = OrchestratorError::from(TrackerError::JobNotFound("job-1".to_string()));
        assert!(err.is_not_found());
        assert!(err.to_string().contains("job-1"));
        assert!(!OrchestratorError::InvalidRequest("x".to_string()).is_not_found());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = OrchestratorError::from(CircuitOpenError {
            dependency: "lightrag".to_string(),
            retry_after: Duration::from_secs(30),
        });
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let err = OrchestratorError::from(EventBusError::TooManySubscribers { max: 2 });
        assert_eq!(err.retry_after(), None);
        assert!(err.to_string().contains('2'));
    }
}
