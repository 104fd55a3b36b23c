//! Orchestrator configuration.
//!
//! Every setting has a default and can be overridden through an environment
//! variable. The sub-configs are the same structs the subsystems take, so a
//! loaded [`OrchestratorConfig`] is handed out piecewise at startup.

use std::time::Duration;

use thiserror::Error;

use crate::events::EventBusConfig;
use crate::queue::{QueueConfig, DEFAULT_CONSUMER_GROUP, DEFAULT_STREAM};
use crate::resilience::BreakerConfig;
use crate::tracker::DEFAULT_JOB_TTL;
use crate::workers::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub redis_url: String,
    /// PostgreSQL URL. When unset jobs live only in the cache.
    pub database_url: Option<String>,
    pub queue: QueueConfig,
    pub pool: WorkerPoolConfig,
    /// Lifetime of a cached job record, extended on every mutation.
    pub job_ttl: Duration,
    pub breaker: BreakerConfig,
    pub events: EventBusConfig,
    pub lightrag_url: String,
    pub lightrag_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            database_url: None,
            queue: QueueConfig::new(DEFAULT_STREAM),
            pool: WorkerPoolConfig::default().with_consumer_group(DEFAULT_CONSUMER_GROUP),
            job_ttl: DEFAULT_JOB_TTL,
            breaker: BreakerConfig::default(),
            events: EventBusConfig::default(),
            lightrag_url: "http://127.0.0.1:9621".to_string(),
            lightrag_timeout: Duration::from_secs(120),
        }
    }
}

impl OrchestratorConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379/0)
    /// - `DATABASE_URL`: PostgreSQL URL for the durable job store (default: unset)
    /// - `ORCHESTRATOR_STREAM`: Task stream name (default: shield:ingestion_queue)
    /// - `ORCHESTRATOR_CONSUMER_GROUP`: Consumer group (default: lightrag-workers)
    /// - `ORCHESTRATOR_CONSUMER_PREFIX`: Consumer name prefix (default: worker)
    /// - `ORCHESTRATOR_POOL_SIZE`: Number of workers (default: 4)
    /// - `ORCHESTRATOR_BATCH_SIZE`: Entries per read (default: 10)
    /// - `ORCHESTRATOR_BLOCK_MS`: Blocking read duration (default: 5000)
    /// - `ORCHESTRATOR_CLAIM_IDLE_SECS`: Idle time before redelivery (default: 300)
    /// - `ORCHESTRATOR_STREAM_MAXLEN`: Approximate stream length cap (default: 10000)
    /// - `ORCHESTRATOR_MAX_TASKS_PER_WORKER`: Tasks before a worker is replaced, 0 for never (default: 1000)
    /// - `ORCHESTRATOR_RESTART_DELAY_MS`: Pause before a replacement worker starts (default: 0)
    /// - `ORCHESTRATOR_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown timeout (default: 10)
    /// - `JOB_STATUS_TTL_SECS`: Cached job lifetime (default: 3600)
    /// - `BREAKER_FAIL_MAX`: Failures that open a breaker (default: 5)
    /// - `BREAKER_RESET_TIMEOUT_SECS`: Time spent open (default: 60)
    /// - `BREAKER_SUCCESS_THRESHOLD`: Trial successes that close it (default: 1)
    /// - `EVENT_BUFFER_SIZE`: Events kept for replay (default: 100)
    /// - `EVENT_MAX_SUBSCRIBERS`: Concurrent subscribers (default: 100)
    /// - `EVENT_SUBSCRIBER_CAPACITY`: Per-subscriber queue size (default: 50)
    /// - `LIGHTRAG_URL`: LightRAG base URL (default: http://127.0.0.1:9621)
    /// - `LIGHTRAG_TIMEOUT_SECS`: LightRAG request timeout (default: 120)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Connections
        if let Some(val) = env("REDIS_URL") {
            config.redis_url = val;
        }
        config.database_url = env("DATABASE_URL");

        // Queue
        if let Some(val) = env("ORCHESTRATOR_STREAM") {
            config.queue.stream_name = val;
        }
        if let Some(val) = env("ORCHESTRATOR_CLAIM_IDLE_SECS") {
            config.queue.claim_idle = secs(&val, "ORCHESTRATOR_CLAIM_IDLE_SECS")?;
        }
        if let Some(val) = env("ORCHESTRATOR_STREAM_MAXLEN") {
            config.queue.max_len = parse_env_value(&val, "ORCHESTRATOR_STREAM_MAXLEN")?;
        }

        // Worker pool
        if let Some(val) = env("ORCHESTRATOR_CONSUMER_GROUP") {
            config.pool.consumer_group = val;
        }
        if let Some(val) = env("ORCHESTRATOR_CONSUMER_PREFIX") {
            config.pool.consumer_prefix = val;
        }
        if let Some(val) = env("ORCHESTRATOR_POOL_SIZE") {
            config.pool.pool_size = parse_env_value(&val, "ORCHESTRATOR_POOL_SIZE")?;
        }
        if let Some(val) = env("ORCHESTRATOR_BATCH_SIZE") {
            config.pool.batch_size = parse_env_value(&val, "ORCHESTRATOR_BATCH_SIZE")?;
        }
        if let Some(val) = env("ORCHESTRATOR_BLOCK_MS") {
            config.pool.block_duration = millis(&val, "ORCHESTRATOR_BLOCK_MS")?;
        }
        if let Some(val) = env("ORCHESTRATOR_MAX_TASKS_PER_WORKER") {
            config.pool.max_tasks_per_worker =
                parse_env_value(&val, "ORCHESTRATOR_MAX_TASKS_PER_WORKER")?;
        }
        if let Some(val) = env("ORCHESTRATOR_RESTART_DELAY_MS") {
            config.pool.restart_delay = millis(&val, "ORCHESTRATOR_RESTART_DELAY_MS")?;
        }
        if let Some(val) = env("ORCHESTRATOR_SHUTDOWN_TIMEOUT_SECS") {
            config.pool.shutdown_timeout = secs(&val, "ORCHESTRATOR_SHUTDOWN_TIMEOUT_SECS")?;
        }

        // Job tracker
        if let Some(val) = env("JOB_STATUS_TTL_SECS") {
            config.job_ttl = secs(&val, "JOB_STATUS_TTL_SECS")?;
        }

        // Circuit breaker
        if let Some(val) = env("BREAKER_FAIL_MAX") {
            config.breaker.fail_max = parse_env_value(&val, "BREAKER_FAIL_MAX")?;
        }
        if let Some(val) = env("BREAKER_RESET_TIMEOUT_SECS") {
            config.breaker.reset_timeout = secs(&val, "BREAKER_RESET_TIMEOUT_SECS")?;
        }
        if let Some(val) = env("BREAKER_SUCCESS_THRESHOLD") {
            config.breaker.success_threshold = parse_env_value(&val, "BREAKER_SUCCESS_THRESHOLD")?;
        }

        // Event bus
        if let Some(val) = env("EVENT_BUFFER_SIZE") {
            config.events.buffer_size = parse_env_value(&val, "EVENT_BUFFER_SIZE")?;
        }
        if let Some(val) = env("EVENT_MAX_SUBSCRIBERS") {
            config.events.max_subscribers = parse_env_value(&val, "EVENT_MAX_SUBSCRIBERS")?;
        }
        if let Some(val) = env("EVENT_SUBSCRIBER_CAPACITY") {
            config.events.subscriber_capacity = parse_env_value(&val, "EVENT_SUBSCRIBER_CAPACITY")?;
        }

        // Downstream
        if let Some(val) = env("LIGHTRAG_URL") {
            config.lightrag_url = val;
        }
        if let Some(val) = env("LIGHTRAG_TIMEOUT_SECS") {
            config.lightrag_timeout = secs(&val, "LIGHTRAG_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue.stream_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "stream name cannot be empty".to_string(),
            ));
        }

        if self.pool.consumer_group.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "consumer_group cannot be empty".to_string(),
            ));
        }

        if self.pool.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.job_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_ttl must be greater than 0".to_string(),
            ));
        }

        if self.breaker.fail_max == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker thresholds must be greater than 0".to_string(),
            ));
        }

        if self.events.max_subscribers == 0 || self.events.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event subscriber limits must be greater than 0".to_string(),
            ));
        }

        if !(self.lightrag_url.starts_with("http://") || self.lightrag_url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "lightrag_url must be an http(s) URL, got '{}'",
                self.lightrag_url
            )));
        }

        Ok(())
    }
}

/// Parse an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value(value, key).map(Duration::from_secs)
}

fn millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value(value, key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.redis_url, "redis://127.0.0.1:6379/0");
        assert!(config.database_url.is_none());
        assert_eq!(config.queue.stream_name, "shield:ingestion_queue");
        assert_eq!(config.pool.consumer_group, "lightrag-workers");
        assert_eq!(config.pool.consumer_prefix, "worker");
        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.pool.block_duration, Duration::from_millis(5000));
        assert_eq!(config.queue.claim_idle, Duration::from_secs(300));
        assert_eq!(config.job_ttl, Duration::from_secs(3600));
        assert_eq!(config.breaker.fail_max, 5);
        assert_eq!(config.events.buffer_size, 100);
        assert_eq!(config.lightrag_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/rag"),
            ("ORCHESTRATOR_STREAM", "ingest"),
            ("ORCHESTRATOR_POOL_SIZE", "8"),
            ("ORCHESTRATOR_BLOCK_MS", "250"),
            ("ORCHESTRATOR_MAX_TASKS_PER_WORKER", "0"),
            ("BREAKER_RESET_TIMEOUT_SECS", "5"),
            ("EVENT_MAX_SUBSCRIBERS", "3"),
            ("LIGHTRAG_URL", "https://lightrag.internal"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/rag"));
        assert_eq!(config.queue.stream_name, "ingest");
        assert_eq!(config.pool.pool_size, 8);
        assert_eq!(config.pool.block_duration, Duration::from_millis(250));
        assert_eq!(config.pool.max_tasks_per_worker, 0);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(5));
        assert_eq!(config.events.max_subscribers, 3);
        assert_eq!(config.lightrag_url, "https://lightrag.internal");
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = load(&[("DATABASE_URL", ""), ("ORCHESTRATOR_POOL_SIZE", " ")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.pool.pool_size, 4);
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("ORCHESTRATOR_POOL_SIZE", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCHESTRATOR_POOL_SIZE"));
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let err = load(&[("ORCHESTRATOR_POOL_SIZE", "0")]).unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn test_validation_rejects_bad_lightrag_url() {
        let err = load(&[("LIGHTRAG_URL", "lightrag:9621")]).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }
}
