//! rag-orchestrator: job orchestration for RAG ingestion.
//!
//! Submitted documents become jobs whose chunks are queued on a Redis
//! stream, processed by a supervised worker pool through per-dependency
//! circuit breakers, tracked in a TTL cache backed by PostgreSQL, and
//! reported on an in-process event bus.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod tracker;
pub mod workers;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::OrchestratorError;
pub use events::{Event, EventBus, EventBusConfig, EventSink};
pub use queue::{NewTask, Task, TaskQueue};
pub use resilience::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitOpenError, CircuitState,
};
pub use service::{ChunkInput, HealthReport, HealthStatus, IngestionService};
pub use tracker::{JobProgress, JobStatus, JobTracker};
pub use workers::{TaskProcessor, WorkerPool, WorkerPoolConfig};
