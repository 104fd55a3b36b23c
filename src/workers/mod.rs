//! Worker pool consuming the task queue.
//!
//! - **WorkerPool**: launches and supervises a fixed number of workers
//! - **Worker**: read, process through the breaker, acknowledge, track
//! - **TaskProcessor**: the downstream call made for each task
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  TaskQueue   │  one consumer group
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌──────────┐        ┌──────────┐        ┌──────────┐
//!    │ worker-0 │        │ worker-1 │        │ worker-N │
//!    └────┬─────┘        └────┬─────┘        └────┬─────┘
//!         └──── CircuitBreaker ─► TaskProcessor ──┘
//!                             │
//!              ack + JobTracker progress + events
//! ```
//!
//! # Reliability
//!
//! - **At-least-once**: a task is acknowledged only after it was processed;
//!   failures leave it pending for redelivery
//! - **Bounded workers**: a worker exits after `max_tasks_per_worker` tasks
//!   and its supervisor starts a fresh one under the same consumer name
//! - **Graceful shutdown**: workers finish their in-flight task, stragglers
//!   are aborted after the shutdown timeout

pub mod pool;
pub mod processor;
pub mod worker;

pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use processor::{LightRagProcessor, ProcessError, ProcessOutcome, TaskProcessor};
pub use worker::{ExitReason, WorkerState, WorkerStatus};
