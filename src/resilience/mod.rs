//! Failure isolation for calls to downstream services.
//!
//! - **CircuitBreaker**: closed / open / half-open gate for one dependency
//! - **BreakerRegistry**: explicit registry of breakers keyed by dependency name
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_orchestrator::resilience::{dependencies, BreakerConfig, BreakerRegistry};
//!
//! let registry = BreakerRegistry::with_defaults(BreakerConfig::default());
//! let body = registry
//!     .call(dependencies::LIGHTRAG, || client.post(url).send())
//!     .await?;
//! ```

pub mod breaker;
pub mod registry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState};
pub use registry::{dependencies, BreakerRegistry};
