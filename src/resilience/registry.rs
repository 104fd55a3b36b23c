//! Process-wide set of breakers keyed by dependency name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState};

/// Well-known downstream dependency names.
pub mod dependencies {
    /// Knowledge-graph ingestion service.
    pub const LIGHTRAG: &str = "lightrag";
    /// Vector database.
    pub const VECTOR_STORE: &str = "vector_store";
    /// Embedding model endpoint.
    pub const EMBEDDINGS: &str = "embeddings";

    pub const ALL: [&str; 3] = [LIGHTRAG, VECTOR_STORE, EMBEDDINGS];
}

/// Owns one [`CircuitBreaker`] per dependency.
///
/// Created once by the process and shared by `Arc`; tests build their own.
/// Breakers are never removed, so a handle returned by [`get_or_create`]
/// stays valid for the life of the registry.
///
/// [`get_or_create`]: BreakerRegistry::get_or_create
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the well-known dependencies pre-registered.
    pub fn with_defaults(default_config: BreakerConfig) -> Self {
        let registry = Self::new(default_config);
        for name in dependencies::ALL {
            registry.get_or_create(name);
        }
        registry
    }

    /// Registers `name` with its own thresholds, replacing nothing if it
    /// already exists.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().expect("breaker registry lock poisoned");
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .expect("breaker registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        self.register(name, self.default_config.clone())
    }

    /// Runs `operation` through the breaker for `dependency`.
    pub async fn call<F, Fut, T, E>(&self, dependency: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.get_or_create(dependency).call(operation).await
    }

    /// Snapshots of all breakers, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .expect("breaker registry lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// True when any breaker is open or trialing.
    pub fn any_tripped(&self) -> bool {
        self.snapshots()
            .iter()
            .any(|s| s.state != CircuitState::Closed)
    }
}
