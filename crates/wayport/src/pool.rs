//! Upstream pool: endpoint registry plus sticky session bindings
//!
//! The registry is read-mostly and replaced wholesale; bindings live in a
//! concurrent map keyed by session key. The two are synchronized
//! independently and no operation holds both locks at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::endpoint::Endpoint;
use crate::error::PoolError;

/// Non-empty, immutable set of upstream endpoints
#[derive(Debug, Clone)]
pub struct Registry {
    endpoints: Arc<[Endpoint]>,
}

impl Registry {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self {
            endpoints: endpoints.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }
}

/// Selects upstreams and remembers which upstream each session is pinned to
pub struct Pool {
    registry: RwLock<Registry>,
    /// Session key -> bound endpoint
    bindings: DashMap<String, Endpoint>,
    rng: Mutex<StdRng>,
    failures: AtomicU64,
}

impl Pool {
    /// Create a pool seeded from the current time
    pub fn new(registry: Registry) -> Arc<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_seed(registry, seed)
    }

    /// Create a pool with a fixed random seed
    pub fn with_seed(registry: Registry, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(registry),
            bindings: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failures: AtomicU64::new(0),
        })
    }

    /// Number of loaded endpoints
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Snapshot of the current registry
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.registry.read().endpoints().to_vec()
    }

    /// Atomically swap in a new registry. Existing bindings are kept.
    pub fn replace(&self, registry: Registry) {
        tracing::info!("Replacing proxy pool ({} endpoints)", registry.len());
        *self.registry.write() = registry;
    }

    /// Pick an endpoint for a session.
    ///
    /// A non-empty key that is already bound returns its binding without
    /// consulting the registry. Otherwise an endpoint is drawn uniformly at
    /// random, and stored under the key when one was given.
    pub fn select(&self, session_key: &str) -> Result<Endpoint, PoolError> {
        if !session_key.is_empty() {
            if let Some(bound) = self.bindings.get(session_key) {
                return Ok(bound.value().clone());
            }
        }

        let drawn = self.random_endpoint()?;
        if session_key.is_empty() {
            return Ok(drawn);
        }

        // Racing first selections for the same key agree on one binding
        let stored = self
            .bindings
            .entry(session_key.to_string())
            .or_insert(drawn)
            .value()
            .clone();
        Ok(stored)
    }

    /// Pin a session key to an endpoint. No-op for an empty key.
    pub fn bind(&self, session_key: &str, endpoint: Endpoint) {
        if session_key.is_empty() {
            return;
        }
        self.bindings.insert(session_key.to_string(), endpoint);
    }

    /// Record a failure and evict every binding pointing at `endpoint`.
    ///
    /// Returns how many bindings were removed.
    pub fn mark_failed(&self, endpoint: &Endpoint) -> usize {
        self.failures.fetch_add(1, Ordering::Relaxed);

        let mut evicted = 0;
        self.bindings.retain(|_, bound| {
            if bound == endpoint {
                evicted += 1;
                false
            } else {
                true
            }
        });

        tracing::warn!(
            "Marking proxy as failed: {} ({} sticky bindings evicted)",
            endpoint,
            evicted
        );
        evicted
    }

    /// Current binding for a session key
    pub fn binding(&self, session_key: &str) -> Option<Endpoint> {
        self.bindings.get(session_key).map(|b| b.value().clone())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Total number of `mark_failed` calls since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn random_endpoint(&self) -> Result<Endpoint, PoolError> {
        let registry = self.registry.read().clone();
        if registry.is_empty() {
            return Err(PoolError::Empty);
        }
        let index = self.rng.lock().gen_range(0..registry.len());
        Ok(registry.endpoints()[index].clone())
    }
}
