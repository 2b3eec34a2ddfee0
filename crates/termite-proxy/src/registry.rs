//! Endpoint registry
//!
//! In-memory index of live worker endpoints grouped by pool. The topology
//! watcher is the only writer; the route engine reads point-in-time
//! snapshots. Queue-depth counters are shared atomics so snapshots observe
//! live load without re-locking.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use termite_common::WORKLOAD_TYPE_GENERAL;

/// One registered worker endpoint
struct Endpoint {
    pool: String,
    workload_type: String,
    models: Arc<HashSet<String>>,
    queue_depth: Arc<AtomicI64>,
    ready: bool,
}

/// Point-in-time copy of an endpoint's stable fields
///
/// The queue-depth counter is shared with the live record, so reads stay
/// current without holding the registry lock.
#[derive(Clone)]
pub struct EndpointSnapshot {
    /// Endpoint address (`scheme://host:port`)
    pub address: String,
    /// Pool membership
    pub pool: String,
    /// Coarse workload tag (operator reporting only)
    pub workload_type: String,
    /// Models reported loaded on this endpoint
    pub models: Arc<HashSet<String>>,
    /// Whether the endpoint was ready at snapshot time
    pub ready: bool,
    queue_depth: Arc<AtomicI64>,
}

impl EndpointSnapshot {
    /// Current in-flight request count (lock-free)
    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Whether this endpoint reports the named model loaded
    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

/// Registry of live endpoints keyed by pool
///
/// All operations are infallible; an empty pool is a legitimate state that
/// surfaces to the route engine as "no eligible destinations".
#[derive(Default)]
pub struct EndpointRegistry {
    inner: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh an endpoint. Idempotent.
    ///
    /// An existing unready record transitions back to ready; pool and
    /// workload-type are updated in place. An empty workload type is
    /// recorded as `general`.
    pub fn register(&self, address: &str, pool: &str, workload_type: &str) {
        let workload_type = if workload_type.is_empty() {
            WORKLOAD_TYPE_GENERAL
        } else {
            workload_type
        };

        let mut inner = self.inner.write().expect("registry lock poisoned");
        match inner.get_mut(address) {
            Some(ep) => {
                ep.pool = pool.to_string();
                ep.workload_type = workload_type.to_string();
                ep.ready = true;
            }
            None => {
                inner.insert(
                    address.to_string(),
                    Endpoint {
                        pool: pool.to_string(),
                        workload_type: workload_type.to_string(),
                        models: Arc::new(HashSet::new()),
                        queue_depth: Arc::new(AtomicI64::new(0)),
                        ready: true,
                    },
                );
            }
        }
    }

    /// Remove an endpoint. Idempotent.
    pub fn unregister(&self, address: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.remove(address);
    }

    /// Record the models loaded on an endpoint
    ///
    /// No-op when the address is unknown (the watcher may report models
    /// before the endpoint slice lands; the next resync converges).
    pub fn set_models(&self, address: &str, models: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(ep) = inner.get_mut(address) {
            ep.models = Arc::new(models.into_iter().collect());
        }
    }

    /// Snapshot every endpoint currently in the named pool
    pub fn endpoints_for_pool(&self, pool: &str) -> Vec<EndpointSnapshot> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .iter()
            .filter(|(_, ep)| ep.pool == pool)
            .map(|(address, ep)| EndpointSnapshot {
                address: address.clone(),
                pool: ep.pool.clone(),
                workload_type: ep.workload_type.clone(),
                models: Arc::clone(&ep.models),
                ready: ep.ready,
                queue_depth: Arc::clone(&ep.queue_depth),
            })
            .collect()
    }

    /// Atomically adjust an endpoint's in-flight counter
    ///
    /// Safe to call for an endpoint removed mid-dispatch; the delta is
    /// simply dropped.
    pub fn observe_dispatch(&self, address: &str, delta: i64) {
        let inner = self.inner.read().expect("registry lock poisoned");
        if let Some(ep) = inner.get(address) {
            ep.queue_depth.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Names of all pools with at least one registered endpoint
    pub fn pools(&self) -> BTreeSet<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.values().map(|ep| ep.pool.clone()).collect()
    }

    /// Number of ready endpoints in a pool
    pub fn ready_count(&self, pool: &str) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .values()
            .filter(|ep| ep.pool == pool && ep.ready)
            .count()
    }

    /// Total registered endpoints
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    /// Whether the registry has no endpoints
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
