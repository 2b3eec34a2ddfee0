//! Route engine
//!
//! The hot-path pipeline: match a request against the route store snapshot,
//! select an eligible destination under live registry conditions, apply the
//! route's rate limit, and pick the least-loaded ready endpoint. Everything
//! here completes in bounded CPU time; dispatch I/O lives in
//! [`crate::dispatch`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use termite_common::crd::OperationType;

use crate::registry::{EndpointRegistry, EndpointSnapshot};
use crate::route::{Destination, Route};
use crate::store::RouteStore;

/// Routing view of an incoming request
#[derive(Clone, Debug)]
pub struct RouteRequest {
    /// API operation (embed, chunk, rerank)
    pub operation: OperationType,
    /// Requested model name
    pub model: String,
    /// Request headers relevant to matching
    pub headers: BTreeMap<String, String>,
    /// Originating Antfly table, if any
    pub source_table: String,
    /// Originating namespace, if any
    pub source_namespace: String,
    /// Originating service account, if any
    pub source_service_account: String,
    /// Arrival time (matching evaluates time windows in UTC)
    pub timestamp: DateTime<Utc>,
}

/// Terminal routing decision for one request
pub enum RouteDecision {
    /// Dispatch to an endpoint chosen through a matched route
    Dispatch {
        /// The matched route (carries retry/fallback context)
        route: Arc<Route>,
        /// Chosen worker endpoint
        endpoint: EndpointSnapshot,
    },
    /// No route matched; dispatch to the default pool
    DispatchDefault {
        /// Chosen worker endpoint from the default pool
        endpoint: EndpointSnapshot,
    },
    /// The route's token bucket is empty
    RateLimited {
        /// The matched route
        route: Arc<Route>,
    },
    /// A route matched but no destination is currently eligible
    NoDestination {
        /// The matched route (carries the fallback config)
        route: Arc<Route>,
    },
    /// No route matched and the default pool has no ready endpoints
    NoRoute,
}

/// Aggregate live stats for one pool, computed over ready endpoints
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    /// Average queue depth across ready endpoints
    pub avg_queue_depth: f64,
    /// Number of ready endpoints
    pub ready_replicas: usize,
    /// Whether any ready endpoint reports the requested model loaded
    pub model_loaded: bool,
}

/// The routing pipeline
pub struct RouteEngine {
    store: Arc<RouteStore>,
    registry: Arc<EndpointRegistry>,
    default_pool: String,
    round_robin: AtomicUsize,
}

impl RouteEngine {
    /// Create an engine over the given store and registry
    pub fn new(store: Arc<RouteStore>, registry: Arc<EndpointRegistry>, default_pool: &str) -> Self {
        Self {
            store,
            registry,
            default_pool: default_pool.to_string(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// The registry this engine selects endpoints from
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// The configured default pool
    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    /// Find the first route whose match block accepts the request.
    ///
    /// Routes evaluate in `(priority desc, name asc)` order; the first full
    /// match wins and its matched-requests counter is incremented.
    pub fn match_request(&self, req: &RouteRequest) -> Option<Arc<Route>> {
        for route in self.store.snapshot() {
            if route.matches(req) {
                route.record_match(req.timestamp);
                return Some(route);
            }
        }
        None
    }

    /// Aggregate stats for a pool, or None when it has no ready endpoints
    pub fn pool_stats(&self, pool: &str, model: &str) -> Option<PoolStats> {
        let endpoints = self.registry.endpoints_for_pool(pool);
        let ready: Vec<_> = endpoints.iter().filter(|e| e.ready).collect();
        if ready.is_empty() {
            return None;
        }

        let total_depth: i64 = ready.iter().map(|e| e.queue_depth()).sum();
        let model_loaded = ready.iter().any(|e| e.has_model(model));

        Some(PoolStats {
            avg_queue_depth: total_depth as f64 / ready.len() as f64,
            ready_replicas: ready.len(),
            model_loaded,
        })
    }

    /// Whether a destination's condition block holds right now
    fn destination_eligible(&self, dest: &Destination, req: &RouteRequest) -> bool {
        let Some(stats) = self.pool_stats(&dest.pool, &req.model) else {
            // A pool with no ready endpoints is never eligible
            return false;
        };

        if let Some(cond) = &dest.queue_depth {
            if !cond.evaluate(stats.avg_queue_depth) {
                return false;
            }
        }
        if let Some(cond) = &dest.replicas {
            if !cond.evaluate(stats.ready_replicas as f64) {
                return false;
            }
        }
        // Latency conditions evaluate against observed p99 once workers
        // report it; with no latency signal the gate is permissive.
        if dest.require_model_loaded && !stats.model_loaded {
            return false;
        }
        if let Some(window) = &dest.time {
            if !window.is_active(req.timestamp) {
                return false;
            }
        }

        true
    }

    /// Select a destination from a matched route.
    ///
    /// Eligible destinations compete by weight; the highest weight wins
    /// deterministically, with declaration order breaking ties. All-zero
    /// weights therefore behave as equal weighting with the first declared
    /// destination winning.
    pub fn select_destination(&self, route: &Route, req: &RouteRequest) -> Option<Destination> {
        let mut best: Option<&Destination> = None;
        for dest in &route.destinations {
            if !self.destination_eligible(dest, req) {
                continue;
            }
            match best {
                Some(current) if current.weight >= dest.weight => {}
                _ => best = Some(dest),
            }
        }
        best.cloned()
    }

    /// Pick an endpoint within a pool: ready endpoints with the lowest
    /// queue depth, ties broken round-robin. `exclude` skips an address the
    /// caller already failed against.
    pub fn pick_endpoint(&self, pool: &str, exclude: Option<&str>) -> Option<EndpointSnapshot> {
        let endpoints = self.registry.endpoints_for_pool(pool);
        let candidates: Vec<_> = endpoints
            .into_iter()
            .filter(|e| e.ready && Some(e.address.as_str()) != exclude)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let min_depth = candidates.iter().map(|e| e.queue_depth()).min()?;
        let mut least: Vec<_> = candidates
            .into_iter()
            .filter(|e| e.queue_depth() == min_depth)
            .collect();
        // Stable order before rotating, so the round-robin cursor is
        // meaningful across calls
        least.sort_by(|a, b| a.address.cmp(&b.address));

        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % least.len();
        Some(least.swap_remove(idx))
    }

    /// Run the full decision pipeline for one request.
    ///
    /// Rate limiting is consulted after the match and before destination
    /// selection, so a limited request never observes registry state.
    pub fn decide(&self, req: &RouteRequest) -> RouteDecision {
        let Some(route) = self.match_request(req) else {
            return match self.pick_endpoint(&self.default_pool, None) {
                Some(endpoint) => RouteDecision::DispatchDefault { endpoint },
                None => RouteDecision::NoRoute,
            };
        };

        if let Some(limiter) = &route.rate_limiter {
            if !limiter.allow(&req.model) {
                return RouteDecision::RateLimited { route };
            }
        }

        let Some(dest) = self.select_destination(&route, req) else {
            return RouteDecision::NoDestination { route };
        };

        match self.pick_endpoint(&dest.pool, None) {
            Some(endpoint) => RouteDecision::Dispatch { route, endpoint },
            // The pool emptied between eligibility and pick; fall through
            // to the route's fallback
            None => RouteDecision::NoDestination { route },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
