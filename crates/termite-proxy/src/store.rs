//! Route store
//!
//! Holds the compiled route set sorted by descending priority with names as
//! ascending tie-breakers, so evaluation order is deterministic and stable.
//! Mutations take the write lock; readers clone an Arc per route and never
//! iterate under the lock.

use std::sync::{Arc, RwLock};

use crate::route::Route;

/// Priority-ordered collection of compiled routes
#[derive(Default)]
pub struct RouteStore {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a route by its fully-qualified name.
    ///
    /// When the replaced route has a rate limiter with an unchanged
    /// configuration, the old limiter (and its bucket state) is carried
    /// into the new route; see [`crate::compile`] which sets the limiter
    /// config alongside the route.
    pub fn upsert(&self, mut route: Route) {
        let mut routes = self.routes.write().expect("route store lock poisoned");

        if let Some(existing) = routes.iter().find(|r| r.name == route.name) {
            if let (Some(old), Some(new)) = (&existing.rate_limiter, &route.rate_limiter) {
                if limiter_config_matches(old, new) {
                    route.rate_limiter = Some(Arc::clone(old));
                }
            }
        }

        routes.retain(|r| r.name != route.name);
        routes.push(Arc::new(route));
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    /// Remove a route by its fully-qualified name
    pub fn remove(&self, name: &str) {
        let mut routes = self.routes.write().expect("route store lock poisoned");
        routes.retain(|r| r.name != name);
    }

    /// The evaluation-order route list
    pub fn snapshot(&self) -> Vec<Arc<Route>> {
        self.routes
            .read()
            .expect("route store lock poisoned")
            .clone()
    }

    /// Look up a route by name
    pub fn get(&self, name: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .expect("route store lock poisoned")
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    /// Number of routes currently stored
    pub fn len(&self) -> usize {
        self.routes.read().expect("route store lock poisoned").len()
    }

    /// Whether the store holds no routes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether two limiters share rate, burst, and per-model mode
fn limiter_config_matches(
    old: &Arc<crate::limiter::RateLimiter>,
    new: &Arc<crate::limiter::RateLimiter>,
) -> bool {
    old.config() == new.config()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::RateLimiter;
    use crate::route::Route;

    fn named(name: &str, priority: i32) -> Route {
        Route::new(name, priority)
    }

    #[test]
    fn snapshot_orders_by_priority_then_name() {
        let store = RouteStore::new();
        store.upsert(named("default/beta", 100));
        store.upsert(named("default/alpha", 100));
        store.upsert(named("default/low", 10));
        store.upsert(named("default/high", 200));

        let names: Vec<_> = store.snapshot().iter().map(|r| r.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "default/high",
                "default/alpha",
                "default/beta",
                "default/low"
            ]
        );
    }

    #[test]
    fn order_is_stable_across_snapshots() {
        let store = RouteStore::new();
        store.upsert(named("default/a", 5));
        store.upsert(named("default/b", 5));

        let first: Vec<_> = store.snapshot().iter().map(|r| r.name.clone()).collect();
        let second: Vec<_> = store.snapshot().iter().map(|r| r.name.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_replaces_by_name() {
        let store = RouteStore::new();
        store.upsert(named("default/r", 100));
        store.upsert(named("default/r", 200));

        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].priority, 200);
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let store = RouteStore::new();
        store.upsert(named("default/r", 100));
        let first: Vec<_> = store.snapshot().iter().map(|r| r.name.clone()).collect();

        store.upsert(named("default/r", 100));
        let second: Vec<_> = store.snapshot().iter().map(|r| r.name.clone()).collect();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_by_name() {
        let store = RouteStore::new();
        store.upsert(named("default/r", 100));
        store.remove("default/r");
        assert!(store.is_empty());

        // Removing a missing route is a no-op
        store.remove("default/r");
    }

    #[test]
    fn get_finds_route() {
        let store = RouteStore::new();
        store.upsert(named("default/r", 100));
        assert!(store.get("default/r").is_some());
        assert!(store.get("default/missing").is_none());
    }

    #[test]
    fn upsert_preserves_limiter_bucket_when_config_unchanged() {
        let store = RouteStore::new();

        let mut route = named("default/limited", 100);
        route.rate_limiter = Some(Arc::new(RateLimiter::new(1, 1, false)));
        store.upsert(route);

        // Drain the bucket
        let live = store.get("default/limited").unwrap();
        assert!(live.rate_limiter.as_ref().unwrap().allow("m"));
        assert!(!live.rate_limiter.as_ref().unwrap().allow("m"));

        // Re-upsert with the same limiter config (e.g., priority change only)
        let mut updated = named("default/limited", 200);
        updated.rate_limiter = Some(Arc::new(RateLimiter::new(1, 1, false)));
        store.upsert(updated);

        // Bucket state carried over: still drained
        let live = store.get("default/limited").unwrap();
        assert_eq!(live.priority, 200);
        assert!(!live.rate_limiter.as_ref().unwrap().allow("m"));
    }

    #[test]
    fn upsert_resets_limiter_when_config_changes() {
        let store = RouteStore::new();

        let mut route = named("default/limited", 100);
        route.rate_limiter = Some(Arc::new(RateLimiter::new(1, 1, false)));
        store.upsert(route);

        let live = store.get("default/limited").unwrap();
        assert!(live.rate_limiter.as_ref().unwrap().allow("m"));

        // Raised burst: new bucket applies
        let mut updated = named("default/limited", 100);
        updated.rate_limiter = Some(Arc::new(RateLimiter::new(1, 2, false)));
        store.upsert(updated);

        let live = store.get("default/limited").unwrap();
        assert!(live.rate_limiter.as_ref().unwrap().allow("m"));
        assert!(live.rate_limiter.as_ref().unwrap().allow("m"));
    }
}
