//! Rate-limited dispatcher
//!
//! Takes a routing decision from the engine and drives the actual dispatch:
//! per-attempt timeouts, retry with endpoint re-selection, and the route's
//! queue/reject/redirect fallback when nothing is eligible or retries are
//! exhausted. Retries never re-consult the rate limiter.
//!
//! Cancellation rides on future drop: when the caller goes away, the
//! in-flight attempt and any queued fallback wait are abandoned with it.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use termite_common::crd::FallbackAction;
use termite_common::metrics;

use crate::engine::{RouteDecision, RouteEngine, RouteRequest};
use crate::registry::EndpointSnapshot;
use crate::route::{RetryPolicy, Route};

/// Default hold time for `queue` fallback when the route does not set one
pub const DEFAULT_MAX_QUEUE_TIME: Duration = Duration::from_secs(30);

/// How often a queued request re-runs destination selection
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Terminal result of a dispatch
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The worker responded; status and body are relayed verbatim
    Success {
        /// Upstream status code
        status: u16,
        /// Upstream response body
        body: Vec<u8>,
    },
    /// The request was rejected locally (rate limit, no destination, or
    /// exhausted retries)
    Rejected {
        /// Status code for the caller
        status: u16,
        /// Message for the caller
        message: String,
        /// Optional Retry-After hint in seconds
        retry_after: Option<u32>,
    },
}

impl DispatchOutcome {
    fn rejected(status: u16, message: impl Into<String>, retry_after: Option<u32>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
            retry_after,
        }
    }
}

/// Drives dispatch for routing decisions
pub struct Dispatcher {
    engine: Arc<RouteEngine>,
    client: reqwest::Client,
}

impl Dispatcher {
    /// Create a dispatcher over the given engine
    pub fn new(engine: Arc<RouteEngine>) -> Self {
        Self {
            engine,
            client: reqwest::Client::new(),
        }
    }

    /// The engine this dispatcher routes through
    pub fn engine(&self) -> &Arc<RouteEngine> {
        &self.engine
    }

    /// Route and dispatch one request.
    ///
    /// `path` is the worker API path (e.g. `/api/embed`) and `body` the
    /// JSON payload to forward.
    pub async fn dispatch(&self, req: &RouteRequest, path: &str, body: &serde_json::Value) -> DispatchOutcome {
        let started = std::time::Instant::now();
        let outcome = match self.engine.decide(req) {
            RouteDecision::Dispatch { route, endpoint } => {
                self.record(req, &endpoint.pool, "dispatched");
                self.dispatch_with_retry(&route, endpoint, req, path, body)
                    .await
            }
            RouteDecision::DispatchDefault { endpoint } => {
                self.record(req, &endpoint.pool, "dispatched");
                let policy = RetryPolicy::default();
                match self.attempt(&endpoint, path, body, &policy).await {
                    AttemptResult::Responded { status, body } => {
                        DispatchOutcome::Success { status, body }
                    }
                    AttemptResult::Failed { kind, message } => DispatchOutcome::rejected(
                        503,
                        format!("default pool dispatch failed: {kind}: {message}"),
                        None,
                    ),
                }
            }
            RouteDecision::RateLimited { route } => {
                metrics::RATE_LIMITED_TOTAL
                    .add(1, &[KeyValue::new("route", route.name.clone())]);
                self.record(req, "", "rate_limited");
                DispatchOutcome::rejected(429, "rate limit exceeded", Some(1))
            }
            RouteDecision::NoDestination { route } => {
                self.record(req, "", "no_destination");
                self.fallback(&route, req, path, body).await
            }
            RouteDecision::NoRoute => {
                self.record(req, "", "no_route");
                DispatchOutcome::rejected(
                    503,
                    "no route matched and the default pool has no ready endpoints",
                    None,
                )
            }
        };

        metrics::REQUEST_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("operation", req.operation.to_string())],
        );
        outcome
    }

    /// Dispatch with the route's retry policy. Retries re-enter endpoint
    /// selection (skipping the endpoint that just failed) but never the
    /// rate limiter.
    async fn dispatch_with_retry(
        &self,
        route: &Arc<Route>,
        mut endpoint: EndpointSnapshot,
        req: &RouteRequest,
        path: &str,
        body: &serde_json::Value,
    ) -> DispatchOutcome {
        let attempts = route.retry.attempts.max(1);

        for attempt in 1..=attempts {
            match self.attempt(&endpoint, path, body, &route.retry).await {
                AttemptResult::Responded { status, body: resp } => {
                    if !route.retry.retriable_status(status) || attempt == attempts {
                        return DispatchOutcome::Success {
                            status,
                            body: resp,
                        };
                    }
                    debug!(
                        route = %route.name,
                        endpoint = %endpoint.address,
                        status,
                        attempt,
                        "retriable status, re-selecting endpoint"
                    );
                }
                AttemptResult::Failed { kind, message } => {
                    // A failure kind the policy does not cover is terminal,
                    // exactly like a non-retriable status.
                    if !kind.retried_by(&route.retry) || attempt == attempts {
                        warn!(
                            route = %route.name,
                            endpoint = %endpoint.address,
                            %kind,
                            %message,
                            retried_by_policy = kind.retried_by(&route.retry),
                            "dispatch failed terminally"
                        );
                        return self.fallback(route, req, path, body).await;
                    }
                    debug!(
                        route = %route.name,
                        endpoint = %endpoint.address,
                        %kind,
                        %message,
                        attempt,
                        "transport failure, re-selecting endpoint"
                    );
                }
            }

            // Prefer a different endpoint for the next attempt; fall back to
            // the same one when the pool has a single replica.
            endpoint = match self
                .engine
                .pick_endpoint(&endpoint.pool, Some(&endpoint.address))
                .or_else(|| self.engine.pick_endpoint(&endpoint.pool, None))
            {
                Some(next) => next,
                None => return self.fallback(route, req, path, body).await,
            };
        }

        // attempts >= 1 guarantees the loop returned
        unreachable!("retry loop always returns")
    }

    /// One attempt against one endpoint, with in-flight accounting
    async fn attempt(
        &self,
        endpoint: &EndpointSnapshot,
        path: &str,
        body: &serde_json::Value,
        policy: &RetryPolicy,
    ) -> AttemptResult {
        let url = format!("{}{}", endpoint.address, path);
        let registry = self.engine.registry();

        registry.observe_dispatch(&endpoint.address, 1);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = policy.per_try_timeout {
            request = request.timeout(timeout);
        }
        let result = request.send().await;
        registry.observe_dispatch(&endpoint.address, -1);

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(bytes) => AttemptResult::Responded {
                        status,
                        body: bytes.to_vec(),
                    },
                    Err(e) => AttemptResult::from_transport_error(&e),
                }
            }
            Err(e) => AttemptResult::from_transport_error(&e),
        }
    }

    /// Run the route's fallback when no destination is eligible or retries
    /// are exhausted
    async fn fallback(
        &self,
        route: &Arc<Route>,
        req: &RouteRequest,
        path: &str,
        body: &serde_json::Value,
    ) -> DispatchOutcome {
        let fallback = route.fallback.clone().unwrap_or_default();

        match fallback.action {
            FallbackAction::Reject => DispatchOutcome::rejected(
                fallback.status_code,
                reject_message(&fallback.message),
                fallback.retry_after,
            ),
            FallbackAction::Queue => {
                let deadline = fallback.max_queue_time.unwrap_or(DEFAULT_MAX_QUEUE_TIME);
                let expires = tokio::time::Instant::now() + deadline;

                loop {
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                    if tokio::time::Instant::now() >= expires {
                        return DispatchOutcome::rejected(
                            fallback.status_code,
                            reject_message(&fallback.message),
                            fallback.retry_after,
                        );
                    }

                    let Some(dest) = self.engine.select_destination(route, req) else {
                        continue;
                    };
                    let Some(endpoint) = self.engine.pick_endpoint(&dest.pool, None) else {
                        continue;
                    };

                    debug!(route = %route.name, pool = %dest.pool, "queued request unblocked");
                    match self.attempt(&endpoint, path, body, &route.retry).await {
                        AttemptResult::Responded { status, body } => {
                            return DispatchOutcome::Success { status, body };
                        }
                        // Transient failure while queued: keep waiting until
                        // the deadline
                        AttemptResult::Failed { .. } => continue,
                    }
                }
            }
            FallbackAction::Redirect => {
                // Conditions are ignored; the redirect pool acts as the sole
                // destination.
                let Some(endpoint) = self.engine.pick_endpoint(&fallback.redirect_pool, None)
                else {
                    return DispatchOutcome::rejected(
                        503,
                        format!(
                            "redirect pool '{}' has no ready endpoints",
                            fallback.redirect_pool
                        ),
                        None,
                    );
                };
                match self.attempt(&endpoint, path, body, &route.retry).await {
                    AttemptResult::Responded { status, body } => {
                        DispatchOutcome::Success { status, body }
                    }
                    AttemptResult::Failed { kind, message } => DispatchOutcome::rejected(
                        503,
                        format!("redirect dispatch failed: {kind}: {message}"),
                        None,
                    ),
                }
            }
        }
    }

    fn record(&self, req: &RouteRequest, pool: &str, outcome: &'static str) {
        metrics::REQUESTS_TOTAL.add(
            1,
            &[
                KeyValue::new("pool", pool.to_string()),
                KeyValue::new("operation", req.operation.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

fn reject_message(configured: &str) -> String {
    if configured.is_empty() {
        "no eligible destinations".to_string()
    } else {
        configured.to_string()
    }
}

/// Transport-level failure kind, mirroring the retry-kind vocabulary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransportFailure {
    /// Connection refused or could not be established
    ConnectFailure,
    /// Connection dropped mid-exchange
    Reset,
    /// The per-attempt timeout elapsed
    DeadlineExceeded,
}

impl TransportFailure {
    /// Whether the route's retry policy covers this failure kind
    fn retried_by(self, policy: &RetryPolicy) -> bool {
        match self {
            Self::ConnectFailure => policy.on_connect_failure,
            Self::Reset => policy.on_reset,
            Self::DeadlineExceeded => policy.on_timeout,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::ConnectFailure => "connect-failure",
            Self::Reset => "reset",
            Self::DeadlineExceeded => "deadline-exceeded",
        }
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single attempt
enum AttemptResult {
    /// The worker responded with a status (success or error)
    Responded { status: u16, body: Vec<u8> },
    /// Transport-level failure, classified so the caller can apply the
    /// route's retry policy
    Failed {
        kind: TransportFailure,
        message: String,
    },
}

impl AttemptResult {
    fn from_transport_error(e: &reqwest::Error) -> Self {
        let kind = if e.is_connect() {
            TransportFailure::ConnectFailure
        } else if e.is_timeout() {
            TransportFailure::DeadlineExceeded
        } else {
            TransportFailure::Reset
        };
        Self::Failed {
            kind,
            message: e.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use termite_common::crd::OperationType;

    use crate::engine::RouteEngine;
    use crate::registry::EndpointRegistry;
    use crate::route::{Destination, Fallback, Route};
    use crate::store::RouteStore;

    fn request() -> RouteRequest {
        RouteRequest {
            operation: OperationType::Embed,
            model: "bge-small".to_string(),
            headers: BTreeMap::new(),
            source_table: String::new(),
            source_namespace: String::new(),
            source_service_account: String::new(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap(),
        }
    }

    fn dispatcher_with_route(route: Route) -> Dispatcher {
        let store = Arc::new(RouteStore::new());
        store.upsert(route);
        let registry = Arc::new(EndpointRegistry::new());
        let engine = Arc::new(RouteEngine::new(store, registry, "default"));
        Dispatcher::new(engine)
    }

    fn unreachable_route(name: &str) -> Route {
        let mut route = Route::new(name, 100);
        route.destinations.push(Destination {
            pool: "empty-pool".to_string(),
            weight: 100,
            ..Default::default()
        });
        route
    }

    #[tokio::test]
    async fn reject_fallback_uses_configured_response() {
        let mut route = unreachable_route("default/reject");
        route.fallback = Some(Fallback {
            action: FallbackAction::Reject,
            status_code: 507,
            message: "pool is draining".to_string(),
            retry_after: Some(30),
            ..Default::default()
        });

        let dispatcher = dispatcher_with_route(route);
        let body = serde_json::json!({"model": "bge-small", "input": "hi"});

        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected {
                status,
                message,
                retry_after,
            } => {
                assert_eq!(status, 507);
                assert_eq!(message, "pool is draining");
                assert_eq!(retry_after, Some(30));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_fallback_defaults_to_503() {
        let dispatcher = dispatcher_with_route(unreachable_route("default/bare"));
        let body = serde_json::json!({"model": "bge-small", "input": "hi"});

        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected { status, .. } => assert_eq!(status, 503),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_fallback_rejects_on_expiry() {
        let mut route = unreachable_route("default/queued");
        route.fallback = Some(Fallback {
            action: FallbackAction::Queue,
            max_queue_time: Some(Duration::from_secs(2)),
            ..Default::default()
        });

        let dispatcher = dispatcher_with_route(route);
        let body = serde_json::json!({"model": "bge-small", "input": "hi"});

        let started = tokio::time::Instant::now();
        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected { status, .. } => assert_eq!(status, 503),
            other => panic!("expected rejection, got {other:?}"),
        }
        // Paused clock: elapsed time is exactly the queue deadline
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_fallback_defaults_to_thirty_seconds() {
        let mut route = unreachable_route("default/queued-default");
        route.fallback = Some(Fallback {
            action: FallbackAction::Queue,
            max_queue_time: None,
            ..Default::default()
        });

        let dispatcher = dispatcher_with_route(route);
        let body = serde_json::json!({"model": "bge-small"});

        let started = tokio::time::Instant::now();
        let _ = dispatcher.dispatch(&request(), "/api/embed", &body).await;
        assert!(started.elapsed() >= DEFAULT_MAX_QUEUE_TIME);
    }

    #[tokio::test]
    async fn redirect_to_empty_pool_rejects() {
        let mut route = unreachable_route("default/redirected");
        route.fallback = Some(Fallback {
            action: FallbackAction::Redirect,
            redirect_pool: "also-empty".to_string(),
            ..Default::default()
        });

        let dispatcher = dispatcher_with_route(route);
        let body = serde_json::json!({"model": "bge-small"});

        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected { status, message, .. } => {
                assert_eq!(status, 503);
                assert!(message.contains("also-empty"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429_with_hint() {
        let mut route = unreachable_route("default/limited");
        route.rate_limiter = Some(Arc::new(crate::limiter::RateLimiter::new(1, 0, false)));

        let dispatcher = dispatcher_with_route(route);
        let body = serde_json::json!({"model": "bge-small"});

        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(1));
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_route_and_no_default_pool_rejects() {
        let store = Arc::new(RouteStore::new());
        let registry = Arc::new(EndpointRegistry::new());
        let engine = Arc::new(RouteEngine::new(store, registry, "default"));
        let dispatcher = Dispatcher::new(engine);

        let body = serde_json::json!({"model": "bge-small"});
        match dispatcher.dispatch(&request(), "/api/embed", &body).await {
            DispatchOutcome::Rejected { status, message, .. } => {
                assert_eq!(status, 503);
                assert!(message.contains("no route matched"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
