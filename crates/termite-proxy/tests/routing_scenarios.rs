//! End-to-end routing scenarios
//!
//! Each test stands up an in-process mock worker, hand-populates the
//! registry and store the way the topology watcher would, and drives the
//! full pipeline from request to dispatched response.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;

use termite_common::crd::{OperationType, TermiteRouteSpec};
use termite_proxy::compile::compile_route;
use termite_proxy::dispatch::{DispatchOutcome, Dispatcher};
use termite_proxy::{EndpointRegistry, RouteEngine, RouteStore};

/// Spawn a mock worker that answers embed requests, returning its address
/// and a hit counter.
async fn spawn_worker(status: axum::http::StatusCode) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_handler = Arc::clone(&hits);

    let app = Router::new().route(
        "/api/embed",
        post(move |Json(_): Json<serde_json::Value>| {
            let hits = Arc::clone(&hits_for_handler);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    status,
                    Json(serde_json::json!({"embeddings": [[0.1, 0.2, 0.3]]})),
                )
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (address, hits)
}

fn pipeline(default_pool: &str) -> (Arc<RouteStore>, Arc<EndpointRegistry>, Dispatcher) {
    let store = Arc::new(RouteStore::new());
    let registry = Arc::new(EndpointRegistry::new());
    let engine = Arc::new(RouteEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        default_pool,
    ));
    (store, registry, Dispatcher::new(engine))
}

fn route_spec(json: serde_json::Value) -> TermiteRouteSpec {
    serde_json::from_value(json).unwrap()
}

fn embed_request(model: &str) -> termite_proxy::RouteRequest {
    termite_proxy::RouteRequest {
        operation: OperationType::Embed,
        model: model.to_string(),
        headers: BTreeMap::new(),
        source_table: String::new(),
        source_namespace: String::new(),
        source_service_account: String::new(),
        timestamp: Utc::now(),
    }
}

fn embed_body(model: &str) -> serde_json::Value {
    serde_json::json!({"model": model, "input": "the quick brown fox"})
}

#[tokio::test]
async fn higher_priority_route_wins_and_counts_the_match() {
    let (worker_a, hits_a) = spawn_worker(axum::http::StatusCode::OK).await;
    let (worker_b, hits_b) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&worker_a, "pool-a", "");
    registry.register(&worker_b, "pool-b", "");

    let high = route_spec(serde_json::json!({
        "priority": 200,
        "match": {"models": ["bge-small"]},
        "route": [{"pool": "pool-a"}]
    }));
    let low = route_spec(serde_json::json!({
        "priority": 100,
        "match": {"models": ["bge-small"]},
        "route": [{"pool": "pool-b"}]
    }));
    store.upsert(compile_route("default", "high", &high).unwrap());
    store.upsert(compile_route("default", "low", &low).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("bge-small"), "/api/embed", &embed_body("bge-small"))
        .await;

    match outcome {
        DispatchOutcome::Success { status, body } => {
            assert_eq!(status, 200);
            let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(parsed["embeddings"].is_array());
        }
        other => panic!("expected success, got {other:?}"),
    }

    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 0);
    assert_eq!(store.get("default/high").unwrap().matched_requests(), 1);
    assert_eq!(store.get("default/low").unwrap().matched_requests(), 0);
}

#[tokio::test]
async fn queue_depth_condition_diverts_to_quiet_pool() {
    let (worker_a, hits_a) = spawn_worker(axum::http::StatusCode::OK).await;
    let (worker_b, hits_b) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&worker_a, "pool-a", "");
    registry.register(&worker_b, "pool-b", "");

    // Pool A reports queue depth 15, pool B depth 3
    for _ in 0..15 {
        registry.observe_dispatch(&worker_a, 1);
    }
    for _ in 0..3 {
        registry.observe_dispatch(&worker_b, 1);
    }

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [
            {"pool": "pool-a", "weight": 100, "condition": {"queueDepth": "<10"}},
            {"pool": "pool-b", "weight": 50}
        ]
    }));
    store.upsert(compile_route("default", "split", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    assert!(matches!(outcome, DispatchOutcome::Success { .. }));
    assert_eq!(hits_a.load(Ordering::SeqCst), 0);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_loaded_gate_falls_back_to_reject() {
    let (worker_a, hits_a) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&worker_a, "pool-a", "");
    registry.set_models(&worker_a, vec!["some-other-model".to_string()]);

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "pool-a", "condition": {"modelLoaded": true}}],
        "fallback": {"action": "reject"}
    }));
    store.upsert(compile_route("default", "gated", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("bge-small"), "/api/embed", &embed_body("bge-small"))
        .await;

    match outcome {
        DispatchOutcome::Rejected { status, .. } => assert_eq!(status, 503),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(hits_a.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rapid_requests_hit_the_rate_limit() {
    let (worker_a, _) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&worker_a, "pool-a", "");

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "pool-a"}],
        "rateLimiting": {"requestsPerSecond": 1, "burstSize": 1}
    }));
    store.upsert(compile_route("default", "limited", &spec).unwrap());

    let mut admitted = 0;
    let mut limited = 0;
    for _ in 0..3 {
        match dispatcher
            .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
            .await
        {
            DispatchOutcome::Success { .. } => admitted += 1,
            DispatchOutcome::Rejected { status, retry_after, .. } => {
                assert_eq!(status, 429);
                assert!(retry_after.is_some());
                limited += 1;
            }
        }
    }

    // One token from the initial burst, at most one more from refill within
    // the test's runtime
    assert!(admitted >= 1, "first request must be admitted");
    assert!(admitted <= 2, "admitted {admitted} of 3 with burst 1 and 1 rps");
    assert!(limited >= 1, "at least one request must be rate-limited");
}

#[tokio::test]
async fn retries_move_to_a_healthy_endpoint() {
    let (sick, sick_hits) = spawn_worker(axum::http::StatusCode::INTERNAL_SERVER_ERROR).await;
    let (healthy, healthy_hits) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&sick, "pool-a", "");
    registry.register(&healthy, "pool-a", "");
    // Bias first selection toward the sick endpoint (lower queue depth)
    registry.observe_dispatch(&healthy, 1);

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "pool-a"}],
        "retry": {"attempts": 2, "retryOn": ["5xx"]}
    }));
    store.upsert(compile_route("default", "retrying", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    match outcome {
        DispatchOutcome::Success { status, .. } => assert_eq!(status, 200),
        other => panic!("expected success after retry, got {other:?}"),
    }
    assert_eq!(sick_hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_failure_outside_retry_on_is_not_retried() {
    // A bound-then-dropped listener yields a reliably refused address
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let (healthy, healthy_hits) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&dead, "pool-a", "");
    registry.register(&healthy, "pool-a", "");
    // Bias first selection toward the dead endpoint (lower queue depth)
    registry.observe_dispatch(&healthy, 1);

    // connect-failure is deliberately absent from retryOn, so the refused
    // connection must be terminal rather than re-selecting the healthy
    // endpoint
    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "pool-a"}],
        "retry": {"attempts": 3, "retryOn": ["5xx"]}
    }));
    store.upsert(compile_route("default", "status-only", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    match outcome {
        DispatchOutcome::Rejected { status, .. } => assert_eq!(status, 503),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(healthy_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transport_failure_in_retry_on_moves_to_healthy_endpoint() {
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let (healthy, healthy_hits) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&dead, "pool-a", "");
    registry.register(&healthy, "pool-a", "");
    registry.observe_dispatch(&healthy, 1);

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "pool-a"}],
        "retry": {"attempts": 3, "retryOn": ["connect-failure"]}
    }));
    store.upsert(compile_route("default", "connect-retry", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    match outcome {
        DispatchOutcome::Success { status, .. } => assert_eq!(status, 200),
        other => panic!("expected success after retry, got {other:?}"),
    }
    assert_eq!(healthy_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redirect_fallback_dispatches_to_named_pool() {
    let (standby, standby_hits) = spawn_worker(axum::http::StatusCode::OK).await;

    let (store, registry, dispatcher) = pipeline("default");
    registry.register(&standby, "standby", "");

    let spec = route_spec(serde_json::json!({
        "match": {},
        "route": [{"pool": "empty-pool"}],
        "fallback": {"action": "redirect", "redirectPool": "standby"}
    }));
    store.upsert(compile_route("default", "redirecting", &spec).unwrap());

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    assert!(matches!(outcome, DispatchOutcome::Success { .. }));
    assert_eq!(standby_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmatched_request_uses_default_pool() {
    let (worker, hits) = spawn_worker(axum::http::StatusCode::OK).await;

    let (_store, registry, dispatcher) = pipeline("default");
    registry.register(&worker, "default", "");

    let outcome = dispatcher
        .dispatch(&embed_request("m"), "/api/embed", &embed_body("m"))
        .await;

    assert!(matches!(outcome, DispatchOutcome::Success { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn api_surface_maps_rejections_and_bad_json() {
    use termite_proxy::api::{api_router, AppState};

    let (_store, _registry, dispatcher) = pipeline("default");
    let app = api_router(AppState::new(Arc::new(dispatcher)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    // No routes, empty default pool: 503
    let response = client
        .post(format!("{base}/api/embed"))
        .json(&embed_body("m"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);

    // Malformed JSON: 400
    let response = client
        .post(format!("{base}/api/embed"))
        .header("content-type", "application/json")
        .body("this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Model inventory with no workers: empty arrays
    let response = client
        .get(format!("{base}/api/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let models: serde_json::Value = response.json().await.unwrap();
    assert_eq!(models["embedders"], serde_json::json!([]));
}
