//! Client-facing HTTP API
//!
//! Three inference endpoints plus a model inventory endpoint. Each
//! inference handler derives a routing view of the request, runs the
//! dispatch pipeline, and relays the worker's response verbatim. The
//! health surface lives on a separate port.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use termite_common::crd::OperationType;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::engine::RouteRequest;

/// Header identifying the calling Antfly table
const TABLE_HEADER: &str = "x-antfly-table";
/// Header identifying the caller's namespace
const NAMESPACE_HEADER: &str = "x-antfly-namespace";
/// Header identifying the caller's service account
const SERVICE_ACCOUNT_HEADER: &str = "x-antfly-service-account";

// =============================================================================
// Request/response shapes
// =============================================================================

/// Input for an embed request: one string or a batch
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EmbedInput {
    /// A single input string
    Single(String),
    /// A batch of input strings
    Batch(Vec<String>),
}

/// Body of `POST /api/embed`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EmbedRequest {
    /// Model to embed with
    pub model: String,
    /// Input text(s)
    pub input: EmbedInput,
}

/// Body of `POST /api/chunk`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunkRequest {
    /// Model to chunk with
    pub model: String,
    /// Text to chunk
    pub text: String,
}

/// Body of `POST /api/rerank`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RerankRequest {
    /// Model to rerank with
    pub model: String,
    /// Query to score documents against
    pub query: String,
    /// Documents to score
    pub documents: Vec<String>,
}

/// Body of `GET /api/models`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModelsResponse {
    /// Available chunking models
    pub chunkers: Vec<String>,
    /// Available reranking models
    pub rerankers: Vec<String>,
    /// Available embedding models
    pub embedders: Vec<String>,
}

// =============================================================================
// Router
// =============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    /// The dispatch pipeline
    pub dispatcher: Arc<Dispatcher>,
    /// Client for relayed inventory requests
    pub http: reqwest::Client,
}

impl AppState {
    /// Create state over the given dispatcher
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            http: reqwest::Client::new(),
        }
    }
}

/// Build the client-facing API router
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/embed", post(embed_handler))
        .route("/api/chunk", post(chunk_handler))
        .route("/api/rerank", post(rerank_handler))
        .route("/api/models", get(models_handler))
        .with_state(state)
}

/// Build the health router served on the health port
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

// =============================================================================
// Handlers
// =============================================================================

async fn embed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EmbedRequest>,
) -> Response {
    let req = route_request(OperationType::Embed, &body.model, &headers);
    let payload = serde_json::to_value(&body).unwrap_or_default();
    relay(state.dispatcher.dispatch(&req, "/api/embed", &payload).await)
}

async fn chunk_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChunkRequest>,
) -> Response {
    let req = route_request(OperationType::Chunk, &body.model, &headers);
    let payload = serde_json::to_value(&body).unwrap_or_default();
    relay(state.dispatcher.dispatch(&req, "/api/chunk", &payload).await)
}

async fn rerank_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RerankRequest>,
) -> Response {
    let req = route_request(OperationType::Rerank, &body.model, &headers);
    let payload = serde_json::to_value(&body).unwrap_or_default();
    relay(state.dispatcher.dispatch(&req, "/api/rerank", &payload).await)
}

/// Aggregate model inventory.
///
/// The proxy holds no models itself; the request is relayed to the least
/// loaded ready endpoint of the default pool. With no ready endpoints the
/// response is empty arrays, matching a worker with nothing configured.
async fn models_handler(State(state): State<AppState>) -> Response {
    let engine = state.dispatcher.engine();
    let Some(endpoint) = engine.pick_endpoint(engine.default_pool(), None) else {
        return (StatusCode::OK, Json(ModelsResponse::default())).into_response();
    };

    let url = format!("{}/api/models", endpoint.address);
    match state.http.get(&url).send().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            match response.bytes().await {
                Ok(bytes) => json_response(status, bytes.to_vec()),
                Err(e) => {
                    debug!(error = %e, "models relay body read failed");
                    (StatusCode::OK, Json(ModelsResponse::default())).into_response()
                }
            }
        }
        Err(e) => {
            debug!(error = %e, endpoint = %endpoint.address, "models relay failed");
            (StatusCode::OK, Json(ModelsResponse::default())).into_response()
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Build the routing view of a request from its operation, model, and headers
fn route_request(operation: OperationType, model: &str, headers: &HeaderMap) -> RouteRequest {
    let mut header_map = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let take = |name: &str| header_map.get(name).cloned().unwrap_or_default();

    RouteRequest {
        operation,
        model: model.to_string(),
        source_table: take(TABLE_HEADER),
        source_namespace: take(NAMESPACE_HEADER),
        source_service_account: take(SERVICE_ACCOUNT_HEADER),
        headers: header_map,
        timestamp: Utc::now(),
    }
}

/// Map a dispatch outcome onto an HTTP response
fn relay(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Success { status, body } => json_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        ),
        DispatchOutcome::Rejected {
            status,
            message,
            retry_after,
        } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
            let mut response =
                (status, Json(serde_json::json!({ "error": message }))).into_response();
            if let Some(seconds) = retry_after {
                if let Ok(value) = seconds.to_string().parse() {
                    response.headers_mut().insert("retry-after", value);
                }
            }
            response
        }
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_request_accepts_single_and_batch_input() {
        let single: EmbedRequest =
            serde_json::from_str(r#"{"model":"bge-small","input":"hello"}"#).unwrap();
        assert!(matches!(single.input, EmbedInput::Single(_)));

        let batch: EmbedRequest =
            serde_json::from_str(r#"{"model":"bge-small","input":["a","b"]}"#).unwrap();
        match batch.input {
            EmbedInput::Batch(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn rerank_request_shape() {
        let req: RerankRequest = serde_json::from_str(
            r#"{"model":"bge-rerank","query":"q","documents":["d1","d2"]}"#,
        )
        .unwrap();
        assert_eq!(req.documents.len(), 2);
    }

    #[test]
    fn models_response_defaults_to_empty_arrays() {
        let json = serde_json::to_value(ModelsResponse::default()).unwrap();
        assert_eq!(json["chunkers"], serde_json::json!([]));
        assert_eq!(json["rerankers"], serde_json::json!([]));
        assert_eq!(json["embedders"], serde_json::json!([]));
    }

    #[test]
    fn route_request_extracts_source_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-antfly-table", "orders".parse().unwrap());
        headers.insert("x-antfly-namespace", "prod".parse().unwrap());
        headers.insert("x-tier", "premium".parse().unwrap());

        let req = route_request(OperationType::Embed, "bge-small", &headers);
        assert_eq!(req.source_table, "orders");
        assert_eq!(req.source_namespace, "prod");
        assert!(req.source_service_account.is_empty());
        assert_eq!(req.headers.get("x-tier").map(String::as_str), Some("premium"));
        assert_eq!(req.model, "bge-small");
    }

    #[test]
    fn rejection_carries_retry_after_header() {
        let response = relay(DispatchOutcome::Rejected {
            status: 429,
            message: "rate limit exceeded".to_string(),
            retry_after: Some(7),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap().to_str().unwrap(),
            "7"
        );
    }

    #[test]
    fn success_relays_status_and_content_type() {
        let response = relay(DispatchOutcome::Success {
            status: 200,
            body: br#"{"embeddings":[[0.1]]}"#.to_vec(),
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap().to_str().unwrap(),
            "application/json"
        );
    }
}
