//! Validating admission webhook
//!
//! Serves AdmissionReview requests for both Termite resources. Validation
//! logic lives on the CRD spec types in `termite-common` so the proxy's
//! compiler and the webhook enforce identical rules; this module only
//! adapts it to the admission wire format.

use std::net::SocketAddr;
use std::path::Path;

use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{info, warn};

use termite_common::crd::{TermitePool, TermiteRoute};

/// Build the webhook router
pub fn webhook_router() -> Router {
    Router::new()
        .route("/validate/termitepools", post(validate_pool_handler))
        .route("/validate/termiteroutes", post(validate_route_handler))
        .route("/healthz", get(|| async { "ok" }))
}

/// Serve the webhook over TLS.
///
/// `cert_dir` must contain `tls.crt` and `tls.key`, the layout produced by
/// cert-manager and the kube CSR flow.
pub async fn serve(addr: SocketAddr, cert_dir: &Path) -> std::io::Result<()> {
    let config =
        RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key")).await?;

    info!(%addr, "admission webhook listening");
    axum_server::bind_rustls(addr, config)
        .serve(webhook_router().into_make_service())
        .await
}

// =============================================================================
// Handlers
// =============================================================================

async fn validate_pool_handler(
    Json(review): Json<AdmissionReview<TermitePool>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<TermitePool> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed pool admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate_pool(&request).into_review())
}

async fn validate_route_handler(
    Json(review): Json<AdmissionReview<TermiteRoute>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<TermiteRoute> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed route admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate_route(&request).into_review())
}

// =============================================================================
// Validation adapters
// =============================================================================

/// Validate a TermitePool admission request.
///
/// Updates additionally enforce immutability against the old object.
/// Deletes always pass.
pub fn validate_pool(request: &AdmissionRequest<TermitePool>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if request.operation == Operation::Delete {
        return response;
    }

    let Some(pool) = &request.object else {
        return AdmissionResponse::invalid("no object in admission request");
    };

    let result = match (&request.operation, &request.old_object) {
        (Operation::Update, Some(old)) => pool.spec.validate_update(&old.spec),
        _ => pool.spec.validate(),
    };

    match result {
        Ok(()) => response,
        Err(message) => {
            info!(
                pool = %request.name,
                operation = ?request.operation,
                "denied pool admission"
            );
            response.deny(message)
        }
    }
}

/// Validate a TermiteRoute admission request. Deletes always pass.
pub fn validate_route(request: &AdmissionRequest<TermiteRoute>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if request.operation == Operation::Delete {
        return response;
    }

    let Some(route) = &request.object else {
        return AdmissionResponse::invalid("no object in admission request");
    };

    match route.spec.validate() {
        Ok(()) => response,
        Err(message) => {
            info!(
                route = %request.name,
                operation = ?request.operation,
                "denied route admission"
            );
            response.deny(message)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
