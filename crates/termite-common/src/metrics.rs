//! Metrics registry for Termite observability
//!
//! OpenTelemetry instruments for:
//! - Request routing (totals by pool, durations, rate-limit rejections)
//! - Endpoint registry health (healthy endpoints, queue depth)
//! - Pool reconciliation (duration, errors)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for Termite metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("termite"));

// ============================================================================
// Routing Metrics
// ============================================================================

/// Counter of requests routed, by destination pool
///
/// Labels:
/// - `pool`: destination pool name
/// - `operation`: embed, chunk, rerank
/// - `outcome`: dispatched, rate_limited, rejected, no_route
pub static REQUESTS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("termite_requests_total")
        .with_description("Total requests handled by the proxy, by pool and outcome")
        .with_unit("{requests}")
        .build()
});

/// Histogram of end-to-end request duration
///
/// Labels:
/// - `operation`: embed, chunk, rerank
/// - `pool`: destination pool name
pub static REQUEST_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("termite_request_duration_seconds")
        .with_description("End-to-end request duration in seconds")
        .with_unit("s")
        .build()
});

/// Counter of rate-limited requests
///
/// Labels:
/// - `route`: namespace-qualified route name
pub static RATE_LIMITED_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("termite_rate_limited_total")
        .with_description("Requests rejected by per-route rate limits")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Registry Metrics
// ============================================================================

/// Gauge of healthy endpoints per pool
///
/// Labels:
/// - `pool`: pool name
pub static HEALTHY_ENDPOINTS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("termite_healthy_endpoints")
        .with_description("Ready endpoints currently registered, by pool")
        .with_unit("{endpoints}")
        .build()
});

/// Gauge of aggregate queue depth per pool
///
/// Labels:
/// - `pool`: pool name
pub static POOL_QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("termite_pool_queue_depth")
        .with_description("Sum of in-flight requests across a pool's endpoints")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of pool reconciliation duration
///
/// Labels:
/// - `pool`: pool name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("termite_pool_reconcile_duration_seconds")
        .with_description("Duration of pool reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pool reconciliation errors
///
/// Labels:
/// - `pool`: pool name
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("termite_pool_reconcile_errors_total")
        .with_description("Total pool reconciliation errors")
        .with_unit("{errors}")
        .build()
});
