//! Termite routing proxy
//!
//! The proxy sits in front of the inference worker pools and owns the
//! request-routing pipeline: match an incoming request against the compiled
//! route table, select an eligible destination pool under live conditions,
//! apply per-route rate limits, and dispatch to the least-loaded worker
//! endpoint with retry and fallback.
//!
//! The hot path never touches the Kubernetes API: the topology watcher is
//! the sole writer of the [`registry::EndpointRegistry`] and
//! [`store::RouteStore`], and dispatchers read cheap snapshots.

pub mod api;
pub mod compile;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod fingerprint;
pub mod limiter;
pub mod registry;
pub mod route;
pub mod store;
pub mod watcher;

pub use config::ProxyConfig;
pub use engine::{RouteDecision, RouteEngine, RouteRequest};
pub use registry::{EndpointRegistry, EndpointSnapshot};
pub use store::RouteStore;
