//! Common types for Termite: CRDs, errors, telemetry, and metrics

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::{Error, ReconcileError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Termite custom resources
pub const API_GROUP: &str = "antfly.io";

/// API version for all Termite custom resources
pub const API_VERSION: &str = "v1alpha1";

/// Default serving port for Termite worker pods
pub const DEFAULT_WORKER_PORT: u16 = 11433;

/// Default health/metrics port for the proxy
pub const DEFAULT_PROXY_HEALTH_PORT: u16 = 4200;

/// Default health port for the operator
pub const DEFAULT_OPERATOR_HEALTH_PORT: u16 = 8080;

/// Default metrics port for the operator
pub const DEFAULT_OPERATOR_METRICS_PORT: u16 = 8081;

/// Label carrying the pool name on services, endpoint slices, and pods
pub const POOL_LABEL: &str = "antfly.io/pool";

/// Label carrying the coarse workload-type tag on worker pods
pub const WORKLOAD_TYPE_LABEL: &str = "antfly.io/workload-type";

/// Annotation listing models loaded on a worker pod (comma-separated)
pub const MODELS_ANNOTATION: &str = "antfly.io/models";

/// Standard Kubernetes name label
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Standard Kubernetes managed-by label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the name label on all Termite workloads
pub const APP_NAME: &str = "termite";

/// Value of the managed-by label on operator-created resources
pub const MANAGED_BY_OPERATOR: &str = "termite-operator";

/// Workload-type tag recorded when a pod carries no explicit tag
pub const WORKLOAD_TYPE_GENERAL: &str = "general";

/// Prefix for pool-owned child resources (stateful sets, services)
pub const POOL_RESOURCE_PREFIX: &str = "termite-";

/// Install the default rustls crypto provider.
///
/// Must be called before creating any TLS connections (including kube
/// clients). Safe to call multiple times, subsequent calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
