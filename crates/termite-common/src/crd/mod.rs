//! Custom Resource Definitions for Termite
//!
//! This module contains the two user-facing resources: `TermitePool`
//! (a worker pool materialized into a stateful workload group) and
//! `TermiteRoute` (a routing rule consumed by the proxy).

mod pool;
mod route;
mod types;

pub use pool::{
    GkeSpec, HardwareSpec, PoolPhase, PoolReplicas, PoolResources, TermitePool, TermitePoolSpec,
    TermitePoolStatus, VALID_COMPUTE_CLASSES,
};
pub use route::{
    parse_duration, parse_hhmm, validate_time_window, DestinationStatus, FallbackAction,
    OperationType, RouteCondition, RouteDestination, RouteFallback, RouteFallbackError, RouteMatch,
    RouteRateLimiting, RouteRetry, SourceMatch, StringMatch, TermiteRoute, TermiteRouteSpec,
    TermiteRouteStatus, TimeWindowMatch, VALID_RETRY_ON,
};
pub use types::{Condition, ConditionStatus};
