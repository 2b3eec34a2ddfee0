//! TermiteRoute CRD types
//!
//! A `TermiteRoute` declares how matching inference requests are routed to
//! worker pools. The proxy compiles admitted routes into its in-memory
//! route table; the operator validates them at admission.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Retry conditions accepted in `spec.retry.retryOn`
pub const VALID_RETRY_ON: &[&str] = &[
    "5xx",
    "reset",
    "connect-failure",
    "retriable-4xx",
    "refused-stream",
    "cancelled",
    "deadline-exceeded",
    "resource-exhausted",
];

// =============================================================================
// Match types
// =============================================================================

/// A Termite API operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Text embedding
    Embed,
    /// Text chunking
    Chunk,
    /// Document reranking
    Rerank,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embed => write!(f, "embed"),
            Self::Chunk => write!(f, "chunk"),
            Self::Rerank => write!(f, "rerank"),
        }
    }
}

/// How to match a string value. At least one field must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StringMatch {
    /// Match the exact value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exact: String,

    /// Match a prefix
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,

    /// Match a regular expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
}

/// Match on the source of a request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceMatch {
    /// Requests originating from specific Antfly tables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,

    /// Requests originating from specific Kubernetes namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Requests originating from specific service accounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<String>,
}

/// Restrict when a route (or destination) is active. Times are UTC.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TimeWindowMatch {
    /// Start time in HH:MM format
    pub start: String,

    /// End time in HH:MM format. An end before the start wraps overnight
    /// (e.g., 22:00-06:00).
    pub end: String,

    /// Restrict to specific days (0=Sunday through 6=Saturday)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<i32>,
}

/// Conditions for a route to match a request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    /// Match specific API operations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationType>,

    /// Match model names. Supports `*` wildcards ("bge-*", "*-rerank-*").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Match request headers by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,

    /// Match the request source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMatch>,

    /// Restrict when this route is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindowMatch>,
}

// =============================================================================
// Destination types
// =============================================================================

/// Live-condition gate on a destination. All populated fields must hold.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteCondition {
    /// Average queue depth threshold, e.g. ">50", "<10", ">=100"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue_depth: String,

    /// Healthy replica count threshold, e.g. ">=2"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub available_replicas: String,

    /// Latency threshold with ms/s units, e.g. ">100ms". Bare numbers are
    /// seconds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latency: String,

    /// Eligible only if the requested model is loaded somewhere in the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_loaded: Option<bool>,

    /// Eligible only during specific hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<TimeWindowMatch>,
}

impl RouteCondition {
    /// Whether any field of the condition is populated
    pub fn is_empty(&self) -> bool {
        self.queue_depth.is_empty()
            && self.available_replicas.is_empty()
            && self.latency.is_empty()
            && self.model_loaded.is_none()
            && self.time_of_day.is_none()
    }
}

/// One destination in a route's destination list
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteDestination {
    /// The TermitePool to route to
    pub pool: String,

    /// Relative weight for traffic splitting (0-100)
    #[serde(default = "default_weight")]
    pub weight: i32,

    /// Makes this destination conditional on live pool state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RouteCondition>,
}

fn default_weight() -> i32 {
    100
}

// =============================================================================
// Fallback / rate limit / retry
// =============================================================================

/// What to do when no destination is eligible or retries are exhausted
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FallbackAction {
    /// Hold the request and periodically retry selection
    Queue,
    /// Reject with a configurable error response
    Reject,
    /// Re-select against a named pool, ignoring conditions
    Redirect,
}

/// Customized error response for `reject` fallback
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteFallbackError {
    /// HTTP status code returned to the caller
    #[serde(default = "default_status_code")]
    pub status_code: i32,

    /// Error message body
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Suggested Retry-After in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i32>,
}

fn default_status_code() -> i32 {
    503
}

impl Default for RouteFallbackError {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            message: String::new(),
            retry_after: None,
        }
    }
}

/// Fallback behavior for a route
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteFallback {
    /// Fallback action
    pub action: FallbackAction,

    /// Max time to hold a queued request before rejecting (for action=queue).
    /// Duration string such as "30s" or "500ms"; the proxy defaults to 30s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_time: Option<String>,

    /// Pool to redirect to (required for action=redirect)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redirect_pool: String,

    /// Customized error response (for action=reject)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<RouteFallbackError>,
}

/// Rate limiting for a route
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteRateLimiting {
    /// Sustained requests per second
    pub requests_per_second: i32,

    /// Burst allowance; defaults to requestsPerSecond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_size: Option<i32>,

    /// Track a separate bucket per model instead of one global bucket
    #[serde(default)]
    pub per_model: bool,
}

/// Retry behavior for a route
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteRetry {
    /// Max attempts including the first
    #[serde(default = "default_attempts")]
    pub attempts: i32,

    /// Timeout per attempt. Duration string such as "2s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,

    /// Which failures trigger retries (e.g., "5xx", "connect-failure")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
}

fn default_attempts() -> i32 {
    3
}

// =============================================================================
// CRD
// =============================================================================

/// Routing rule specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "antfly.io",
    version = "v1alpha1",
    kind = "TermiteRoute",
    plural = "termiteroutes",
    shortname = "troute",
    namespaced,
    status = "TermiteRouteStatus",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Active","type":"boolean","jsonPath":".status.active"}"#,
    printcolumn = r#"{"name":"Matched","type":"integer","jsonPath":".status.matchedRequests"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TermiteRouteSpec {
    /// Evaluation priority (higher first; same-priority routes evaluate in
    /// name order)
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// When this route applies
    #[serde(rename = "match", default)]
    pub match_: RouteMatch,

    /// Where to send matching requests
    #[serde(rename = "route", default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<RouteDestination>,

    /// Behavior when all destinations are unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<RouteFallback>,

    /// Rate limits for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiting: Option<RouteRateLimiting>,

    /// Retry behavior for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RouteRetry>,
}

fn default_priority() -> i32 {
    100
}

/// Per-destination health as observed by the proxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    /// Destination pool name
    pub pool: String,

    /// Whether the destination currently has ready endpoints
    pub healthy: bool,

    /// In-flight request count across the pool
    #[serde(default)]
    pub active_connections: i32,

    /// Total requests routed to this destination
    #[serde(default)]
    pub requests_routed: i64,
}

/// Status of a TermiteRoute
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TermiteRouteStatus {
    /// Whether the route is live in the proxy's route table
    #[serde(default)]
    pub active: bool,

    /// Total requests matched by this route
    #[serde(default)]
    pub matched_requests: i64,

    /// When a request last matched this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_match_time: Option<DateTime<Utc>>,

    /// Latest observed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-destination observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_status: Vec<DestinationStatus>,
}

// =============================================================================
// Validation
// =============================================================================

impl TermiteRouteSpec {
    /// Validate the route spec for admission.
    ///
    /// Collects every violated rule into one line-separated message.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if let Err(e) = self.validate_destinations() {
            errors.push(e);
        }
        if let Err(e) = self.validate_match() {
            errors.push(e);
        }
        if let Err(e) = self.validate_fallback() {
            errors.push(e);
        }
        if let Err(e) = self.validate_rate_limiting() {
            errors.push(e);
        }
        if let Err(e) = self.validate_retry() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "TermiteRoute validation failed:\n  - {}",
                errors.join("\n  - ")
            ))
        }
    }

    fn validate_destinations(&self) -> Result<(), String> {
        if self.destinations.is_empty() {
            return Err("spec.route must have at least one destination".to_string());
        }

        let mut unconditional_pools = std::collections::BTreeSet::new();
        for (i, dest) in self.destinations.iter().enumerate() {
            if dest.pool.is_empty() {
                return Err(format!("spec.route[{i}].pool is required"));
            }
            if !(0..=100).contains(&dest.weight) {
                return Err(format!(
                    "spec.route[{i}].weight must be between 0 and 100, got {}",
                    dest.weight
                ));
            }
            // Duplicate pools are only meaningful when each carries a
            // distinguishing condition.
            if dest.condition.as_ref().map(|c| c.is_empty()).unwrap_or(true)
                && !unconditional_pools.insert(dest.pool.as_str())
            {
                return Err(format!(
                    "duplicate pool '{}' in route destinations without conditions",
                    dest.pool
                ));
            }
        }
        Ok(())
    }

    fn validate_match(&self) -> Result<(), String> {
        for (i, pattern) in self.match_.models.iter().enumerate() {
            if pattern.is_empty() {
                return Err(format!("spec.match.models[{i}] cannot be empty"));
            }
            if pattern.contains('*') {
                let anchored = format!("^{}$", pattern.replace('*', ".*"));
                if let Err(e) = Regex::new(&anchored) {
                    return Err(format!("invalid model pattern '{pattern}': {e}"));
                }
            }
        }

        if let Some(tw) = &self.match_.time_window {
            validate_time_window(tw).map_err(|e| format!("spec.match.timeWindow: {e}"))?;
        }

        for (header, matcher) in &self.match_.headers {
            if header.is_empty() {
                return Err("header name cannot be empty in spec.match.headers".to_string());
            }
            if matcher.exact.is_empty() && matcher.prefix.is_empty() && matcher.regex.is_empty() {
                return Err(format!(
                    "header matcher for '{header}' must specify at least one of: exact, prefix, or regex"
                ));
            }
            if !matcher.regex.is_empty() {
                if let Err(e) = Regex::new(&matcher.regex) {
                    return Err(format!("invalid regex for header '{header}': {e}"));
                }
            }
        }

        for dest in &self.destinations {
            if let Some(cond) = &dest.condition {
                if let Some(tw) = &cond.time_of_day {
                    validate_time_window(tw)
                        .map_err(|e| format!("spec.route condition timeOfDay: {e}"))?;
                }
            }
        }

        Ok(())
    }

    fn validate_fallback(&self) -> Result<(), String> {
        let Some(fb) = &self.fallback else {
            return Ok(());
        };

        if fb.action == FallbackAction::Redirect && fb.redirect_pool.is_empty() {
            return Err(
                "spec.fallback.redirectPool is required when action is 'redirect'".to_string(),
            );
        }

        // maxQueueTime is optional for action=queue; the proxy applies its
        // published default when unset.
        if let Some(mqt) = &fb.max_queue_time {
            parse_duration(mqt).map_err(|e| format!("spec.fallback.maxQueueTime: {e}"))?;
        }

        Ok(())
    }

    fn validate_rate_limiting(&self) -> Result<(), String> {
        let Some(rl) = &self.rate_limiting else {
            return Ok(());
        };

        if rl.requests_per_second <= 0 {
            return Err(format!(
                "spec.rateLimiting.requestsPerSecond must be > 0, got {}",
                rl.requests_per_second
            ));
        }
        if let Some(burst) = rl.burst_size {
            if burst < 0 {
                return Err(format!(
                    "spec.rateLimiting.burstSize must be >= 0, got {burst}"
                ));
            }
        }
        Ok(())
    }

    fn validate_retry(&self) -> Result<(), String> {
        let Some(retry) = &self.retry else {
            return Ok(());
        };

        if retry.attempts < 0 {
            return Err(format!(
                "spec.retry.attempts must be >= 0, got {}",
                retry.attempts
            ));
        }
        if let Some(timeout) = &retry.per_try_timeout {
            parse_duration(timeout).map_err(|e| format!("spec.retry.perTryTimeout: {e}"))?;
        }
        for condition in &retry.retry_on {
            if !VALID_RETRY_ON.contains(&condition.as_str()) {
                return Err(format!(
                    "invalid retry condition '{}'. Valid values: {}",
                    condition,
                    VALID_RETRY_ON.join(", ")
                ));
            }
        }
        Ok(())
    }
}

/// Validate HH:MM times and 0..6 day numbers on a time window
pub fn validate_time_window(tw: &TimeWindowMatch) -> Result<(), String> {
    for (label, value) in [("start", &tw.start), ("end", &tw.end)] {
        if !value.is_empty() && parse_hhmm(value).is_none() {
            return Err(format!("{label} time '{value}' is not in HH:MM format"));
        }
    }
    for day in &tw.days {
        if !(0..=6).contains(day) {
            return Err(format!(
                "invalid day {day}. Days must be 0 (Sunday) through 6 (Saturday)"
            ));
        }
    }
    Ok(())
}

/// Parse an "HH:MM" wall-clock time into (hour, minute)
pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    if m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Parse a duration string with ms/s/m/h suffix ("500ms", "30s", "5m")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit): (&str, fn(f64) -> Duration) = if let Some(v) = s.strip_suffix("ms") {
        (v, |n| Duration::from_secs_f64(n / 1000.0))
    } else if let Some(v) = s.strip_suffix('h') {
        (v, |n| Duration::from_secs_f64(n * 3600.0))
    } else if let Some(v) = s.strip_suffix('m') {
        (v, |n| Duration::from_secs_f64(n * 60.0))
    } else if let Some(v) = s.strip_suffix('s') {
        (v, Duration::from_secs_f64)
    } else {
        return Err(format!("invalid duration '{s}': missing ms/s/m/h unit"));
    };

    let n: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    if n < 0.0 {
        return Err(format!("invalid duration '{s}': must be non-negative"));
    }
    Ok(unit(n))
}

// =============================================================================
// Tests
// =============================================================================
