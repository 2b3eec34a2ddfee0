//! Compiled route model
//!
//! Routes enter the store fully compiled: wildcard patterns become anchored
//! regexes, threshold strings become parsed operator/value pairs, and time
//! windows become minute-of-day ranges. The hot path never parses strings.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;

use termite_common::crd::{FallbackAction, OperationType};

use crate::engine::RouteRequest;
use crate::limiter::RateLimiter;

// =============================================================================
// Matchers
// =============================================================================

/// Compiled header matcher. Any populated alternative may match.
#[derive(Clone, Debug, Default)]
pub struct StringMatcher {
    /// Exact value
    pub exact: Option<String>,
    /// Value prefix
    pub prefix: Option<String>,
    /// Compiled regular expression
    pub regex: Option<Regex>,
}

impl StringMatcher {
    /// Whether the value satisfies any populated alternative
    pub fn matches(&self, value: &str) -> bool {
        if let Some(exact) = &self.exact {
            if value == exact {
                return true;
            }
        }
        if let Some(prefix) = &self.prefix {
            if value.starts_with(prefix.as_str()) {
                return true;
            }
        }
        if let Some(regex) = &self.regex {
            if regex.is_match(value) {
                return true;
            }
        }
        false
    }
}

/// Compiled time window, evaluated in UTC
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeWindow {
    /// Window start, minutes since midnight
    pub start_minutes: u32,
    /// Window end, minutes since midnight. An end before the start wraps
    /// overnight (22:00-06:00).
    pub end_minutes: u32,
    /// Active weekdays (0=Sunday through 6=Saturday); empty = every day
    pub days: HashSet<u32>,
}

impl TimeWindow {
    /// Whether the window covers the given instant
    pub fn is_active(&self, t: DateTime<Utc>) -> bool {
        if !self.days.is_empty() {
            let weekday = t.weekday().num_days_from_sunday();
            if !self.days.contains(&weekday) {
                return false;
            }
        }

        let current = t.hour() * 60 + t.minute();
        if self.start_minutes <= self.end_minutes {
            // Normal case: 09:00-17:00
            current >= self.start_minutes && current < self.end_minutes
        } else {
            // Overnight case: 22:00-06:00
            current >= self.start_minutes || current < self.end_minutes
        }
    }
}

/// Comparison operator for threshold conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdOp {
    /// Strictly greater
    Gt,
    /// Strictly less
    Lt,
    /// Greater or equal
    Ge,
    /// Less or equal
    Le,
    /// Equal
    Eq,
}

/// Parsed numeric threshold, e.g. ">50" or ">=100ms"
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdCondition {
    /// Comparison operator
    pub op: ThresholdOp,
    /// Threshold value. Latency values are stored in seconds.
    pub value: f64,
}

impl ThresholdCondition {
    /// Apply the operator to an observed value
    pub fn evaluate(&self, observed: f64) -> bool {
        match self.op {
            ThresholdOp::Gt => observed > self.value,
            ThresholdOp::Lt => observed < self.value,
            ThresholdOp::Ge => observed >= self.value,
            ThresholdOp::Le => observed <= self.value,
            ThresholdOp::Eq => observed == self.value,
        }
    }
}

/// Parse a threshold condition like ">50", ">=100", "<10ms".
///
/// A missing operator means equality. A `ms` suffix converts to seconds;
/// an `s` suffix and bare numbers pass through as seconds.
pub fn parse_threshold(s: &str) -> Result<ThresholdCondition, String> {
    let s = s.trim();

    let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
        (ThresholdOp::Ge, rest)
    } else if let Some(rest) = s.strip_prefix("<=") {
        (ThresholdOp::Le, rest)
    } else if let Some(rest) = s.strip_prefix("==") {
        (ThresholdOp::Eq, rest)
    } else if let Some(rest) = s.strip_prefix('>') {
        (ThresholdOp::Gt, rest)
    } else if let Some(rest) = s.strip_prefix('<') {
        (ThresholdOp::Lt, rest)
    } else {
        (ThresholdOp::Eq, s)
    };

    let rest = rest.trim();
    let (number, divisor) = if let Some(v) = rest.strip_suffix("ms") {
        (v, 1000.0)
    } else if let Some(v) = rest.strip_suffix('s') {
        (v, 1.0)
    } else {
        (rest, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid threshold value '{s}'"))?;

    Ok(ThresholdCondition {
        op,
        value: value / divisor,
    })
}

/// Compile a model pattern with `*` wildcards into an anchored regex
pub fn compile_model_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern);
    let regex_pattern = format!("^{}$", escaped.replace("\\*", ".*"));
    Regex::new(&regex_pattern)
}

// =============================================================================
// Destinations and fallback
// =============================================================================

/// Compiled destination: pool reference, weight, and eligibility conditions
#[derive(Clone, Debug, Default)]
pub struct Destination {
    /// Destination pool name
    pub pool: String,
    /// Relative weight (0-100)
    pub weight: i32,
    /// Average queue depth gate
    pub queue_depth: Option<ThresholdCondition>,
    /// Healthy replica count gate
    pub replicas: Option<ThresholdCondition>,
    /// Latency gate (seconds)
    pub latency: Option<ThresholdCondition>,
    /// Requires the requested model loaded somewhere in the pool
    pub require_model_loaded: bool,
    /// Time-of-day gate
    pub time: Option<TimeWindow>,
}

/// Compiled fallback behavior
#[derive(Clone, Debug)]
pub struct Fallback {
    /// queue, reject, or redirect
    pub action: FallbackAction,
    /// Max hold time for queued requests
    pub max_queue_time: Option<Duration>,
    /// Target pool for redirect
    pub redirect_pool: String,
    /// Status code for reject
    pub status_code: u16,
    /// Message body for reject
    pub message: String,
    /// Retry-After hint in seconds
    pub retry_after: Option<u32>,
}

impl Default for Fallback {
    fn default() -> Self {
        Self {
            action: FallbackAction::Reject,
            max_queue_time: None,
            redirect_pool: String::new(),
            status_code: 503,
            message: String::new(),
            retry_after: None,
        }
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Compiled retry policy
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Max attempts including the first
    pub attempts: u32,
    /// Timeout per attempt
    pub per_try_timeout: Option<Duration>,
    /// Response statuses that trigger a retry
    pub statuses: HashSet<u16>,
    /// Retry refused/failed connections
    pub on_connect_failure: bool,
    /// Retry reset connections
    pub on_reset: bool,
    /// Retry per-attempt timeouts
    pub on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            per_try_timeout: None,
            statuses: HashSet::new(),
            on_connect_failure: false,
            on_reset: false,
            on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// Whether a response status is classified retriable
    pub fn retriable_status(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }
}

// =============================================================================
// Route
// =============================================================================

/// A compiled route, ready for hot-path matching
pub struct Route {
    /// Namespace-qualified name ("namespace/name")
    pub name: String,
    /// Evaluation priority (higher first)
    pub priority: i32,

    /// Operations this route applies to; empty = any
    pub operations: HashSet<OperationType>,
    /// Compiled anchored model patterns; empty = any model
    pub model_patterns: Vec<Regex>,
    /// Header matchers, all of which must be satisfied
    pub header_matchers: BTreeMap<String, StringMatcher>,
    /// Caller tables; empty = any
    pub source_tables: HashSet<String>,
    /// Caller namespaces; empty = any
    pub source_namespaces: HashSet<String>,
    /// Caller service accounts; empty = any
    pub source_service_accounts: HashSet<String>,
    /// Active window; None = always
    pub time_window: Option<TimeWindow>,

    /// Destination list in declaration order
    pub destinations: Vec<Destination>,
    /// Fallback behavior; None means reject with defaults
    pub fallback: Option<Fallback>,
    /// Per-route token bucket
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Retry policy
    pub retry: RetryPolicy,

    matched_requests: AtomicI64,
    last_match_millis: AtomicI64,
}

impl Route {
    /// Create a route with empty matchers (used by the compiler and tests)
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            operations: HashSet::new(),
            model_patterns: Vec::new(),
            header_matchers: BTreeMap::new(),
            source_tables: HashSet::new(),
            source_namespaces: HashSet::new(),
            source_service_accounts: HashSet::new(),
            time_window: None,
            destinations: Vec::new(),
            fallback: None,
            rate_limiter: None,
            retry: RetryPolicy::default(),
            matched_requests: AtomicI64::new(0),
            last_match_millis: AtomicI64::new(0),
        }
    }

    /// Whether every populated match clause accepts the request
    pub fn matches(&self, req: &RouteRequest) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&req.operation) {
            return false;
        }

        if !self.model_patterns.is_empty()
            && !self.model_patterns.iter().any(|p| p.is_match(&req.model))
        {
            return false;
        }

        for (name, matcher) in &self.header_matchers {
            match req.headers.get(name) {
                Some(value) if matcher.matches(value) => {}
                _ => return false,
            }
        }

        if !self.source_tables.is_empty() && !self.source_tables.contains(&req.source_table) {
            return false;
        }
        if !self.source_namespaces.is_empty()
            && !self.source_namespaces.contains(&req.source_namespace)
        {
            return false;
        }
        if !self.source_service_accounts.is_empty()
            && !self
                .source_service_accounts
                .contains(&req.source_service_account)
        {
            return false;
        }

        if let Some(window) = &self.time_window {
            if !window.is_active(req.timestamp) {
                return false;
            }
        }

        true
    }

    /// Record a match against this route
    pub fn record_match(&self, at: DateTime<Utc>) {
        self.matched_requests.fetch_add(1, Ordering::Relaxed);
        self.last_match_millis
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Total requests matched since compile
    pub fn matched_requests(&self) -> i64 {
        self.matched_requests.load(Ordering::Relaxed)
    }

    /// When a request last matched, if ever
    pub fn last_match(&self) -> Option<DateTime<Utc>> {
        match self.last_match_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("destinations", &self.destinations.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn req(f: impl FnOnce(&mut RouteRequest)) -> RouteRequest {
        let mut r = RouteRequest {
            operation: OperationType::Embed,
            model: "bge-small".to_string(),
            headers: BTreeMap::new(),
            source_table: String::new(),
            source_namespace: String::new(),
            source_service_account: String::new(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap(),
        };
        f(&mut r);
        r
    }

    mod string_matcher {
        use super::*;

        #[test]
        fn exact_prefix_regex_alternatives() {
            let m = StringMatcher {
                exact: Some("premium".into()),
                ..Default::default()
            };
            assert!(m.matches("premium"));
            assert!(!m.matches("premium-plus"));

            let m = StringMatcher {
                prefix: Some("us-".into()),
                ..Default::default()
            };
            assert!(m.matches("us-west1"));
            assert!(!m.matches("eu-west1"));

            let m = StringMatcher {
                regex: Some(Regex::new("^v[0-9]+$").unwrap()),
                ..Default::default()
            };
            assert!(m.matches("v2"));
            assert!(!m.matches("v2-beta"));
        }

        #[test]
        fn empty_matcher_matches_nothing() {
            assert!(!StringMatcher::default().matches("anything"));
        }
    }

    mod time_window {
        use super::*;

        fn at(hour: u32, minute: u32) -> DateTime<Utc> {
            // 2025-06-02 is a Monday
            Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
        }

        #[test]
        fn normal_window() {
            let w = TimeWindow {
                start_minutes: 9 * 60,
                end_minutes: 17 * 60,
                days: HashSet::new(),
            };
            assert!(w.is_active(at(9, 0)));
            assert!(w.is_active(at(12, 30)));
            assert!(!w.is_active(at(17, 0)));
            assert!(!w.is_active(at(8, 59)));
        }

        #[test]
        fn overnight_window_wraps() {
            let w = TimeWindow {
                start_minutes: 22 * 60,
                end_minutes: 6 * 60,
                days: HashSet::new(),
            };
            assert!(w.is_active(at(23, 0)));
            assert!(w.is_active(at(5, 0)));
            assert!(!w.is_active(at(7, 0)));
            assert!(w.is_active(at(22, 0)));
            assert!(!w.is_active(at(6, 0)));
        }

        #[test]
        fn weekday_restriction() {
            // Monday = 1
            let w = TimeWindow {
                start_minutes: 0,
                end_minutes: 24 * 60,
                days: HashSet::from([1]),
            };
            assert!(w.is_active(at(12, 0)));

            let sunday = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
            assert!(!w.is_active(sunday));
        }
    }

    mod thresholds {
        use super::*;

        #[test]
        fn operators_parse_and_evaluate() {
            let c = parse_threshold(">50").unwrap();
            assert!(c.evaluate(51.0));
            assert!(!c.evaluate(50.0));

            let c = parse_threshold(">=50").unwrap();
            assert!(c.evaluate(50.0));
            assert!(!c.evaluate(49.9));

            let c = parse_threshold("<10").unwrap();
            assert!(c.evaluate(9.0));
            assert!(!c.evaluate(10.0));

            let c = parse_threshold("<=10").unwrap();
            assert!(c.evaluate(10.0));

            let c = parse_threshold("==3").unwrap();
            assert!(c.evaluate(3.0));
            assert!(!c.evaluate(4.0));
        }

        #[test]
        fn bare_value_means_equality() {
            let c = parse_threshold("5").unwrap();
            assert_eq!(c.op, ThresholdOp::Eq);
            assert!(c.evaluate(5.0));
        }

        #[test]
        fn millisecond_suffix_converts_to_seconds() {
            let c = parse_threshold(">100ms").unwrap();
            assert!((c.value - 0.1).abs() < f64::EPSILON);

            let c = parse_threshold(">1.5s").unwrap();
            assert!((c.value - 1.5).abs() < f64::EPSILON);

            // Bare numbers are seconds
            let c = parse_threshold(">2").unwrap();
            assert!((c.value - 2.0).abs() < f64::EPSILON);
        }

        #[test]
        fn garbage_rejected() {
            assert!(parse_threshold(">fast").is_err());
            assert!(parse_threshold("").is_err());
        }
    }

    mod model_patterns {
        use super::*;

        #[test]
        fn wildcard_equivalent_to_anchored_regex() {
            let cases = [
                ("bge-*", "bge-small", true),
                ("bge-*", "bge-", true),
                ("bge-*", "xbge-small", false),
                ("*-rerank-*", "ms-rerank-v2", true),
                ("*-rerank-*", "rerank", false),
                ("exact", "exact", true),
                ("exact", "exact2", false),
                ("*", "anything", true),
            ];
            for (pattern, input, expected) in cases {
                let re = compile_model_pattern(pattern).unwrap();
                assert_eq!(re.is_match(input), expected, "{pattern} vs {input}");
            }
        }

        #[test]
        fn regex_metacharacters_are_literal() {
            let re = compile_model_pattern("bge.v1").unwrap();
            assert!(re.is_match("bge.v1"));
            assert!(!re.is_match("bgexv1"));
        }
    }

    mod route_matching {
        use super::*;

        #[test]
        fn empty_clauses_match_everything() {
            let route = Route::new("default/catch-all", 1);
            assert!(route.matches(&req(|_| {})));
        }

        #[test]
        fn operation_clause() {
            let mut route = Route::new("default/embed-only", 1);
            route.operations.insert(OperationType::Embed);
            assert!(route.matches(&req(|_| {})));
            assert!(!route.matches(&req(|r| r.operation = OperationType::Rerank)));
        }

        #[test]
        fn model_clause_any_pattern_suffices() {
            let mut route = Route::new("default/models", 1);
            route.model_patterns = vec![
                compile_model_pattern("minilm").unwrap(),
                compile_model_pattern("bge-*").unwrap(),
            ];
            assert!(route.matches(&req(|_| {})));
            assert!(!route.matches(&req(|r| r.model = "e5-large".into())));
        }

        #[test]
        fn header_clause_all_must_match() {
            let mut route = Route::new("default/headers", 1);
            route.header_matchers.insert(
                "x-tier".into(),
                StringMatcher {
                    exact: Some("premium".into()),
                    ..Default::default()
                },
            );
            route.header_matchers.insert(
                "x-region".into(),
                StringMatcher {
                    prefix: Some("us-".into()),
                    ..Default::default()
                },
            );

            assert!(route.matches(&req(|r| {
                r.headers.insert("x-tier".into(), "premium".into());
                r.headers.insert("x-region".into(), "us-east1".into());
            })));

            // Missing header fails
            assert!(!route.matches(&req(|r| {
                r.headers.insert("x-tier".into(), "premium".into());
            })));

            // Wrong value fails
            assert!(!route.matches(&req(|r| {
                r.headers.insert("x-tier".into(), "basic".into());
                r.headers.insert("x-region".into(), "us-east1".into());
            })));
        }

        #[test]
        fn source_clauses() {
            let mut route = Route::new("default/sources", 1);
            route.source_tables.insert("orders".into());
            assert!(route.matches(&req(|r| r.source_table = "orders".into())));
            assert!(!route.matches(&req(|_| {})));

            let mut route = Route::new("default/ns", 1);
            route.source_namespaces.insert("prod".into());
            assert!(route.matches(&req(|r| r.source_namespace = "prod".into())));
            assert!(!route.matches(&req(|r| r.source_namespace = "dev".into())));
        }

        #[test]
        fn time_window_clause() {
            let mut route = Route::new("default/nightly", 1);
            route.time_window = Some(TimeWindow {
                start_minutes: 22 * 60,
                end_minutes: 6 * 60,
                days: HashSet::new(),
            });
            assert!(!route.matches(&req(|_| {})));
            assert!(route.matches(&req(|r| {
                r.timestamp = Utc.with_ymd_and_hms(2025, 6, 2, 23, 0, 0).unwrap();
            })));
        }

        #[test]
        fn match_counter_accumulates() {
            let route = Route::new("default/counted", 1);
            assert_eq!(route.matched_requests(), 0);
            assert!(route.last_match().is_none());

            let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
            route.record_match(now);
            route.record_match(now);
            assert_eq!(route.matched_requests(), 2);
            assert_eq!(route.last_match(), Some(now));
        }
    }
}
