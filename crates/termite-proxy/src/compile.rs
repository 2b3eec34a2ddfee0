//! Route compilation
//!
//! Turns an admitted `TermiteRouteSpec` into a compiled [`Route`]. All
//! pattern, threshold, and time parsing happens here, once per config
//! change; a spec that fails to compile never reaches the store.

use std::collections::HashSet;
use std::sync::Arc;

use termite_common::crd::{
    parse_duration, parse_hhmm, RouteCondition, TermiteRouteSpec, TimeWindowMatch,
};
use termite_common::Error;

use crate::limiter::RateLimiter;
use crate::route::{
    compile_model_pattern, parse_threshold, Destination, Fallback, RetryPolicy, Route,
    StringMatcher, TimeWindow,
};

/// Compile a route spec into its hot-path form.
///
/// `namespace` and `name` form the route's fully-qualified identity used
/// for store upserts and removals.
pub fn compile_route(namespace: &str, name: &str, spec: &TermiteRouteSpec) -> Result<Route, Error> {
    let full_name = format!("{namespace}/{name}");
    let mut route = Route::new(&full_name, spec.priority);

    route.operations = spec.match_.operations.iter().copied().collect();

    for pattern in &spec.match_.models {
        let compiled = compile_model_pattern(pattern)
            .map_err(|e| Error::compile(&full_name, format!("model pattern '{pattern}': {e}")))?;
        route.model_patterns.push(compiled);
    }

    for (header, matcher) in &spec.match_.headers {
        let mut compiled = StringMatcher::default();
        if !matcher.exact.is_empty() {
            compiled.exact = Some(matcher.exact.clone());
        }
        if !matcher.prefix.is_empty() {
            compiled.prefix = Some(matcher.prefix.clone());
        }
        if !matcher.regex.is_empty() {
            let regex = regex::Regex::new(&matcher.regex).map_err(|e| {
                Error::compile(&full_name, format!("header '{header}' regex: {e}"))
            })?;
            compiled.regex = Some(regex);
        }
        route.header_matchers.insert(header.clone(), compiled);
    }

    if let Some(source) = &spec.match_.source {
        route.source_tables = source.tables.iter().cloned().collect();
        route.source_namespaces = source.namespaces.iter().cloned().collect();
        route.source_service_accounts = source.service_accounts.iter().cloned().collect();
    }

    if let Some(tw) = &spec.match_.time_window {
        route.time_window = Some(compile_time_window(&full_name, tw)?);
    }

    for dest in &spec.destinations {
        route
            .destinations
            .push(compile_destination(&full_name, dest)?);
    }

    if let Some(fb) = &spec.fallback {
        let max_queue_time = match &fb.max_queue_time {
            Some(s) => Some(
                parse_duration(s)
                    .map_err(|e| Error::compile(&full_name, format!("maxQueueTime: {e}")))?,
            ),
            None => None,
        };
        let err = fb.error_response.clone().unwrap_or_default();
        route.fallback = Some(Fallback {
            action: fb.action,
            max_queue_time,
            redirect_pool: fb.redirect_pool.clone(),
            status_code: err.status_code.clamp(100, 599) as u16,
            message: err.message,
            retry_after: err.retry_after.and_then(|v| u32::try_from(v).ok()),
        });
    }

    if let Some(rl) = &spec.rate_limiting {
        if rl.requests_per_second > 0 {
            let burst = rl.burst_size.unwrap_or(rl.requests_per_second);
            route.rate_limiter = Some(Arc::new(RateLimiter::new(
                rl.requests_per_second,
                burst,
                rl.per_model,
            )));
        }
    }

    if let Some(retry) = &spec.retry {
        route.retry = compile_retry(&full_name, retry)?;
    }

    Ok(route)
}

fn compile_destination(
    route_name: &str,
    dest: &termite_common::crd::RouteDestination,
) -> Result<Destination, Error> {
    let mut compiled = Destination {
        pool: dest.pool.clone(),
        weight: dest.weight,
        ..Default::default()
    };

    let Some(cond) = &dest.condition else {
        return Ok(compiled);
    };
    compile_condition(route_name, cond, &mut compiled)?;
    Ok(compiled)
}

fn compile_condition(
    route_name: &str,
    cond: &RouteCondition,
    dest: &mut Destination,
) -> Result<(), Error> {
    if !cond.queue_depth.is_empty() {
        dest.queue_depth = Some(
            parse_threshold(&cond.queue_depth)
                .map_err(|e| Error::compile(route_name, format!("queueDepth: {e}")))?,
        );
    }
    if !cond.available_replicas.is_empty() {
        dest.replicas = Some(
            parse_threshold(&cond.available_replicas)
                .map_err(|e| Error::compile(route_name, format!("availableReplicas: {e}")))?,
        );
    }
    if !cond.latency.is_empty() {
        dest.latency = Some(
            parse_threshold(&cond.latency)
                .map_err(|e| Error::compile(route_name, format!("latency: {e}")))?,
        );
    }
    dest.require_model_loaded = cond.model_loaded.unwrap_or(false);
    if let Some(tw) = &cond.time_of_day {
        dest.time = Some(compile_time_window(route_name, tw)?);
    }
    Ok(())
}

fn compile_time_window(route_name: &str, tw: &TimeWindowMatch) -> Result<TimeWindow, Error> {
    let (start_h, start_m) = parse_hhmm(&tw.start)
        .ok_or_else(|| Error::compile(route_name, format!("start time '{}'", tw.start)))?;
    let (end_h, end_m) = parse_hhmm(&tw.end)
        .ok_or_else(|| Error::compile(route_name, format!("end time '{}'", tw.end)))?;

    let days: HashSet<u32> = tw
        .days
        .iter()
        .filter(|d| (0..=6).contains(*d))
        .map(|d| *d as u32)
        .collect();

    Ok(TimeWindow {
        start_minutes: start_h * 60 + start_m,
        end_minutes: end_h * 60 + end_m,
        days,
    })
}

fn compile_retry(
    route_name: &str,
    retry: &termite_common::crd::RouteRetry,
) -> Result<RetryPolicy, Error> {
    let mut policy = RetryPolicy {
        attempts: retry.attempts.max(0) as u32,
        ..Default::default()
    };

    if let Some(timeout) = &retry.per_try_timeout {
        policy.per_try_timeout = Some(
            parse_duration(timeout)
                .map_err(|e| Error::compile(route_name, format!("perTryTimeout: {e}")))?,
        );
    }

    for kind in &retry.retry_on {
        match kind.as_str() {
            "5xx" => policy.statuses.extend(500..600),
            "retriable-4xx" => {
                policy.statuses.insert(409);
            }
            "resource-exhausted" => {
                policy.statuses.insert(429);
            }
            "connect-failure" | "refused-stream" => policy.on_connect_failure = true,
            "reset" => policy.on_reset = true,
            "deadline-exceeded" | "cancelled" => policy.on_timeout = true,
            other => {
                return Err(Error::compile(
                    route_name,
                    format!("unknown retry condition '{other}'"),
                ));
            }
        }
    }

    Ok(policy)
}

// =============================================================================
// Tests
// =============================================================================
