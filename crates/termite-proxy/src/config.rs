//! Proxy configuration
//!
//! All options have defaults suitable for in-cluster operation and can be
//! overridden by flags or `TERMITE_*` environment variables.

use std::time::Duration;

/// Configuration for the routing proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// API bind address
    pub listen: String,

    /// Health bind port
    pub health_port: u16,

    /// Fallback pool when no route matches
    pub default_pool: String,

    /// Topology cache resync period
    pub refresh_interval: Duration,

    /// Namespace scope for the topology watch (empty = cluster-wide)
    pub namespace: String,

    /// Pod label selector identifying worker pods
    pub selector: String,

    /// Verbose logging
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", termite_common::DEFAULT_WORKER_PORT),
            health_port: termite_common::DEFAULT_PROXY_HEALTH_PORT,
            default_pool: "default".to_string(),
            refresh_interval: Duration::from_secs(30),
            namespace: String::new(),
            selector: format!("{}={}", termite_common::NAME_LABEL, termite_common::APP_NAME),
            debug: false,
        }
    }
}

impl ProxyConfig {
    /// Apply `TERMITE_*` environment overrides on top of the defaults
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("TERMITE_LISTEN") {
            cfg.listen = v;
        }
        if let Ok(v) = std::env::var("TERMITE_HEALTH_PORT") {
            if let Ok(port) = v.parse() {
                cfg.health_port = port;
            }
        }
        if let Ok(v) = std::env::var("TERMITE_DEFAULT_POOL") {
            cfg.default_pool = v;
        }
        if let Ok(v) = std::env::var("TERMITE_REFRESH_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.refresh_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("TERMITE_NAMESPACE") {
            cfg.namespace = v;
        }
        if let Ok(v) = std::env::var("TERMITE_SELECTOR") {
            cfg.selector = v;
        }
        if let Ok(v) = std::env::var("TERMITE_DEBUG") {
            cfg.debug = v == "true" || v == "1";
        }
        cfg
    }
}
