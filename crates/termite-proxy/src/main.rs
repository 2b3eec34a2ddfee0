//! Termite proxy binary
//!
//! Runs the routing proxy: topology watchers feeding the endpoint registry
//! and route store, the dispatch pipeline, and the client-facing API.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use termite_common::telemetry::{init_telemetry, TelemetryConfig};

use termite_proxy::api::{api_router, health_router, AppState};
use termite_proxy::dispatch::Dispatcher;
use termite_proxy::watcher::TopologyWatcher;
use termite_proxy::{EndpointRegistry, ProxyConfig, RouteEngine, RouteStore};

/// Termite routing proxy for ML inference worker pools
#[derive(Parser, Debug)]
#[command(name = "termite-proxy", version, about, long_about = None)]
struct Cli {
    /// API bind address (default 0.0.0.0:11433)
    #[arg(long)]
    listen: Option<String>,

    /// Health bind port (default 4200)
    #[arg(long)]
    health_port: Option<u16>,

    /// Fallback pool when no route matches
    #[arg(long)]
    default_pool: Option<String>,

    /// Topology resync period in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Namespace scope for the topology watch (empty = cluster-wide)
    #[arg(long)]
    namespace: Option<String>,

    /// Pod label selector identifying worker pods
    #[arg(long)]
    selector: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::from_env();
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.health_port {
            config.health_port = port;
        }
        if let Some(pool) = self.default_pool {
            config.default_pool = pool;
        }
        if let Some(secs) = self.refresh_interval {
            config.refresh_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(selector) = self.selector {
            config.selector = selector;
        }
        if self.debug {
            config.debug = true;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    termite_common::install_crypto_provider();

    let config = Cli::parse().into_config();
    init_telemetry(TelemetryConfig::for_service("termite-proxy", config.debug))?;

    let client = kube::Client::try_default().await?;

    let registry = Arc::new(EndpointRegistry::new());
    let store = Arc::new(RouteStore::new());
    let engine = Arc::new(RouteEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        &config.default_pool,
    ));
    let dispatcher = Arc::new(Dispatcher::new(engine));

    let watcher = TopologyWatcher::new(
        client,
        Arc::clone(&registry),
        Arc::clone(&store),
        config.clone(),
    );
    tokio::spawn(watcher.run());

    let api_listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let health_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.health_port)).await?;

    info!(
        listen = %config.listen,
        health_port = config.health_port,
        default_pool = %config.default_pool,
        "termite proxy started"
    );

    let api = async {
        axum::serve(api_listener, api_router(AppState::new(dispatcher))).await
    };
    let health = async { axum::serve(health_listener, health_router()).await };

    tokio::select! {
        result = api => result?,
        result = health => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    Ok(())
}
