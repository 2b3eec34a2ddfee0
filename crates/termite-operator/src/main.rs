//! Termite operator binary
//!
//! Runs the admission webhook and the TermitePool controller, with
//! optional Lease-based leader election for HA deployments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::CustomResourceExt;
use tracing::info;

use termite_common::crd::{TermitePool, TermiteRoute};
use termite_common::telemetry::{init_telemetry, TelemetryConfig};

use termite_operator::leader::LeaderElector;
use termite_operator::{controller, webhook};

/// Termite operator for inference worker pools and routes
#[derive(Parser, Debug)]
#[command(name = "termite-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Health bind port
    #[arg(long, default_value_t = termite_common::DEFAULT_OPERATOR_HEALTH_PORT)]
    health_port: u16,

    /// Admission webhook bind port
    #[arg(long, default_value_t = 9443)]
    webhook_port: u16,

    /// Directory containing tls.crt and tls.key for the webhook
    #[arg(long, default_value = "/etc/webhook/certs")]
    tls_cert_dir: PathBuf,

    /// Disable the admission webhook (admission falls back to CRD schema
    /// validation only)
    #[arg(long)]
    disable_webhook: bool,

    /// Enable HA leader election
    #[arg(long)]
    leader_elect: bool,

    /// Namespace holding the leader election lease
    #[arg(long, default_value = "termite-system")]
    lease_namespace: String,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    termite_common::install_crypto_provider();

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::for_service("termite-operator", cli.debug))?;

    let client = kube::Client::try_default().await?;

    // Health surface comes up before leader election so probes pass while
    // this replica waits for the lease.
    let health_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", cli.health_port)).await?;
    let health = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }));
    tokio::spawn(async move {
        let _ = axum::serve(health_listener, health).await;
    });

    let mut guard = None;
    if cli.leader_elect {
        let identity =
            std::env::var("POD_NAME").unwrap_or_else(|_| "termite-operator-local".to_string());
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &cli.lease_namespace,
            &identity,
        ));
        guard = Some(elector.acquire().await?);
    }

    let webhook_server = if cli.disable_webhook {
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.webhook_port));
        let cert_dir = cli.tls_cert_dir.clone();
        Some(tokio::spawn(async move {
            webhook::serve(addr, &cert_dir).await
        }))
    };

    info!(
        webhook = !cli.disable_webhook,
        leader_elect = cli.leader_elect,
        "termite operator started"
    );

    match (webhook_server, guard) {
        (Some(server), Some(mut guard)) => {
            tokio::select! {
                _ = controller::run(client) => {}
                result = server => { result??; }
                _ = guard.lost() => anyhow::bail!("leadership lost, exiting for a clean restart"),
            }
        }
        (Some(server), None) => {
            tokio::select! {
                _ = controller::run(client) => {}
                result = server => { result??; }
            }
        }
        (None, Some(mut guard)) => {
            tokio::select! {
                _ = controller::run(client) => {}
                _ = guard.lost() => anyhow::bail!("leadership lost, exiting for a clean restart"),
            }
        }
        (None, None) => controller::run(client).await,
    }

    Ok(())
}

/// Render both CRDs as a multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let pool = serde_yaml::to_string(&TermitePool::crd())?;
    let route = serde_yaml::to_string(&TermiteRoute::crd())?;
    Ok(format!("{pool}---\n{route}"))
}
