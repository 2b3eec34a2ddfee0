//! TermitePool controller
//!
//! Reconciles each pool toward its materialized form via server-side apply
//! and reports readiness back into the pool's status. Edge-triggered by
//! pool and StatefulSet events, level-driven by a periodic requeue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, instrument, warn};

use termite_common::crd::{
    Condition, ConditionStatus, PoolPhase, TermitePool, TermitePoolStatus, TermiteRoute,
    TermiteRouteStatus,
};
use termite_common::{metrics, ReconcileError};

use crate::manifests;

/// Field manager for all operator-applied resources
const FIELD_MANAGER: &str = "termite-operator";

/// Shared context for the pool controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
}

/// Reconcile one TermitePool
#[instrument(skip(pool, ctx), fields(pool = %pool.name_any()))]
pub async fn reconcile(pool: Arc<TermitePool>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let started = std::time::Instant::now();
    let name = pool.name_any();
    let namespace = pool
        .namespace()
        .ok_or_else(|| ReconcileError::Validation("TermitePool missing namespace".into()))?;

    // Admission already validated, but resources created before the webhook
    // was installed can still be invalid.
    if let Err(e) = pool.spec.validate() {
        warn!(error = %e, "pool spec failed validation");
        patch_status(&ctx.client, &name, &namespace, status_failed(&pool, &e)).await?;
        return Ok(Action::await_change());
    }

    apply_children(&ctx.client, &pool, &namespace).await?;

    let status = observe_status(&ctx.client, &pool, &namespace).await?;
    let phase = status.phase.clone();
    patch_status(&ctx.client, &name, &namespace, status).await?;

    metrics::RECONCILE_DURATION.record(
        started.elapsed().as_secs_f64(),
        &[
            KeyValue::new("pool", name.clone()),
            KeyValue::new("result", "success"),
        ],
    );
    debug!(%phase, "pool reconciled");

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Error policy: surface the error and retry with a fixed backoff
pub fn error_policy(pool: Arc<TermitePool>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS.add(1, &[KeyValue::new("pool", pool.name_any())]);
    error!(pool = %pool.name_any(), ?error, "pool reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

/// Apply the pool's child resources via server-side apply. The HPA and PDB
/// are deleted when the spec no longer calls for them.
async fn apply_children(
    client: &Client,
    pool: &TermitePool,
    namespace: &str,
) -> Result<(), ReconcileError> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let name = manifests::resource_name(pool);

    let statefulset = manifests::build_statefulset(pool);
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    api.patch(&name, &params, &Patch::Apply(&statefulset))
        .await
        .map_err(|e| ReconcileError::Kube(format!("apply StatefulSet {name}: {e}")))?;

    let service = manifests::build_service(pool);
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    api.patch(&name, &params, &Patch::Apply(&service))
        .await
        .map_err(|e| ReconcileError::Kube(format!("apply Service {name}: {e}")))?;

    let api: Api<HorizontalPodAutoscaler> = Api::namespaced(client.clone(), namespace);
    match manifests::build_hpa(pool) {
        Some(hpa) => {
            api.patch(&name, &params, &Patch::Apply(&hpa))
                .await
                .map_err(|e| ReconcileError::Kube(format!("apply HPA {name}: {e}")))?;
        }
        None => delete_ignoring_missing(&api, &name, "HPA").await?,
    }

    let api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    match manifests::build_pdb(pool) {
        Some(pdb) => {
            api.patch(&name, &params, &Patch::Apply(&pdb))
                .await
                .map_err(|e| ReconcileError::Kube(format!("apply PDB {name}: {e}")))?;
        }
        None => delete_ignoring_missing(&api, &name, "PDB").await?,
    }

    debug!(pool = %pool.name_any(), "applied child resources");
    Ok(())
}

async fn delete_ignoring_missing<K>(
    api: &Api<K>,
    name: &str,
    kind: &str,
) -> Result<(), ReconcileError>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(%name, kind, "deleted child no longer in desired state");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(ReconcileError::Kube(format!("delete {kind} {name}: {e}"))),
    }
}

/// Read child state and compute the pool's status
async fn observe_status(
    client: &Client,
    pool: &TermitePool,
    namespace: &str,
) -> Result<TermitePoolStatus, ReconcileError> {
    let name = manifests::resource_name(pool);
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);

    let ready_replicas = match api.get_opt(&name).await {
        Ok(Some(sts)) => sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        Ok(None) => 0,
        Err(e) => return Err(ReconcileError::Kube(format!("get StatefulSet {name}: {e}"))),
    };

    let desired = pool.spec.replicas.min.max(0);
    let (phase, reason, message) = if desired == 0 {
        (
            PoolPhase::Ready,
            "ScaledToZero",
            "pool is scaled to zero".to_string(),
        )
    } else if ready_replicas >= desired {
        (
            PoolPhase::Ready,
            "AllReplicasReady",
            format!("{ready_replicas}/{desired} replicas ready"),
        )
    } else {
        (
            PoolPhase::Provisioning,
            "WaitingForReplicas",
            format!("{ready_replicas}/{desired} replicas ready"),
        )
    };

    let condition_status = if phase == PoolPhase::Ready {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };

    Ok(TermitePoolStatus {
        phase,
        ready_replicas,
        loaded_models: pool.spec.models.clone(),
        message: Some(message.clone()),
        conditions: vec![Condition::new("Ready", condition_status, reason, message)],
        observed_generation: pool.metadata.generation,
    })
}

fn status_failed(pool: &TermitePool, message: &str) -> TermitePoolStatus {
    TermitePoolStatus {
        phase: PoolPhase::Failed,
        ready_replicas: 0,
        loaded_models: Vec::new(),
        message: Some(message.to_string()),
        conditions: vec![Condition::new(
            "Ready",
            ConditionStatus::False,
            "ValidationFailed",
            message,
        )],
        observed_generation: pool.metadata.generation,
    }
}

async fn patch_status(
    client: &Client,
    name: &str,
    namespace: &str,
    status: TermitePoolStatus,
) -> Result<(), ReconcileError> {
    let api: Api<TermitePool> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });

    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| ReconcileError::Kube(format!("patch status: {e}")))?;

    Ok(())
}

// =============================================================================
// Route status reconciliation
// =============================================================================

/// Reconcile one TermiteRoute: re-validate and keep the Active status
/// column truthful. The proxy owns the live route table; this controller
/// only reports whether the spec is servable.
#[instrument(skip(route, ctx), fields(route = %route.name_any()))]
pub async fn reconcile_route(
    route: Arc<TermiteRoute>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = route.name_any();
    let namespace = route
        .namespace()
        .ok_or_else(|| ReconcileError::Validation("TermiteRoute missing namespace".into()))?;

    let (active, condition) = match route.spec.validate() {
        Ok(()) => (
            true,
            Condition::new(
                "Ready",
                ConditionStatus::True,
                "RouteCompiled",
                "route is live in the proxy route table",
            ),
        ),
        Err(e) => (
            false,
            Condition::new("Ready", ConditionStatus::False, "ValidationFailed", e),
        ),
    };

    // Status patches bump resourceVersion and would re-trigger this
    // controller, so skip when nothing changed.
    if route.status.as_ref().map(|s| s.active) == Some(active) {
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    let status = TermiteRouteStatus {
        active,
        conditions: vec![condition],
        ..route.status.clone().unwrap_or_default()
    };

    let api: Api<TermiteRoute> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await
    .map_err(|e| ReconcileError::Kube(format!("patch route status: {e}")))?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Error policy for route reconciliation
pub fn route_error_policy(
    route: Arc<TermiteRoute>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(route = %route.name_any(), ?error, "route reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

// =============================================================================
// Runner
// =============================================================================

/// Run both controllers until shutdown
pub async fn run(client: Client) {
    let pools: Api<TermitePool> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client.clone());
    let routes: Api<TermiteRoute> = Api::all(client.clone());
    let ctx = Arc::new(Context { client });

    info!("starting TermitePool controller");
    let pool_controller = Controller::new(pools, WatcherConfig::default())
        .owns(statefulsets, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "pool reconciliation completed"),
                Err(e) => error!(error = ?e, "pool reconciliation error"),
            }
        });

    info!("starting TermiteRoute controller");
    let route_controller = Controller::new(routes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_route, route_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "route reconciliation completed"),
                Err(e) => error!(error = ?e, "route reconciliation error"),
            }
        });

    tokio::join!(pool_controller, route_controller);
}

// =============================================================================
// Tests
// =============================================================================
