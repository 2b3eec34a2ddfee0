//! Desired-state manifest builders
//!
//! Computes the child resources for a `TermitePool` deterministically from
//! its spec: a StatefulSet running the worker image, a headless Service
//! whose EndpointSlices the proxy watches, an HPA when the replica bounds
//! allow scaling, and a PodDisruptionBudget for multi-replica pools.
//!
//! Builders are pure so reconciliation diffs stay stable across runs.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
    MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use termite_common::crd::TermitePool;
use termite_common::{
    APP_NAME, DEFAULT_WORKER_PORT, MANAGED_BY_LABEL, MANAGED_BY_OPERATOR, MODELS_ANNOTATION,
    NAME_LABEL, POOL_LABEL, POOL_RESOURCE_PREFIX, WORKLOAD_TYPE_LABEL,
};

/// Worker image run by every pool
pub const WORKER_IMAGE: &str = "ghcr.io/antflydb/termite:latest";

/// GKE node selector key for accelerator families
const GKE_ACCELERATOR_KEY: &str = "cloud.google.com/gke-accelerator";
/// GKE node selector key for TPU topologies
const GKE_TPU_TOPOLOGY_KEY: &str = "cloud.google.com/gke-tpu-topology";
/// GKE node selector key for spot capacity
const GKE_SPOT_KEY: &str = "cloud.google.com/gke-spot";
/// GKE node selector key for Autopilot compute classes
const GKE_COMPUTE_CLASS_KEY: &str = "cloud.google.com/compute-class";

/// Name of the child resources owned by a pool (`termite-<pool>`)
pub fn resource_name(pool: &TermitePool) -> String {
    format!("{}{}", POOL_RESOURCE_PREFIX, pool.name_any())
}

/// Controller owner reference so child resources are garbage-collected
/// with their pool and child events requeue the owner
fn owner_references(pool: &TermitePool) -> Option<Vec<OwnerReference>> {
    pool.controller_owner_ref(&()).map(|r| vec![r])
}

/// Shared child metadata: name, namespace, labels, owner reference
fn child_metadata(pool: &TermitePool) -> ObjectMeta {
    ObjectMeta {
        name: Some(resource_name(pool)),
        namespace: pool.metadata.namespace.clone(),
        labels: Some(pool_labels(pool)),
        owner_references: owner_references(pool),
        ..Default::default()
    }
}

/// Labels stamped on every child resource of a pool
pub fn pool_labels(pool: &TermitePool) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(NAME_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_OPERATOR.to_string());
    labels.insert(POOL_LABEL.to_string(), pool.name_any());
    if let Some(workload_type) = &pool.spec.workload_type {
        labels.insert(WORKLOAD_TYPE_LABEL.to_string(), workload_type.clone());
    }
    labels
}

/// Selector labels: the stable subset that identifies a pool's pods
fn selector_labels(pool: &TermitePool) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), APP_NAME.to_string()),
        (POOL_LABEL.to_string(), pool.name_any()),
    ])
}

/// Node selector derived from hardware and managed-service hints
pub fn node_selector(pool: &TermitePool) -> Option<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();

    if let Some(accelerator) = &pool.spec.hardware.accelerator {
        selector.insert(GKE_ACCELERATOR_KEY.to_string(), accelerator.clone());
    }
    if let Some(topology) = &pool.spec.hardware.topology {
        selector.insert(GKE_TPU_TOPOLOGY_KEY.to_string(), topology.clone());
    }
    if pool.spec.hardware.spot {
        selector.insert(GKE_SPOT_KEY.to_string(), "true".to_string());
    }
    if let Some(gke) = &pool.spec.gke {
        if gke.autopilot && !gke.autopilot_compute_class.is_empty() {
            selector.insert(
                GKE_COMPUTE_CLASS_KEY.to_string(),
                gke.autopilot_compute_class.clone(),
            );
        }
    }

    if selector.is_empty() {
        None
    } else {
        Some(selector)
    }
}

fn container_resources(pool: &TermitePool) -> Option<ResourceRequirements> {
    let resources = pool.spec.resources.as_ref()?;
    let to_quantities = |m: &BTreeMap<String, String>| -> Option<BTreeMap<String, Quantity>> {
        if m.is_empty() {
            None
        } else {
            Some(
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect(),
            )
        }
    };

    Some(ResourceRequirements {
        requests: to_quantities(&resources.requests),
        limits: to_quantities(&resources.limits),
        ..Default::default()
    })
}

/// Build the StatefulSet for a pool.
///
/// Replicas start at the spec minimum; the HPA (when present) owns scaling
/// above it. Pod annotations carry the preloaded model inventory so the
/// proxy's pod watcher can populate its registry.
pub fn build_statefulset(pool: &TermitePool) -> StatefulSet {
    let name = resource_name(pool);
    let labels = pool_labels(pool);

    let mut annotations = BTreeMap::new();
    if !pool.spec.models.is_empty() {
        annotations.insert(MODELS_ANNOTATION.to_string(), pool.spec.models.join(","));
    }

    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(WORKER_IMAGE.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: DEFAULT_WORKER_PORT as i32,
            ..Default::default()
        }]),
        resources: container_resources(pool),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::String("http".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: child_metadata(pool),
        spec: Some(StatefulSetSpec {
            replicas: Some(pool.spec.replicas.min.max(0)),
            service_name: name,
            selector: LabelSelector {
                match_labels: Some(selector_labels(pool)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: if annotations.is_empty() {
                        None
                    } else {
                        Some(annotations)
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: node_selector(pool),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the headless Service for a pool.
///
/// The Service carries the pool label, which EndpointSlice mirroring copies
/// onto the slices the proxy watches.
pub fn build_service(pool: &TermitePool) -> Service {
    Service {
        metadata: child_metadata(pool),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(pool)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: DEFAULT_WORKER_PORT as i32,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the HPA for a pool, or None when the bounds leave no room to scale
pub fn build_hpa(pool: &TermitePool) -> Option<HorizontalPodAutoscaler> {
    if pool.spec.replicas.max <= pool.spec.replicas.min {
        return None;
    }

    Some(HorizontalPodAutoscaler {
        metadata: child_metadata(pool),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "StatefulSet".to_string(),
                name: resource_name(pool),
            },
            min_replicas: Some(pool.spec.replicas.min.max(1)),
            max_replicas: pool.spec.replicas.max,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(80),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the PodDisruptionBudget for a pool, or None for single-replica
/// pools (where a budget would deadlock node drains)
pub fn build_pdb(pool: &TermitePool) -> Option<PodDisruptionBudget> {
    if pool.spec.replicas.min <= 1 {
        return None;
    }

    Some(PodDisruptionBudget {
        metadata: child_metadata(pool),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(pool.spec.replicas.min - 1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(pool)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

// =============================================================================
// Tests
// =============================================================================
