//! Topology watcher
//!
//! Translates cluster topology events into registry and store mutations.
//! This is the sole writer of both structures: EndpointSlice and Pod
//! streams keep the endpoint registry current, and the TermiteRoute stream
//! keeps the route store current. No admission checks happen here; a
//! resource that reached the watcher already passed the webhook.
//!
//! All handlers are idempotent, so the periodic resync can replay the full
//! topology without side effects.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use termite_common::metrics;

use termite_common::crd::TermiteRoute;
use termite_common::{
    APP_NAME, DEFAULT_WORKER_PORT, MODELS_ANNOTATION, NAME_LABEL, POOL_LABEL,
    POOL_RESOURCE_PREFIX, WORKLOAD_TYPE_LABEL,
};

use crate::compile::compile_route;
use crate::config::ProxyConfig;
use crate::registry::EndpointRegistry;
use crate::store::RouteStore;

/// Label carrying the owning service name on EndpointSlices
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Watches cluster topology and route resources
pub struct TopologyWatcher {
    client: Client,
    registry: Arc<EndpointRegistry>,
    store: Arc<RouteStore>,
    config: ProxyConfig,
}

impl TopologyWatcher {
    /// Create a watcher over the given registry and store
    pub fn new(
        client: Client,
        registry: Arc<EndpointRegistry>,
        store: Arc<RouteStore>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            config,
        }
    }

    /// Run all watch loops until the process shuts down
    pub async fn run(self) {
        let slices = self.watch_endpoint_slices();
        let pods = self.watch_pods();
        let routes = self.watch_routes();
        let resync = self.resync_loop();

        tokio::select! {
            _ = slices => error!("endpoint slice watch exited"),
            _ = pods => error!("pod watch exited"),
            _ = routes => error!("route watch exited"),
            _ = resync => error!("resync loop exited"),
        }
    }

    fn slice_api(&self) -> Api<EndpointSlice> {
        if self.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        }
    }

    async fn watch_endpoint_slices(&self) {
        let api = self.slice_api();
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));

        info!(namespace = %self.config.namespace, "endpoint slice watcher started");
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(slice)) | Ok(Event::InitApply(slice)) => {
                    process_endpoint_slice(&self.registry, &slice);
                }
                Ok(Event::Delete(slice)) => {
                    remove_endpoint_slice(&self.registry, &slice);
                }
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => warn!(error = %e, "endpoint slice watch error"),
            }
        }
    }

    async fn watch_pods(&self) {
        let api: Api<Pod> = if self.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        };
        let wc = watcher::Config::default().labels(&self.config.selector);
        let mut stream = std::pin::pin!(watcher(api, wc));

        info!(selector = %self.config.selector, "pod watcher started");
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                    process_pod(&self.registry, &pod);
                }
                Ok(Event::Delete(pod)) => {
                    if let Some(address) = pod_address(&pod) {
                        self.registry.unregister(&address);
                    }
                }
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => warn!(error = %e, "pod watch error"),
            }
        }
    }

    async fn watch_routes(&self) {
        let api: Api<TermiteRoute> = if self.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        };
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));

        info!("route watcher started");
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(route)) | Ok(Event::InitApply(route)) => {
                    self.upsert_route(&route);
                }
                Ok(Event::Delete(route)) => {
                    let name = qualified_name(&route);
                    self.store.remove(&name);
                    info!(route = %name, "removed route");
                }
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => warn!(error = %e, "route watch error"),
            }
        }
    }

    fn upsert_route(&self, route: &TermiteRoute) {
        let namespace = route.namespace().unwrap_or_default();
        let name = route.name_any();
        match compile_route(&namespace, &name, &route.spec) {
            Ok(compiled) => {
                info!(
                    route = %compiled.name,
                    priority = compiled.priority,
                    "compiled route"
                );
                self.store.upsert(compiled);
            }
            // A compile failure keeps the previous version (if any) live
            Err(e) => error!(route = %name, error = %e, "failed to compile route"),
        }
    }

    /// Level-driven correction: periodically re-list endpoint slices so a
    /// missed watch event cannot leave the registry stale forever.
    async fn resync_loop(&self) {
        let api = self.slice_api();
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match api.list(&ListParams::default()).await {
                Ok(slices) => {
                    debug!(count = slices.items.len(), "resync pass");
                    for slice in &slices.items {
                        process_endpoint_slice(&self.registry, slice);
                    }
                }
                Err(e) => warn!(error = %e, "resync list failed"),
            }
            self.report_pool_gauges();
        }
    }

    /// Publish per-pool health gauges from the current registry state
    fn report_pool_gauges(&self) {
        for pool in self.registry.pools() {
            let endpoints = self.registry.endpoints_for_pool(&pool);
            let ready = endpoints.iter().filter(|e| e.ready).count() as i64;
            let depth: i64 = endpoints.iter().map(|e| e.queue_depth()).sum();
            metrics::HEALTHY_ENDPOINTS.record(ready, &[KeyValue::new("pool", pool.clone())]);
            metrics::POOL_QUEUE_DEPTH.record(depth, &[KeyValue::new("pool", pool)]);
        }
    }
}

fn qualified_name(route: &TermiteRoute) -> String {
    format!("{}/{}", route.namespace().unwrap_or_default(), route.name_any())
}

// =============================================================================
// EndpointSlice handling
// =============================================================================

/// Derive the pool name for a slice, or None when the slice does not belong
/// to a Termite service.
///
/// The pool comes from the `antfly.io/pool` label when present, otherwise
/// from the owning service's name with the `termite-` prefix stripped.
fn slice_pool(slice: &EndpointSlice) -> Option<String> {
    let labels = slice.metadata.labels.as_ref()?;
    let service_name = labels.get(SERVICE_NAME_LABEL).cloned().unwrap_or_default();

    let is_termite = service_name.starts_with(POOL_RESOURCE_PREFIX)
        || labels.get(NAME_LABEL).map(String::as_str) == Some(APP_NAME);
    if !is_termite {
        return None;
    }

    match labels.get(POOL_LABEL) {
        Some(pool) if !pool.is_empty() => Some(pool.clone()),
        _ => Some(
            service_name
                .strip_prefix(POOL_RESOURCE_PREFIX)
                .unwrap_or(&service_name)
                .to_string(),
        ),
    }
}

/// Serving port for a slice: the first port named `http` or `api`,
/// defaulting to the standard worker port.
fn slice_port(slice: &EndpointSlice) -> i32 {
    slice
        .ports
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|p| matches!(p.name.as_deref(), Some("http") | Some("api")))
        .and_then(|p| p.port)
        .unwrap_or(DEFAULT_WORKER_PORT as i32)
}

/// Register or unregister every address on a slice according to readiness
fn process_endpoint_slice(registry: &EndpointRegistry, slice: &EndpointSlice) {
    let Some(pool) = slice_pool(slice) else {
        return;
    };

    let workload_type = slice
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(WORKLOAD_TYPE_LABEL))
        .cloned()
        .unwrap_or_default();

    let port = slice_port(slice);

    for endpoint in &slice.endpoints {
        let ready = endpoint
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(false);

        for addr in &endpoint.addresses {
            let address = format!("http://{addr}:{port}");
            if ready {
                registry.register(&address, &pool, &workload_type);
            } else {
                registry.unregister(&address);
            }
        }
    }
}

/// Drop every address on a deleted slice
fn remove_endpoint_slice(registry: &EndpointRegistry, slice: &EndpointSlice) {
    let port = slice_port(slice);
    for endpoint in &slice.endpoints {
        for addr in &endpoint.addresses {
            registry.unregister(&format!("http://{addr}:{port}"));
        }
    }
}

// =============================================================================
// Pod handling
// =============================================================================

/// Serving address for a pod: pod IP plus the `termite` container's
/// `http`/`api` port, defaulting to the standard worker port.
fn pod_address(pod: &Pod) -> Option<String> {
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    if ip.is_empty() {
        return None;
    }

    let mut port = DEFAULT_WORKER_PORT as i32;
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            if container.name != APP_NAME {
                continue;
            }
            if let Some(ports) = &container.ports {
                if let Some(p) = ports
                    .iter()
                    .find(|p| matches!(p.name.as_deref(), Some("http") | Some("api")))
                {
                    port = p.container_port;
                }
            }
        }
    }

    Some(format!("http://{ip}:{port}"))
}

/// Whether a pod is Running with a true Ready condition
fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Supplementary pod-level registration: only ready, running pods with an
/// address are registered. The models annotation feeds the loaded-model
/// inventory.
fn process_pod(registry: &EndpointRegistry, pod: &Pod) {
    let Some(address) = pod_address(pod) else {
        return;
    };

    if !pod_ready(pod) {
        registry.unregister(&address);
        return;
    }

    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let pool = labels.get(POOL_LABEL).cloned().unwrap_or_default();
    let workload_type = labels.get(WORKLOAD_TYPE_LABEL).cloned().unwrap_or_default();

    registry.register(&address, &pool, &workload_type);

    if let Some(models) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MODELS_ANNOTATION))
    {
        registry.set_models(
            &address,
            models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
