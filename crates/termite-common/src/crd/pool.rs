//! TermitePool CRD types
//!
//! A `TermitePool` declares a homogeneous group of inference workers.
//! The operator materializes each pool into a StatefulSet, a headless
//! Service, and (when the replica bounds allow scaling) an autoscaler.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Compute classes accepted under GKE Autopilot
pub const VALID_COMPUTE_CLASSES: &[&str] = &[
    "Accelerator",
    "Balanced",
    "Performance",
    "Scale-Out",
    "autopilot",
    "autopilot-spot",
];

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a TermitePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum PoolPhase {
    /// Pool is waiting for its workload to be created
    #[default]
    Pending,
    /// Workload exists but not all replicas are ready
    Provisioning,
    /// All desired replicas are serving
    Ready,
    /// Reconciliation has encountered an error
    Failed,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Spec components
// =============================================================================

/// Replica bounds for a pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PoolReplicas {
    /// Minimum replicas (also the StatefulSet's base replica count)
    #[serde(default)]
    pub min: i32,

    /// Maximum replicas the autoscaler may reach
    pub max: i32,
}

impl Default for PoolReplicas {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

/// Hardware selection for pool workers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSpec {
    /// Accelerator family (e.g., "nvidia-l4", "tpu-v5-lite-podslice").
    /// Maps to a node selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<String>,

    /// Accelerator topology string (e.g., "2x2x1" for TPU slices)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,

    /// Schedule workers on spot/preemptible capacity
    #[serde(default)]
    pub spot: bool,
}

/// GKE-specific managed-service hints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeSpec {
    /// Run on a GKE Autopilot cluster
    #[serde(default)]
    pub autopilot: bool,

    /// Autopilot compute class. One of: Accelerator, Balanced, Performance,
    /// Scale-Out, autopilot, autopilot-spot. Requires autopilot=true.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub autopilot_compute_class: String,
}

/// Resource requests and limits for the worker container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PoolResources {
    /// Resource requests (e.g., cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits (e.g., nvidia.com/gpu)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

// =============================================================================
// CRD
// =============================================================================

/// Worker pool specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "antfly.io",
    version = "v1alpha1",
    kind = "TermitePool",
    plural = "termitepools",
    shortname = "tpool",
    namespaced,
    status = "TermitePoolStatus",
    printcolumn = r#"{"name":"Min","type":"integer","jsonPath":".spec.replicas.min"}"#,
    printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.replicas.max"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TermitePoolSpec {
    /// Replica bounds
    #[serde(default)]
    pub replicas: PoolReplicas,

    /// Hardware selection
    #[serde(default)]
    pub hardware: HardwareSpec,

    /// GKE managed-service hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gke: Option<GkeSpec>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PoolResources>,

    /// Models preloaded on this pool's workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Coarse workload tag propagated to pod labels (e.g., read-heavy, burst)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_type: Option<String>,
}

/// Status of a TermitePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TermitePoolStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Number of replicas currently serving
    #[serde(default)]
    pub ready_replicas: i32,

    /// Models reported loaded across the pool's workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded_models: Vec<String>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Latest observed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// =============================================================================
// Validation
// =============================================================================

impl TermitePoolSpec {
    /// Validate the pool spec for admission.
    ///
    /// Collects every violated rule into one line-separated message so the
    /// user sees the full picture in a single apply.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if let Err(e) = self.validate_replicas() {
            errors.push(e);
        }
        if let Err(e) = self.validate_gke() {
            errors.push(e);
        }
        if let Err(e) = self.validate_no_conflicting_settings() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "TermitePool validation failed:\n  - {}",
                errors.join("\n  - ")
            ))
        }
    }

    /// Validate that immutable fields have not changed relative to `old`.
    ///
    /// Autopilot mode and (under autopilot) the compute class require pod
    /// recreation to change, so updates must delete and recreate instead.
    pub fn validate_update(&self, old: &TermitePoolSpec) -> Result<(), String> {
        let mut errors = Vec::new();

        if let (Some(new_gke), Some(old_gke)) = (&self.gke, &old.gke) {
            if new_gke.autopilot != old_gke.autopilot {
                errors.push(format!(
                    "field 'spec.gke.autopilot' is immutable after deployment \
                     (current: {}, attempted: {}); delete and recreate the pool to change it",
                    old_gke.autopilot, new_gke.autopilot
                ));
            }
            if new_gke.autopilot
                && new_gke.autopilot_compute_class != old_gke.autopilot_compute_class
            {
                errors.push(format!(
                    "field 'spec.gke.autopilotComputeClass' is immutable after deployment \
                     (current: '{}', attempted: '{}'); delete and recreate the pool to change it",
                    old_gke.autopilot_compute_class, new_gke.autopilot_compute_class
                ));
            }
        }

        if self.gke.is_none() {
            if let Some(old_gke) = &old.gke {
                if old_gke.autopilot {
                    errors.push(
                        "cannot remove spec.gke after deployment when autopilot was enabled; \
                         delete and recreate the pool to change scheduling behavior"
                            .to_string(),
                    );
                }
            }
        }

        if errors.is_empty() {
            self.validate()
        } else {
            Err(format!(
                "TermitePool validation failed:\n  - {}",
                errors.join("\n  - ")
            ))
        }
    }

    fn validate_replicas(&self) -> Result<(), String> {
        if self.replicas.min < 0 {
            return Err(format!(
                "spec.replicas.min must be >= 0, got {}",
                self.replicas.min
            ));
        }
        if self.replicas.max <= 0 {
            return Err(format!(
                "spec.replicas.max must be > 0, got {}",
                self.replicas.max
            ));
        }
        if self.replicas.min > self.replicas.max {
            return Err(format!(
                "spec.replicas.min ({}) cannot be greater than spec.replicas.max ({})",
                self.replicas.min, self.replicas.max
            ));
        }
        Ok(())
    }

    fn validate_gke(&self) -> Result<(), String> {
        let Some(gke) = &self.gke else {
            return Ok(());
        };

        if !gke.autopilot_compute_class.is_empty()
            && !VALID_COMPUTE_CLASSES.contains(&gke.autopilot_compute_class.as_str())
        {
            return Err(format!(
                "invalid GKE Autopilot compute class '{}'. Must be one of: {}",
                gke.autopilot_compute_class,
                VALID_COMPUTE_CLASSES.join(", ")
            ));
        }

        if !gke.autopilot_compute_class.is_empty() && !gke.autopilot {
            return Err(
                "spec.gke.autopilotComputeClass is set but spec.gke.autopilot=false; \
                 compute classes only work on Autopilot clusters. Either set \
                 spec.gke.autopilot=true or remove the compute class and use \
                 spec.hardware.spot instead"
                    .to_string(),
            );
        }

        // TPU workloads must not use the Accelerator class; TPU provisioning
        // goes through node selectors.
        if gke.autopilot_compute_class == "Accelerator" && !self.has_gpu_limit() {
            return Err(
                "the Accelerator compute class requires GPU resources: add a \
                 'nvidia.com/gpu' or 'cloud.google.com/gke-gpu' limit to \
                 spec.resources.limits. TPU workloads must not use 'Accelerator'; \
                 they use node selectors via spec.hardware"
                    .to_string(),
            );
        }

        Ok(())
    }

    fn validate_no_conflicting_settings(&self) -> Result<(), String> {
        let autopilot = self.gke.as_ref().map(|g| g.autopilot).unwrap_or(false);
        if autopilot && self.hardware.spot {
            return Err(
                "spec.hardware.spot=true conflicts with spec.gke.autopilot=true; \
                 Autopilot schedules spot capacity through compute classes. Remove \
                 'hardware.spot' and set gke.autopilotComputeClass: 'autopilot-spot'"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Whether a GPU limit is present in spec.resources
    pub fn has_gpu_limit(&self) -> bool {
        self.resources
            .as_ref()
            .map(|r| {
                r.limits.contains_key("nvidia.com/gpu")
                    || r.limits.contains_key("cloud.google.com/gke-gpu")
            })
            .unwrap_or(false)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(f: impl FnOnce(&mut TermitePoolSpec)) -> TermitePoolSpec {
        let mut spec = TermitePoolSpec {
            replicas: PoolReplicas { min: 1, max: 3 },
            ..Default::default()
        };
        f(&mut spec);
        spec
    }

    #[test]
    fn minimal_pool_is_valid() {
        assert!(pool(|_| {}).validate().is_ok());
    }

    #[test]
    fn replica_bounds_enforced() {
        let err = pool(|p| p.replicas = PoolReplicas { min: -1, max: 3 })
            .validate()
            .unwrap_err();
        assert!(err.contains("min must be >= 0"));

        let err = pool(|p| p.replicas = PoolReplicas { min: 0, max: 0 })
            .validate()
            .unwrap_err();
        assert!(err.contains("max must be > 0"));

        let err = pool(|p| p.replicas = PoolReplicas { min: 5, max: 3 })
            .validate()
            .unwrap_err();
        assert!(err.contains("cannot be greater than"));
    }

    #[test]
    fn unknown_compute_class_rejected_with_valid_values() {
        let err = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Turbo".into(),
            })
        })
        .validate()
        .unwrap_err();
        assert!(err.contains("invalid GKE Autopilot compute class 'Turbo'"));
        assert!(err.contains("Balanced"));
        assert!(err.contains("autopilot-spot"));
    }

    #[test]
    fn compute_class_requires_autopilot() {
        let err = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: false,
                autopilot_compute_class: "Balanced".into(),
            })
        })
        .validate()
        .unwrap_err();
        assert!(err.contains("spec.gke.autopilot=false"));
    }

    #[test]
    fn accelerator_class_requires_gpu_limit() {
        let err = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Accelerator".into(),
            })
        })
        .validate()
        .unwrap_err();
        assert!(err.contains("Accelerator compute class requires GPU"));
    }

    #[test]
    fn accelerator_class_with_gpu_limit_is_valid() {
        let spec = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Accelerator".into(),
            });
            p.resources = Some(PoolResources {
                limits: BTreeMap::from([("nvidia.com/gpu".to_string(), "1".to_string())]),
                ..Default::default()
            });
        });
        assert!(spec.validate().is_ok());
        assert!(spec.has_gpu_limit());
    }

    #[test]
    fn tpu_limit_does_not_count_as_gpu() {
        let spec = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Accelerator".into(),
            });
            p.resources = Some(PoolResources {
                limits: BTreeMap::from([("google.com/tpu".to_string(), "4".to_string())]),
                ..Default::default()
            });
        });
        assert!(!spec.has_gpu_limit());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spot_conflicts_with_autopilot() {
        let err = pool(|p| {
            p.hardware.spot = true;
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: String::new(),
            });
        })
        .validate()
        .unwrap_err();
        assert!(err.contains("spec.hardware.spot"));
        assert!(err.contains("spec.gke.autopilot"));
        assert!(err.contains("autopilot-spot"));
    }

    #[test]
    fn spot_without_autopilot_is_fine() {
        assert!(pool(|p| p.hardware.spot = true).validate().is_ok());
    }

    #[test]
    fn multiple_violations_all_reported() {
        let err = pool(|p| {
            p.replicas = PoolReplicas { min: 5, max: 3 };
            p.hardware.spot = true;
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Warp".into(),
            });
        })
        .validate()
        .unwrap_err();
        assert!(err.contains("cannot be greater than"));
        assert!(err.contains("invalid GKE Autopilot compute class"));
        assert!(err.contains("hardware.spot"));
        assert_eq!(err.matches("\n  - ").count(), 3);
    }

    #[test]
    fn autopilot_is_immutable() {
        let old = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Balanced".into(),
            })
        });
        let new = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: false,
                autopilot_compute_class: String::new(),
            })
        });
        let err = new.validate_update(&old).unwrap_err();
        assert!(err.contains("spec.gke.autopilot' is immutable"));
    }

    #[test]
    fn compute_class_immutable_under_autopilot() {
        let old = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Balanced".into(),
            })
        });
        let new = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: "Performance".into(),
            })
        });
        let err = new.validate_update(&old).unwrap_err();
        assert!(err.contains("autopilotComputeClass' is immutable"));
    }

    #[test]
    fn removing_gke_block_after_autopilot_rejected() {
        let old = pool(|p| {
            p.gke = Some(GkeSpec {
                autopilot: true,
                autopilot_compute_class: String::new(),
            })
        });
        let new = pool(|_| {});
        let err = new.validate_update(&old).unwrap_err();
        assert!(err.contains("cannot remove spec.gke"));
    }

    #[test]
    fn update_without_gke_changes_revalidates_spec() {
        let old = pool(|_| {});
        let new = pool(|p| p.replicas = PoolReplicas { min: 0, max: 0 });
        assert!(new.validate_update(&old).is_err());
    }

    #[test]
    fn pool_phase_display() {
        assert_eq!(PoolPhase::Pending.to_string(), "Pending");
        assert_eq!(PoolPhase::Provisioning.to_string(), "Provisioning");
        assert_eq!(PoolPhase::Ready.to_string(), "Ready");
        assert_eq!(PoolPhase::Failed.to_string(), "Failed");
    }
}
