//! Termite operator
//!
//! Admits and reconciles the two Termite custom resources. Admission is an
//! axum webhook validating `TermitePool` and `TermiteRoute` specs (including
//! cross-field and immutability rules); reconciliation drives each pool
//! toward its materialized form: a StatefulSet, a headless Service, and
//! optional autoscaler and disruption budget.

pub mod controller;
pub mod leader;
pub mod manifests;
pub mod webhook;
