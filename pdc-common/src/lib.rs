//! Shared types and utilities for the Progressive Delivery Controller.
//!
//! This crate holds everything both the daemon (`pdcd`) and the operator
//! CLI (`pdc`) need to agree on: the canary data model, the HTTP API
//! payloads, the error taxonomy, daemon configuration, and the rollback
//! hook capability interface.

pub mod api;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod types;

pub use errors::ControlError;
pub use types::{
    CanaryConfig, CanaryPhase, DeploymentVersion, MatchPredicate, MetricsSnapshot, RollbackCriteria,
    RollbackReason, RollbackStrategy, RolloutStatus, RouteContext, RouteStrategy, RouterStats,
    SuccessCriteria, TrafficRule, VersionId, TARGET_BASELINE, TARGET_CANARY,
};
