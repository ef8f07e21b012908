//! Prometheus metrics for the daemon.
//!
//! Exported via the HTTP `/metrics` endpoint. These are operational
//! counters for the daemon itself; rollout decisions read the per-target
//! accumulators in [`crate::telemetry`], never these.

use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounterVec, IntGauge, Registry, TextEncoder,
    register_int_counter_vec_with_registry, register_int_gauge_with_registry,
};

lazy_static! {
    /// Dedicated registry so tests never collide with the global default.
    pub static ref REGISTRY: Registry = Registry::new();

    static ref ROUTED_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "pdc_routed_requests_total",
        "Requests routed, labeled by selected target.",
        &["target"],
        REGISTRY
    )
    .expect("register pdc_routed_requests_total");

    static ref REQUEST_OUTCOMES: IntCounterVec = register_int_counter_vec_with_registry!(
        "pdc_request_outcomes_total",
        "Request outcomes recorded, labeled by target and result.",
        &["target", "outcome"],
        REGISTRY
    )
    .expect("register pdc_request_outcomes_total");

    static ref ROLLOUT_TRANSITIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "pdc_rollouts_total",
        "Rollout lifecycle transitions, labeled by outcome.",
        &["outcome"],
        REGISTRY
    )
    .expect("register pdc_rollouts_total");

    static ref CANARY_WEIGHT: IntGauge = register_int_gauge_with_registry!(
        "pdc_canary_weight",
        "Current canary traffic weight (0-100).",
        REGISTRY
    )
    .expect("register pdc_canary_weight");
}

/// Count a routing decision.
pub fn record_route(target: &str) {
    ROUTED_REQUESTS.with_label_values(&[target]).inc();
}

/// Count a recorded request outcome.
pub fn record_outcome(target: &str, success: bool) {
    let outcome = if success { "success" } else { "error" };
    REQUEST_OUTCOMES.with_label_values(&[target, outcome]).inc();
}

/// Count a rollout lifecycle transition (started/completed/rolled_back).
pub fn rollout_transition(outcome: &str) {
    ROLLOUT_TRANSITIONS.with_label_values(&[outcome]).inc();
}

/// Publish the current canary weight.
pub fn set_canary_weight(weight: u8) {
    CANARY_WEIGHT.set(i64::from(weight));
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
