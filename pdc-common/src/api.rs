//! Request/response payloads for the daemon's HTTP API.
//!
//! Shared between `pdcd` handlers and the `pdc` CLI so both sides agree
//! on the wire shape.

use crate::types::{
    CanaryConfig, CanaryPhase, DeploymentVersion, RollbackReason, RouteContext, VersionId,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /rollouts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRolloutRequest {
    pub config: CanaryConfig,
    /// Full record for the target version; synthesized from the config
    /// when omitted.
    #[serde(default)]
    pub target: Option<DeploymentVersion>,
}

/// Body of `POST /rollouts/{name}/rollback`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// Defaults to `manual` when omitted.
    #[serde(default)]
    pub reason: Option<RollbackReason>,
}

/// Response for a completed rollback command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResponse {
    pub rolled_back_to: VersionId,
}

/// Acknowledgement for start/promote/stop commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutAck {
    pub name: String,
    pub phase: CanaryPhase,
    pub weight: u8,
}

/// Body of `POST /route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub context: RouteContext,
}

/// Response of `POST /route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub target: String,
}

/// Body of `POST /record` — one request outcome, keyed by the routed target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    pub target: String,
    pub success: bool,
    pub latency_ms: f64,
}

/// Body for whitelist/blacklist mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub user_id: String,
}

/// Error envelope returned for non-2xx control responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_target_is_optional() {
        let json = r#"{
            "config": {
                "name": "checkout",
                "target_version": "v2",
                "baseline_version": "v1"
            }
        }"#;
        let req: StartRolloutRequest = serde_json::from_str(json).unwrap();
        assert!(req.target.is_none());
        assert_eq!(req.config.phases, vec![1, 5, 10, 25, 50, 75, 100]);
    }

    #[test]
    fn rollback_request_defaults_reason_to_none() {
        let req: RollbackRequest = serde_json::from_str("{}").unwrap();
        assert!(req.reason.is_none());

        let req: RollbackRequest =
            serde_json::from_str(r#"{"reason": "high_error_rate"}"#).unwrap();
        assert_eq!(req.reason, Some(RollbackReason::HighErrorRate));
    }
}
