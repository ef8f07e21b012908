//! Core data model for canary rollouts, traffic routing, and rollback.

use crate::errors::ControlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Well-known target name for the version under rollout.
pub const TARGET_CANARY: &str = "canary";

/// Well-known target name for the stable baseline version.
pub const TARGET_BASELINE: &str = "baseline";

/// Unique identifier for a deployed service version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(pub String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage of a canary rollout.
///
/// Each configured weight percentage gets its own `Canary(weight)` state;
/// the wire form is `canary_<weight>` (e.g. `canary_25`). `RolledBack` and
/// `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanaryPhase {
    /// Rollout created but not yet started.
    Pending,
    /// Rollout is setting up its first phase.
    Initializing,
    /// Canary receives the given percentage of traffic (1-99).
    Canary(u8),
    /// Canary receives all traffic, pending final confirmation.
    Full,
    /// Rollout was reverted.
    RolledBack,
    /// Rollout finished with the target version fully promoted.
    Completed,
}

impl CanaryPhase {
    /// Phase corresponding to a configured traffic weight.
    pub fn from_weight(weight: u8) -> Self {
        if weight >= 100 {
            Self::Full
        } else {
            Self::Canary(weight)
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Completed)
    }

    /// The traffic weight implied by this phase, if any.
    pub fn weight(&self) -> Option<u8> {
        match self {
            Self::Canary(w) => Some(*w),
            Self::Full => Some(100),
            _ => None,
        }
    }
}

impl std::fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Initializing => write!(f, "initializing"),
            Self::Canary(w) => write!(f, "canary_{}", w),
            Self::Full => write!(f, "full"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for CanaryPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "initializing" => Ok(Self::Initializing),
            "full" => Ok(Self::Full),
            "rolled_back" => Ok(Self::RolledBack),
            "completed" => Ok(Self::Completed),
            other => match other.strip_prefix("canary_") {
                Some(w) => w
                    .parse::<u8>()
                    .map(Self::Canary)
                    .map_err(|_| format!("invalid canary weight in phase `{}`", other)),
                None => Err(format!("unknown canary phase `{}`", other)),
            },
        }
    }
}

impl Serialize for CanaryPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanaryPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Criteria that must ALL hold for a phase to be promoted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Minimum canary requests observed in the current phase.
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,
    /// Maximum tolerated canary error rate (0.0-1.0).
    #[serde(default = "default_success_error_rate")]
    pub max_error_rate: f64,
    /// Maximum tolerated canary P95 latency in milliseconds.
    #[serde(default = "default_success_p95_ms")]
    pub max_p95_latency_ms: f64,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_requests: default_min_requests(),
            max_error_rate: default_success_error_rate(),
            max_p95_latency_ms: default_success_p95_ms(),
        }
    }
}

/// Criteria where a SINGLE violation triggers rollback.
///
/// Bounds are looser than [`SuccessCriteria`]; the region between the two
/// is a hold zone where the phase neither promotes nor reverts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RollbackCriteria {
    /// Canary error rate above which the rollout is reverted.
    #[serde(default = "default_rollback_error_rate")]
    pub max_error_rate: f64,
    /// Canary P95 latency (ms) above which the rollout is reverted.
    #[serde(default = "default_rollback_p95_ms")]
    pub max_p95_latency_ms: f64,
}

impl Default for RollbackCriteria {
    fn default() -> Self {
        Self {
            max_error_rate: default_rollback_error_rate(),
            max_p95_latency_ms: default_rollback_p95_ms(),
        }
    }
}

/// Immutable configuration for a single rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Rollout name; one controller instance owns each name.
    pub name: String,
    /// Version being rolled out.
    pub target_version: VersionId,
    /// Stable version traffic is compared against.
    pub baseline_version: VersionId,
    /// Traffic-weight percentages defining the phases, non-decreasing.
    #[serde(default = "default_phases")]
    pub phases: Vec<u8>,
    /// Minimum dwell per phase, in seconds.
    #[serde(default = "default_phase_duration_secs")]
    pub min_phase_duration_secs: u64,
    /// Advance phases automatically when criteria are met.
    #[serde(default = "default_true")]
    pub auto_promote: bool,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    #[serde(default)]
    pub rollback_criteria: RollbackCriteria,
}

impl CanaryConfig {
    /// Minimum dwell per phase as a [`Duration`].
    pub fn min_phase_duration(&self) -> Duration {
        Duration::from_secs(self.min_phase_duration_secs)
    }

    /// Reject configurations that cannot produce a valid rollout.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.is_empty() {
            return Err(ControlError::InvalidConfig("rollout name is empty".into()));
        }
        if self.phases.is_empty() {
            return Err(ControlError::InvalidConfig(
                "at least one traffic phase is required".into(),
            ));
        }
        for pair in self.phases.windows(2) {
            if pair[1] < pair[0] {
                return Err(ControlError::InvalidConfig(format!(
                    "phase weights must be non-decreasing ({} follows {})",
                    pair[1], pair[0]
                )));
            }
        }
        if self.phases.iter().any(|w| *w == 0 || *w > 100) {
            return Err(ControlError::InvalidConfig(
                "phase weights must be within 1-100".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.success_criteria.max_error_rate)
            || !(0.0..=1.0).contains(&self.rollback_criteria.max_error_rate)
        {
            return Err(ControlError::InvalidConfig(
                "error-rate thresholds must be within 0.0-1.0".into(),
            ));
        }
        // Rollback bounds are the looser pair; equal-or-tighter bounds would
        // erase the hold zone and make every miss an instant revert.
        if self.rollback_criteria.max_error_rate < self.success_criteria.max_error_rate {
            return Err(ControlError::InvalidConfig(
                "rollback error-rate bound must not be tighter than the success bound".into(),
            ));
        }
        if self.rollback_criteria.max_p95_latency_ms < self.success_criteria.max_p95_latency_ms {
            return Err(ControlError::InvalidConfig(
                "rollback P95 bound must not be tighter than the success bound".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one target's accumulated metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
}

/// Full status of a rollout, safe to request at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub name: String,
    pub phase: CanaryPhase,
    pub current_weight: u8,
    pub target_version: VersionId,
    pub baseline_version: VersionId,
    pub started_at: Option<DateTime<Utc>>,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub canary: MetricsSnapshot,
    pub baseline: MetricsSnapshot,
}

/// A previously deployed version, as kept by the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub version: VersionId,
    /// Deployable image or artifact reference.
    pub image: String,
    pub deployed_at: DateTime<Utc>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub config_hash: String,
    /// Free-form metadata, e.g. the orchestrator revision number.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DeploymentVersion {
    /// Minimal record for a version known only by its identifier.
    pub fn bare(version: VersionId) -> Self {
        Self {
            version,
            image: String::new(),
            deployed_at: Utc::now(),
            replicas: default_replicas(),
            config_hash: String::new(),
            metadata: HashMap::new(),
        }
    }
}

/// How the executor switches production back to a prior version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Repoint the traffic selector at the old version.
    #[default]
    BlueGreen,
    /// Undo to the old version's orchestrator revision.
    Rolling,
    /// Stop the current version, then start the old artifact.
    Recreate,
}

/// Why a rollback was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    HighErrorRate,
    HighLatency,
    HealthCheckFail,
    CanaryFailed,
    Manual,
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighErrorRate => write!(f, "high_error_rate"),
            Self::HighLatency => write!(f, "high_latency"),
            Self::HealthCheckFail => write!(f, "health_check_fail"),
            Self::CanaryFailed => write!(f, "canary_failed"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Strategy the router applies to requests that match no override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    /// Weighted pick across all enabled rules, ignoring conditions.
    Random,
    /// Per-rule weighted coin for condition-matching rules, by priority.
    #[default]
    Weighted,
    /// Explicit routing header, then rule conditions.
    HeaderBased,
    /// Canary opt-in cookie.
    CookieBased,
    /// Consistent hash of the user identifier.
    UserBased,
    /// Consistent hash of the client IP.
    IpBased,
}

/// Predicate applied to one context value in a rule condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPredicate {
    Equals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Prefix(String),
    Regex(String),
}

/// A traffic-splitting rule.
///
/// Condition keys resolve against [`RouteContext::value`]; regex patterns
/// are compiled when the rule is registered with the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRule {
    pub name: String,
    /// Target version/service this rule routes to.
    pub target: String,
    /// Selection weight, 0-100.
    #[serde(default = "default_rule_weight")]
    pub weight: u8,
    #[serde(default)]
    pub condition: Option<HashMap<String, MatchPredicate>>,
    /// Higher priority rules are evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Per-request context the router inspects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteContext {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

impl RouteContext {
    /// Resolve a condition key to a context value.
    ///
    /// Plain keys are `user_id`, `client_ip`, `path`, `method`; header and
    /// cookie values use `header:<name>` / `cookie:<name>`. Returns `None`
    /// for absent headers/cookies and unknown keys.
    pub fn value(&self, key: &str) -> Option<&str> {
        match key {
            "user_id" => Some(self.user_id.as_str()),
            "client_ip" => Some(self.client_ip.as_str()),
            "path" => Some(self.path.as_str()),
            "method" => Some(self.method.as_str()),
            _ => {
                if let Some(name) = key.strip_prefix("header:") {
                    self.headers.get(name).map(String::as_str)
                } else if let Some(name) = key.strip_prefix("cookie:") {
                    self.cookies.get(name).map(String::as_str)
                } else {
                    None
                }
            }
        }
    }
}

/// Observed routing distribution, reset independently of rollout metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub by_target: HashMap<String, u64>,
    /// Share of routed requests per target, 0.0-100.0.
    pub percentages: HashMap<String, f64>,
}

fn default_min_requests() -> u64 {
    100
}

fn default_success_error_rate() -> f64 {
    0.01
}

fn default_success_p95_ms() -> f64 {
    1000.0
}

fn default_rollback_error_rate() -> f64 {
    0.05
}

fn default_rollback_p95_ms() -> f64 {
    3000.0
}

fn default_phases() -> Vec<u8> {
    vec![1, 5, 10, 25, 50, 75, 100]
}

fn default_phase_duration_secs() -> u64 {
    300
}

fn default_replicas() -> u32 {
    1
}

fn default_rule_weight() -> u8 {
    100
}

fn default_true() -> bool {
    true
}
