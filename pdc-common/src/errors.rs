//! Error taxonomy for rollout control operations.
//!
//! Configuration problems are rejected synchronously at command time;
//! transient external-action failures leave state untouched so the caller
//! can retry; metric insufficiency is not an error at all (the phase just
//! holds).

use thiserror::Error;

/// Errors surfaced by control-plane commands.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The supplied canary configuration cannot produce a valid rollout.
    #[error("invalid canary config: {0}")]
    InvalidConfig(String),

    /// A rollout is already active; the live router carries one split.
    #[error("rollout `{0}` is already running")]
    AlreadyRunning(String),

    /// Promote/rollback/status addressed a rollout that is not active.
    #[error("rollout `{0}` is not running")]
    NotRunning(String),

    /// Rollback was requested but the history store has no candidate.
    #[error("no rollback target available")]
    NoRollbackTarget,

    /// The strategy's external action failed; no state was mutated.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// A traffic rule could not be registered (e.g. invalid regex).
    #[error("invalid traffic rule `{name}`: {reason}")]
    InvalidRule { name: String, reason: String },
}
