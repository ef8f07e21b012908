//! Daemon configuration loaded from a TOML file.
//!
//! Every section and field has a serde default so a partial (or absent)
//! file yields a runnable daemon.

use crate::types::{RollbackStrategy, RouteStrategy, TARGET_BASELINE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Load from `path` if given, falling back to defaults when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

/// Decision-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between decision-loop ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Traffic-router defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Strategy applied to requests matching no override.
    #[serde(default)]
    pub strategy: RouteStrategy,
    /// Target for requests no rule claims.
    #[serde(default = "default_target")]
    pub default_target: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RouteStrategy::default(),
            default_target: default_target(),
        }
    }
}

/// Rollback execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default)]
    pub strategy: RollbackStrategy,
    /// Hard ceiling for a strategy's external action, in seconds.
    #[serde(default = "default_rollback_timeout_secs")]
    pub timeout_secs: u64,
    /// How long to poll the health endpoint after a switch, in seconds.
    #[serde(default = "default_health_check_wait_secs")]
    pub health_check_wait_secs: u64,
    /// Health endpoint polled after a rollback switch.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Commands run before the switch; failures are logged, not fatal.
    #[serde(default)]
    pub pre_rollback_hooks: Vec<String>,
    /// Commands run after a successful switch; failures are logged.
    #[serde(default)]
    pub post_rollback_hooks: Vec<String>,
    /// Commands backing the strategy-specific orchestration actions.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl RollbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn health_check_wait(&self) -> Duration {
        Duration::from_secs(self.health_check_wait_secs)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            strategy: RollbackStrategy::default(),
            timeout_secs: default_rollback_timeout_secs(),
            health_check_wait_secs: default_health_check_wait_secs(),
            health_url: None,
            pre_rollback_hooks: Vec::new(),
            post_rollback_hooks: Vec::new(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Commands invoked for the opaque orchestration actions.
///
/// `{version}`, `{image}`, `{revision}`, and `{replicas}` placeholders
/// are substituted from the rollback target before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Blue-green: repoint the traffic selector at the old version.
    #[serde(default)]
    pub switch_traffic: Option<String>,
    /// Rolling: undo the deployment to the target's revision.
    #[serde(default)]
    pub undo_revision: Option<String>,
    /// Recreate: stop the currently running version.
    #[serde(default)]
    pub stop: Option<String>,
    /// Recreate: start the old artifact.
    #[serde(default)]
    pub start: Option<String>,
}

/// Deployment-history persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Where the `{current, history}` document is persisted.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Maximum retained history entries; oldest are evicted.
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            limit: default_history_limit(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_target() -> String {
    TARGET_BASELINE.to_string()
}

fn default_rollback_timeout_secs() -> u64 {
    300
}

fn default_health_check_wait_secs() -> u64 {
    30
}

fn default_history_limit() -> usize {
    10
}

fn default_port() -> u16 {
    7430
}
