//! Rollback execution: strategy-specific switch, hooks, health gate.
//!
//! The executor performs the mechanical work of shifting production back
//! to a previously deployed version. Orchestration actions are opaque
//! behind the [`Orchestrator`] trait; the executor interprets nothing
//! beyond success/failure.

use crate::health::{self, HealthProbeConfig};
use crate::history::DeploymentHistoryStore;
use pdc_common::config::{OrchestratorConfig, RollbackConfig};
use pdc_common::errors::ControlError;
use pdc_common::hooks::{HookContext, RollbackHook, hooks_from_commands};
use pdc_common::types::{DeploymentVersion, RollbackReason, RollbackStrategy, VersionId};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Opaque external actions that actually move infrastructure traffic
/// and processes. Implementations only report success/failure.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Repoint the live traffic selector at the target version
    /// (blue-green).
    async fn switch_traffic(&self, target: &DeploymentVersion) -> Result<()>;

    /// Undo the deployment to the target's recorded revision (rolling).
    async fn undo_to_revision(&self, target: &DeploymentVersion) -> Result<()>;

    /// Stop the currently running version (recreate).
    async fn stop_current(&self) -> Result<()>;

    /// Start the target artifact (recreate).
    async fn start_version(&self, target: &DeploymentVersion) -> Result<()>;
}

/// Orchestrator that runs configured commands with target placeholders
/// substituted.
pub struct CommandOrchestrator {
    config: OrchestratorConfig,
}

impl CommandOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    async fn run(&self, action: &str, command: Option<&str>, target: Option<&DeploymentVersion>) -> Result<()> {
        let Some(template) = command else {
            bail!("no command configured for orchestration action `{action}`");
        };
        let rendered = match target {
            Some(t) => substitute(template, t),
            None => template.to_string(),
        };
        let mut parts = rendered.split_whitespace();
        let program = parts
            .next()
            .with_context(|| format!("blank command for orchestration action `{action}`"))?
            .to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        info!(action, command = %rendered, "invoking orchestration action");
        let status = tokio::process::Command::new(&program)
            .args(&args)
            .status()
            .await
            .with_context(|| format!("failed to spawn orchestration action `{action}`"))?;
        if !status.success() {
            bail!("orchestration action `{action}` exited with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for CommandOrchestrator {
    async fn switch_traffic(&self, target: &DeploymentVersion) -> Result<()> {
        self.run(
            "switch_traffic",
            self.config.switch_traffic.as_deref(),
            Some(target),
        )
        .await
    }

    async fn undo_to_revision(&self, target: &DeploymentVersion) -> Result<()> {
        self.run(
            "undo_revision",
            self.config.undo_revision.as_deref(),
            Some(target),
        )
        .await
    }

    async fn stop_current(&self) -> Result<()> {
        self.run("stop", self.config.stop.as_deref(), None).await
    }

    async fn start_version(&self, target: &DeploymentVersion) -> Result<()> {
        self.run("start", self.config.start.as_deref(), Some(target))
            .await
    }
}

/// Render `{version}`, `{image}`, `{revision}`, `{replicas}` from the
/// rollback target.
fn substitute(template: &str, target: &DeploymentVersion) -> String {
    let revision = target
        .metadata
        .get("revision")
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    template
        .replace("{version}", target.version.as_str())
        .replace("{image}", &target.image)
        .replace("{revision}", &revision)
        .replace("{replicas}", &target.replicas.to_string())
}

/// Result of a successful rollback.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    /// Version that was displaced, when one was recorded.
    pub from: Option<VersionId>,
    /// Version production was switched back to.
    pub to: VersionId,
}

/// Performs rollbacks against the history store using a configured
/// strategy, with best-effort pre/post hooks.
pub struct RollbackExecutor {
    config: RollbackConfig,
    orchestrator: Arc<dyn Orchestrator>,
    history: Arc<DeploymentHistoryStore>,
    pre_hooks: Vec<Box<dyn RollbackHook>>,
    post_hooks: Vec<Box<dyn RollbackHook>>,
}

impl RollbackExecutor {
    pub fn new(
        config: RollbackConfig,
        orchestrator: Arc<dyn Orchestrator>,
        history: Arc<DeploymentHistoryStore>,
    ) -> Self {
        let pre_hooks = hooks_from_commands(&config.pre_rollback_hooks);
        let post_hooks = hooks_from_commands(&config.post_rollback_hooks);
        Self {
            config,
            orchestrator,
            history,
            pre_hooks,
            post_hooks,
        }
    }

    /// Roll production back to `target_version`, or to the most recent
    /// history entry when no explicit target is given.
    ///
    /// Fails fast with no mutation when no candidate exists. On strategy
    /// failure the history store is left untouched so the caller may
    /// retry; retries are never automatic.
    pub async fn rollback(
        &self,
        rollout: &str,
        reason: RollbackReason,
        target_version: Option<&VersionId>,
    ) -> Result<RollbackOutcome, ControlError> {
        let target = match target_version {
            Some(id) => self.history.find(id),
            None => self.history.rollback_targets().into_iter().next(),
        }
        .ok_or(ControlError::NoRollbackTarget)?;

        let from = self.history.current().map(|v| v.version);
        info!(
            rollout,
            %reason,
            from = from.as_ref().map(VersionId::as_str).unwrap_or("unknown"),
            to = %target.version,
            strategy = ?self.config.strategy,
            "starting rollback"
        );

        let hook_ctx = HookContext {
            rollout: rollout.to_string(),
            reason: reason.to_string(),
            from_version: from.clone(),
            to_version: target.version.clone(),
        };
        self.run_hooks(&self.pre_hooks, &hook_ctx, "pre-rollback").await;

        let switch = self.execute_strategy(&target);
        match tokio::time::timeout(self.config.timeout(), switch).await {
            Err(_) => {
                return Err(ControlError::RollbackFailed(format!(
                    "{:?} switch timed out after {:?}",
                    self.config.strategy,
                    self.config.timeout()
                )));
            }
            Ok(Err(e)) => return Err(ControlError::RollbackFailed(format!("{e:#}"))),
            Ok(Ok(())) => {}
        }

        if self.history.swap_for_rollback(&target.version).is_none() {
            // The entry vanished between selection and swap; the switch
            // already happened, so report success but flag the anomaly.
            warn!(to = %target.version, "rollback target missing from history at swap time");
        }

        self.run_hooks(&self.post_hooks, &hook_ctx, "post-rollback").await;
        info!(rollout, to = %target.version, "rollback complete");

        Ok(RollbackOutcome {
            from,
            to: target.version,
        })
    }

    async fn execute_strategy(&self, target: &DeploymentVersion) -> Result<()> {
        match self.config.strategy {
            RollbackStrategy::BlueGreen => self.orchestrator.switch_traffic(target).await,
            RollbackStrategy::Rolling => self.orchestrator.undo_to_revision(target).await,
            RollbackStrategy::Recreate => {
                self.orchestrator.stop_current().await?;
                self.orchestrator.start_version(target).await
            }
        }
    }

    /// Hooks are best-effort: failures are logged and never abort the
    /// rollback.
    async fn run_hooks(&self, hooks: &[Box<dyn RollbackHook>], ctx: &HookContext, stage: &str) {
        for hook in hooks {
            match hook.execute(ctx).await {
                Ok(()) => info!(stage, hook = hook.name(), "hook completed"),
                Err(e) => warn!(stage, hook = hook.name(), "hook failed: {e:#}"),
            }
        }
    }

    /// Poll the configured health endpoint until healthy or `timeout`.
    ///
    /// Returns `true` when no health URL is configured (nothing to
    /// gate on). The executor never blocks its rollback result on this;
    /// sequencing is the caller's choice.
    pub async fn health_check(&self, timeout: Duration) -> bool {
        match &self.config.health_url {
            Some(url) => health::probe_until_healthy(&HealthProbeConfig::new(url), timeout).await,
            None => true,
        }
    }

    /// Wait the configured post-switch window for the service to report
    /// healthy.
    pub async fn verify_health(&self) -> bool {
        self.health_check(self.config.health_check_wait()).await
    }
}

/// Orchestrator test double that records invoked actions and can be
/// switched into a failing or slow mode.
#[derive(Debug, Default)]
pub struct MockOrchestrator {
    calls: std::sync::Mutex<Vec<String>>,
    fail: std::sync::atomic::AtomicBool,
    delay: std::sync::Mutex<Option<Duration>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn invoke(&self, call: String) -> Result<()> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("orchestration action failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn switch_traffic(&self, target: &DeploymentVersion) -> Result<()> {
        self.invoke(format!("switch_traffic:{}", target.version)).await
    }

    async fn undo_to_revision(&self, target: &DeploymentVersion) -> Result<()> {
        self.invoke(format!("undo_to_revision:{}", target.version)).await
    }

    async fn stop_current(&self) -> Result<()> {
        self.invoke("stop_current".to_string()).await
    }

    async fn start_version(&self, target: &DeploymentVersion) -> Result<()> {
        self.invoke(format!("start_version:{}", target.version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn version(id: &str) -> DeploymentVersion {
        DeploymentVersion {
            version: VersionId::new(id),
            image: format!("registry.local/app:{id}"),
            deployed_at: Utc::now(),
            replicas: 2,
            config_hash: String::new(),
            metadata: HashMap::from([(
                "revision".to_string(),
                serde_json::Value::String("7".into()),
            )]),
        }
    }

    fn seeded_history() -> Arc<DeploymentHistoryStore> {
        let history = DeploymentHistoryStore::new(10);
        history.record_deployment(version("v1"));
        history.record_deployment(version("v2"));
        Arc::new(history)
    }

    fn executor(
        strategy: RollbackStrategy,
        orchestrator: Arc<MockOrchestrator>,
        history: Arc<DeploymentHistoryStore>,
    ) -> RollbackExecutor {
        let config = RollbackConfig {
            strategy,
            timeout_secs: 5,
            ..Default::default()
        };
        RollbackExecutor::new(config, orchestrator, history)
    }

    #[tokio::test]
    async fn empty_history_fails_fast_without_mutation() {
        let history = Arc::new(DeploymentHistoryStore::new(10));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::BlueGreen, orchestrator.clone(), history.clone());

        let err = exec
            .rollback("checkout", RollbackReason::Manual, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoRollbackTarget));
        assert!(history.current().is_none());
        assert!(orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn blue_green_rollback_swaps_history() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::BlueGreen, orchestrator.clone(), history.clone());

        let outcome = exec
            .rollback("checkout", RollbackReason::HighErrorRate, None)
            .await
            .unwrap();
        assert_eq!(outcome.from.unwrap().as_str(), "v2");
        assert_eq!(outcome.to.as_str(), "v1");
        assert_eq!(orchestrator.calls(), vec!["switch_traffic:v1"]);

        assert_eq!(history.current().unwrap().version.as_str(), "v1");
        assert_eq!(history.rollback_targets()[0].version.as_str(), "v2");
    }

    #[tokio::test]
    async fn recreate_stops_then_starts() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::Recreate, orchestrator.clone(), history);

        exec.rollback("checkout", RollbackReason::Manual, None)
            .await
            .unwrap();
        assert_eq!(
            orchestrator.calls(),
            vec!["stop_current", "start_version:v1"]
        );
    }

    #[tokio::test]
    async fn rolling_uses_revision_undo() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::Rolling, orchestrator.clone(), history);

        exec.rollback("checkout", RollbackReason::Manual, None)
            .await
            .unwrap();
        assert_eq!(orchestrator.calls(), vec!["undo_to_revision:v1"]);
    }

    #[tokio::test]
    async fn explicit_target_version_is_honored() {
        let history = DeploymentHistoryStore::new(10);
        history.record_deployment(version("v1"));
        history.record_deployment(version("v2"));
        history.record_deployment(version("v3"));
        let history = Arc::new(history);

        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::BlueGreen, orchestrator, history.clone());

        let outcome = exec
            .rollback("checkout", RollbackReason::Manual, Some(&VersionId::new("v1")))
            .await
            .unwrap();
        assert_eq!(outcome.to.as_str(), "v1");
        assert_eq!(history.current().unwrap().version.as_str(), "v1");
    }

    #[tokio::test]
    async fn unknown_explicit_target_fails_fast() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        let exec = executor(RollbackStrategy::BlueGreen, orchestrator.clone(), history.clone());

        let err = exec
            .rollback("checkout", RollbackReason::Manual, Some(&VersionId::new("v9")))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoRollbackTarget));
        assert_eq!(history.current().unwrap().version.as_str(), "v2");
        assert!(orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_switch_leaves_state_untouched() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_fail(true);
        let exec = executor(RollbackStrategy::BlueGreen, orchestrator, history.clone());

        let err = exec
            .rollback("checkout", RollbackReason::HighLatency, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RollbackFailed(_)));
        assert_eq!(history.current().unwrap().version.as_str(), "v2");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn slow_switch_hits_the_timeout() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_delay(Duration::from_secs(10));

        let config = RollbackConfig {
            strategy: RollbackStrategy::BlueGreen,
            timeout_secs: 1,
            ..Default::default()
        };
        let exec = RollbackExecutor::new(config, orchestrator, history.clone());

        // Paused test clock: the 1s timeout fires before the 10s action.
        tokio::time::pause();
        let err = exec
            .rollback("checkout", RollbackReason::Manual, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RollbackFailed(_)));
        assert_eq!(history.current().unwrap().version.as_str(), "v2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_hooks_do_not_abort_the_rollback() {
        let history = seeded_history();
        let orchestrator = Arc::new(MockOrchestrator::new());
        let config = RollbackConfig {
            strategy: RollbackStrategy::BlueGreen,
            timeout_secs: 5,
            pre_rollback_hooks: vec!["false".to_string()],
            post_rollback_hooks: vec!["true".to_string()],
            ..Default::default()
        };
        let exec = RollbackExecutor::new(config, orchestrator, history.clone());

        let outcome = exec
            .rollback("checkout", RollbackReason::Manual, None)
            .await
            .unwrap();
        assert_eq!(outcome.to.as_str(), "v1");
        assert_eq!(history.current().unwrap().version.as_str(), "v1");
    }

    #[tokio::test]
    async fn health_check_without_url_passes() {
        let history = Arc::new(DeploymentHistoryStore::new(10));
        let exec = executor(
            RollbackStrategy::BlueGreen,
            Arc::new(MockOrchestrator::new()),
            history,
        );
        assert!(exec.health_check(Duration::from_millis(10)).await);
    }

    #[test]
    fn substitute_renders_target_fields() {
        let rendered = substitute(
            "kubectl rollout undo deployment/app --to-revision={revision} --image={image}",
            &version("v1"),
        );
        assert_eq!(
            rendered,
            "kubectl rollout undo deployment/app --to-revision=7 --image=registry.local/app:v1"
        );
    }

    #[tokio::test]
    async fn command_orchestrator_requires_configuration() {
        let orch = CommandOrchestrator::new(OrchestratorConfig::default());
        let err = orch.switch_traffic(&version("v1")).await.unwrap_err();
        assert!(err.to_string().contains("no command configured"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_orchestrator_runs_configured_command() {
        let orch = CommandOrchestrator::new(OrchestratorConfig {
            switch_traffic: Some("true".to_string()),
            ..Default::default()
        });
        assert!(orch.switch_traffic(&version("v1")).await.is_ok());

        let orch = CommandOrchestrator::new(OrchestratorConfig {
            switch_traffic: Some("false".to_string()),
            ..Default::default()
        });
        assert!(orch.switch_traffic(&version("v1")).await.is_err());
    }
}
