//! Canary rollout controller.
//!
//! Owns the phase state machine and the periodic decision loop. Each
//! tick reads the canary's accumulated metrics and either advances the
//! phase, holds, or triggers rollback. Rollback criteria are checked
//! before promotion criteria every tick and take precedence, so a
//! version that regresses late in a phase is never silently promoted.
//!
//! All phase transitions and rule mutations happen on this controller's
//! task; start/stop/promote/rollback commands serialize through an
//! internal command lock and never run concurrently for a rollout.

use crate::events::{EventBus, RolloutEvent};
use crate::history::DeploymentHistoryStore;
use crate::metrics;
use crate::rollback::{RollbackExecutor, RollbackOutcome};
use crate::router::TrafficRouter;
use crate::telemetry::MetricsAccumulator;
use chrono::{DateTime, Utc};
use pdc_common::errors::ControlError;
use pdc_common::types::{
    CanaryConfig, CanaryPhase, DeploymentVersion, RollbackReason, RolloutStatus, TARGET_BASELINE,
    TARGET_CANARY,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Mutable rollout state, owned exclusively by the controller.
#[derive(Debug)]
struct RolloutState {
    phase: CanaryPhase,
    /// Index into the configured phase list; `None` before the first
    /// phase is entered.
    phase_index: Option<usize>,
    current_weight: u8,
    started_at: Option<DateTime<Utc>>,
    phase_started_at: Option<DateTime<Utc>>,
    /// Monotonic clock for dwell-time checks.
    phase_started_mono: Option<Instant>,
}

impl RolloutState {
    fn new() -> Self {
        Self {
            phase: CanaryPhase::Pending,
            phase_index: None,
            current_weight: 0,
            started_at: None,
            phase_started_at: None,
            phase_started_mono: None,
        }
    }
}

struct ControllerInner {
    config: CanaryConfig,
    /// Record pushed into history when the rollout completes.
    target_record: DeploymentVersion,
    router: Arc<TrafficRouter>,
    executor: Arc<RollbackExecutor>,
    history: Arc<DeploymentHistoryStore>,
    events: EventBus,
    poll_interval: Duration,
    canary_metrics: MetricsAccumulator,
    baseline_metrics: MetricsAccumulator,
    state: RwLock<RolloutState>,
    /// Decision-loop liveness flag; cleared by stop(), rollback, and
    /// completion.
    running: RwLock<bool>,
    /// Serializes ticks and operator commands for this rollout.
    command_lock: Mutex<()>,
}

/// Orchestrates one canary rollout through its configured phases.
#[derive(Clone)]
pub struct CanaryController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for CanaryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanaryController").finish_non_exhaustive()
    }
}

impl CanaryController {
    /// Build a controller for a validated configuration.
    pub fn new(
        config: CanaryConfig,
        target: Option<DeploymentVersion>,
        router: Arc<TrafficRouter>,
        executor: Arc<RollbackExecutor>,
        history: Arc<DeploymentHistoryStore>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let target_record =
            target.unwrap_or_else(|| DeploymentVersion::bare(config.target_version.clone()));
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                target_record,
                router,
                executor,
                history,
                events,
                poll_interval,
                canary_metrics: MetricsAccumulator::new(),
                baseline_metrics: MetricsAccumulator::new(),
                state: RwLock::new(RolloutState::new()),
                running: RwLock::new(false),
                command_lock: Mutex::new(()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CanaryConfig {
        &self.inner.config
    }

    pub async fn phase(&self) -> CanaryPhase {
        self.inner.state.read().await.phase
    }

    pub async fn is_running(&self) -> bool {
        *self.inner.running.read().await
    }

    /// Begin the rollout: enter the first phase and, when auto-promotion
    /// is enabled, spawn the decision loop.
    pub async fn start(&self) -> Result<(), ControlError> {
        let _cmd = self.inner.command_lock.lock().await;
        {
            let state = self.inner.state.read().await;
            if state.phase != CanaryPhase::Pending {
                return Err(ControlError::AlreadyRunning(self.inner.config.name.clone()));
            }
        }

        info!(
            rollout = %self.inner.config.name,
            target = %self.inner.config.target_version,
            baseline = %self.inner.config.baseline_version,
            "starting canary rollout"
        );
        {
            let mut state = self.inner.state.write().await;
            state.phase = CanaryPhase::Initializing;
            state.started_at = Some(Utc::now());
        }
        *self.inner.running.write().await = true;
        metrics::rollout_transition("started");
        self.inner.events.emit(RolloutEvent::Started {
            rollout: self.inner.config.name.clone(),
            target_version: self.inner.config.target_version.clone(),
        });

        self.advance_phase().await;

        if self.inner.config.auto_promote {
            self.spawn_decision_loop();
        }
        Ok(())
    }

    /// Halt the decision loop without forcing a phase change.
    pub async fn stop(&self) {
        let _cmd = self.inner.command_lock.lock().await;
        *self.inner.running.write().await = false;
        info!(rollout = %self.inner.config.name, "decision loop stopped");
    }

    /// Force an immediate phase advance, bypassing criteria and dwell.
    pub async fn manual_promote(&self) -> Result<(), ControlError> {
        let _cmd = self.inner.command_lock.lock().await;
        self.ensure_active().await?;
        info!(rollout = %self.inner.config.name, "manual promotion requested");
        self.advance_phase().await;
        Ok(())
    }

    /// Force an immediate rollback.
    pub async fn manual_rollback(
        &self,
        reason: RollbackReason,
    ) -> Result<RollbackOutcome, ControlError> {
        let _cmd = self.inner.command_lock.lock().await;
        self.ensure_active().await?;
        self.do_rollback(reason).await
    }

    /// Current phase, weight, and both targets' metrics. Always safe to
    /// call concurrently with the decision loop.
    pub async fn status(&self) -> RolloutStatus {
        let state = self.inner.state.read().await;
        RolloutStatus {
            name: self.inner.config.name.clone(),
            phase: state.phase,
            current_weight: state.current_weight,
            target_version: self.inner.config.target_version.clone(),
            baseline_version: self.inner.config.baseline_version.clone(),
            started_at: state.started_at,
            phase_started_at: state.phase_started_at,
            canary: self.inner.canary_metrics.snapshot(),
            baseline: self.inner.baseline_metrics.snapshot(),
        }
    }

    /// Feed one request outcome into the target's accumulator.
    pub fn record_request(&self, target: &str, success: bool, latency_ms: f64) {
        match target {
            TARGET_CANARY => self.inner.canary_metrics.record_request(success, latency_ms),
            TARGET_BASELINE => self
                .inner
                .baseline_metrics
                .record_request(success, latency_ms),
            other => {
                debug!(target = other, "ignoring outcome for unknown target");
                return;
            }
        }
        metrics::record_outcome(target, success);
    }

    /// Run one decision evaluation: rollback, promote, or hold.
    ///
    /// Normally driven by the internal timer; exposed so tests can step
    /// the loop deterministically.
    pub async fn tick(&self) {
        let _cmd = self.inner.command_lock.lock().await;
        if !*self.inner.running.read().await {
            return;
        }
        let (phase, phase_started) = {
            let state = self.inner.state.read().await;
            (state.phase, state.phase_started_mono)
        };
        if phase.is_terminal() || phase.weight().is_none() {
            return;
        }

        // Rollback first; promotion is only considered on a clean window.
        if let Some(reason) = self.rollback_violation() {
            let _ = self.do_rollback(reason).await;
            return;
        }

        if self.promotion_criteria_met() {
            let dwell_elapsed = phase_started
                .map(|t| t.elapsed() >= self.inner.config.min_phase_duration())
                .unwrap_or(false);
            if dwell_elapsed {
                self.advance_phase().await;
            } else {
                debug!(
                    rollout = %self.inner.config.name,
                    %phase,
                    "holding: minimum dwell time not yet elapsed"
                );
            }
        } else {
            debug!(
                rollout = %self.inner.config.name,
                %phase,
                "holding: success criteria not met"
            );
        }
    }

    /// Reject commands against a rollout that never started or already
    /// finished.
    async fn ensure_active(&self) -> Result<(), ControlError> {
        let phase = self.inner.state.read().await.phase;
        if phase == CanaryPhase::Pending || phase.is_terminal() {
            return Err(ControlError::NotRunning(self.inner.config.name.clone()));
        }
        Ok(())
    }

    /// A single violated rollback bound is sufficient to revert.
    fn rollback_violation(&self) -> Option<RollbackReason> {
        let criteria = &self.inner.config.rollback_criteria;
        let error_rate = self.inner.canary_metrics.error_rate();
        if error_rate > criteria.max_error_rate {
            warn!(
                rollout = %self.inner.config.name,
                error_rate,
                threshold = criteria.max_error_rate,
                "canary error rate exceeds rollback bound"
            );
            return Some(RollbackReason::HighErrorRate);
        }
        let p95 = self.inner.canary_metrics.p95_latency_ms();
        if p95 > criteria.max_p95_latency_ms {
            warn!(
                rollout = %self.inner.config.name,
                p95,
                threshold = criteria.max_p95_latency_ms,
                "canary P95 latency exceeds rollback bound"
            );
            return Some(RollbackReason::HighLatency);
        }
        None
    }

    /// Promotion requires the sample floor AND every bound simultaneously.
    fn promotion_criteria_met(&self) -> bool {
        let criteria = &self.inner.config.success_criteria;
        let canary = &self.inner.canary_metrics;
        canary.requests_total() >= criteria.min_requests
            && canary.error_rate() <= criteria.max_error_rate
            && canary.p95_latency_ms() <= criteria.max_p95_latency_ms
    }

    /// Enter the next configured phase, or complete when the list is
    /// exhausted.
    async fn advance_phase(&self) {
        let (weight, phase) = {
            let mut state = self.inner.state.write().await;
            let next_index = state.phase_index.map_or(0, |i| i + 1);
            if next_index >= self.inner.config.phases.len() {
                drop(state);
                self.complete().await;
                return;
            }
            let weight = self.inner.config.phases[next_index];
            state.phase_index = Some(next_index);
            state.current_weight = weight;
            state.phase = CanaryPhase::from_weight(weight);
            state.phase_started_at = Some(Utc::now());
            state.phase_started_mono = Some(Instant::now());
            (weight, state.phase)
        };

        // Move live traffic first, then open a fresh measurement window.
        // A few late samples from the prior phase may land in the new
        // window; accepted measurement noise, not a correctness bug.
        self.inner.router.set_canary_weight(weight);
        self.inner.canary_metrics.reset();
        self.inner.baseline_metrics.reset();
        metrics::set_canary_weight(weight);

        info!(
            rollout = %self.inner.config.name,
            %phase,
            weight,
            "canary phase advanced"
        );
        self.inner.events.emit(RolloutEvent::PhaseChanged {
            rollout: self.inner.config.name.clone(),
            phase,
            weight,
        });
    }

    async fn complete(&self) {
        {
            let mut state = self.inner.state.write().await;
            state.phase = CanaryPhase::Completed;
            state.current_weight = 100;
        }
        *self.inner.running.write().await = false;

        // The promoted version becomes the recorded current deployment.
        // The rollout rule stays at full weight until the application
        // repoints its stable target.
        self.inner
            .history
            .record_deployment(self.inner.target_record.clone());
        metrics::rollout_transition("completed");

        info!(
            rollout = %self.inner.config.name,
            target = %self.inner.config.target_version,
            "canary rollout completed"
        );
        self.inner.events.emit(RolloutEvent::Completed {
            rollout: self.inner.config.name.clone(),
            target_version: self.inner.config.target_version.clone(),
        });
    }

    /// Transition to `RolledBack`, revert live traffic, then run the
    /// mechanical rollback. If the executor fails, the rollout still
    /// ends rolled back (the router already reverted) but history is
    /// untouched and the error is surfaced; escalation is the
    /// operator's responsibility.
    async fn do_rollback(
        &self,
        reason: RollbackReason,
    ) -> Result<RollbackOutcome, ControlError> {
        {
            let mut state = self.inner.state.write().await;
            state.phase = CanaryPhase::RolledBack;
            state.current_weight = 0;
        }
        *self.inner.running.write().await = false;
        self.inner.router.set_canary_weight(0);
        metrics::set_canary_weight(0);
        metrics::rollout_transition("rolled_back");

        warn!(rollout = %self.inner.config.name, %reason, "rolling back canary");
        self.inner.events.emit(RolloutEvent::RolledBack {
            rollout: self.inner.config.name.clone(),
            reason,
        });

        match self
            .inner
            .executor
            .rollback(&self.inner.config.name, reason, None)
            .await
        {
            Ok(outcome) => {
                // Verification only gates logging here; the rollback result
                // stands either way and escalation is the operator's call.
                if !self.inner.executor.verify_health().await {
                    warn!(
                        rollout = %self.inner.config.name,
                        "service did not report healthy within the post-rollback window"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(rollout = %self.inner.config.name, "rollback execution failed: {e}");
                Err(e)
            }
        }
    }

    fn spawn_decision_loop(&self) {
        let controller = self.clone();
        let poll = self.inner.poll_interval;
        tokio::spawn(async move {
            let mut ticker = interval(poll);
            // The first interval tick completes immediately; skip it so
            // every evaluation sees a full window.
            ticker.tick().await;
            info!(
                rollout = %controller.inner.config.name,
                interval = ?poll,
                "decision loop started"
            );
            loop {
                ticker.tick().await;
                if !*controller.inner.running.read().await {
                    break;
                }
                controller.tick().await;
            }
            info!(rollout = %controller.inner.config.name, "decision loop exited");
        });
    }
}

/// Owns the single active rollout slot.
///
/// The live router enforces exactly one baseline/canary split, so at
/// most one rollout is active at a time; a finished controller stays
/// queryable until the next start replaces it.
pub struct RolloutManager {
    router: Arc<TrafficRouter>,
    history: Arc<DeploymentHistoryStore>,
    executor: Arc<RollbackExecutor>,
    events: EventBus,
    poll_interval: Duration,
    active: RwLock<Option<CanaryController>>,
}

impl RolloutManager {
    pub fn new(
        router: Arc<TrafficRouter>,
        history: Arc<DeploymentHistoryStore>,
        executor: Arc<RollbackExecutor>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            router,
            history,
            executor,
            events,
            poll_interval,
            active: RwLock::new(None),
        }
    }

    /// Start a rollout. Fails when one is already active.
    pub async fn start(
        &self,
        config: CanaryConfig,
        target: Option<DeploymentVersion>,
    ) -> Result<RolloutStatus, ControlError> {
        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            if !current.phase().await.is_terminal() {
                return Err(ControlError::AlreadyRunning(current.name().to_string()));
            }
        }

        let controller = CanaryController::new(
            config,
            target,
            self.router.clone(),
            self.executor.clone(),
            self.history.clone(),
            self.events.clone(),
            self.poll_interval,
        )?;
        controller.start().await?;
        let status = controller.status().await;
        *active = Some(controller);
        Ok(status)
    }

    async fn controller(&self, name: &str) -> Result<CanaryController, ControlError> {
        let active = self.active.read().await;
        match active.as_ref() {
            Some(c) if c.name() == name => Ok(c.clone()),
            _ => Err(ControlError::NotRunning(name.to_string())),
        }
    }

    pub async fn status(&self, name: &str) -> Result<RolloutStatus, ControlError> {
        Ok(self.controller(name).await?.status().await)
    }

    pub async fn stop(&self, name: &str) -> Result<(), ControlError> {
        self.controller(name).await?.stop().await;
        Ok(())
    }

    pub async fn promote(&self, name: &str) -> Result<RolloutStatus, ControlError> {
        let controller = self.controller(name).await?;
        controller.manual_promote().await?;
        Ok(controller.status().await)
    }

    pub async fn rollback(
        &self,
        name: &str,
        reason: Option<RollbackReason>,
    ) -> Result<RollbackOutcome, ControlError> {
        self.controller(name)
            .await?
            .manual_rollback(reason.unwrap_or(RollbackReason::Manual))
            .await
    }

    /// Feed a request outcome into the active rollout, if any. A record
    /// with no active rollout is dropped, not an error.
    pub async fn record(&self, target: &str, success: bool, latency_ms: f64) {
        if let Some(controller) = self.active.read().await.as_ref() {
            controller.record_request(target, success, latency_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::MockOrchestrator;
    use pdc_common::config::RollbackConfig;
    use pdc_common::types::{RollbackCriteria, RouteStrategy, SuccessCriteria, VersionId};
    use std::collections::HashMap;

    struct Harness {
        router: Arc<TrafficRouter>,
        history: Arc<DeploymentHistoryStore>,
        orchestrator: Arc<MockOrchestrator>,
        executor: Arc<RollbackExecutor>,
        events: EventBus,
    }

    fn version(id: &str) -> DeploymentVersion {
        DeploymentVersion {
            version: VersionId::new(id),
            image: format!("registry.local/app:{id}"),
            deployed_at: Utc::now(),
            replicas: 1,
            config_hash: String::new(),
            metadata: HashMap::new(),
        }
    }

    fn harness() -> Harness {
        let router = Arc::new(TrafficRouter::new(RouteStrategy::UserBased, TARGET_BASELINE));
        let history = Arc::new(DeploymentHistoryStore::new(10));
        // v1 in history, v2 current: the canary rolls out on top of v2.
        history.record_deployment(version("v1"));
        history.record_deployment(version("v2"));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let executor = Arc::new(RollbackExecutor::new(
            RollbackConfig::default(),
            orchestrator.clone(),
            history.clone(),
        ));
        Harness {
            router,
            history,
            orchestrator,
            executor,
            events: EventBus::default(),
        }
    }

    fn test_config() -> CanaryConfig {
        CanaryConfig {
            name: "checkout".into(),
            target_version: VersionId::new("v3"),
            baseline_version: VersionId::new("v2"),
            phases: vec![1, 10, 100],
            min_phase_duration_secs: 0,
            auto_promote: false,
            success_criteria: SuccessCriteria {
                min_requests: 50,
                max_error_rate: 0.01,
                max_p95_latency_ms: 1000.0,
            },
            rollback_criteria: RollbackCriteria {
                max_error_rate: 0.05,
                max_p95_latency_ms: 3000.0,
            },
        }
    }

    fn controller_with(h: &Harness, config: CanaryConfig) -> CanaryController {
        CanaryController::new(
            config,
            None,
            h.router.clone(),
            h.executor.clone(),
            h.history.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn record_canary(controller: &CanaryController, ok: usize, failed: usize, latency_ms: f64) {
        for _ in 0..ok {
            controller.record_request(TARGET_CANARY, true, latency_ms);
        }
        for _ in 0..failed {
            controller.record_request(TARGET_CANARY, false, latency_ms);
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let h = harness();
        let config = CanaryConfig {
            phases: vec![],
            ..test_config()
        };
        let err = CanaryController::new(
            config,
            None,
            h.router.clone(),
            h.executor.clone(),
            h.history.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn start_enters_first_phase() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();

        let status = controller.status().await;
        assert_eq!(status.phase, CanaryPhase::Canary(1));
        assert_eq!(status.current_weight, 1);
        assert!(status.started_at.is_some());
        assert!(controller.is_running().await);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn tick_holds_below_sample_floor() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();

        // Zero errors but below min_requests=50: promotion must not occur.
        record_canary(&controller, 40, 0, 200.0);
        controller.tick().await;

        assert_eq!(controller.phase().await, CanaryPhase::Canary(1));
    }

    #[tokio::test]
    async fn tick_promotes_through_all_phases() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();

        record_canary(&controller, 60, 0, 200.0);
        controller.tick().await;
        assert_eq!(controller.phase().await, CanaryPhase::Canary(10));

        // Metrics were reset on entry; refill the new window.
        assert_eq!(controller.status().await.canary.requests_total, 0);
        record_canary(&controller, 60, 0, 200.0);
        controller.tick().await;
        assert_eq!(controller.phase().await, CanaryPhase::Full);

        record_canary(&controller, 60, 0, 200.0);
        controller.tick().await;
        assert_eq!(controller.phase().await, CanaryPhase::Completed);
        assert!(!controller.is_running().await);

        // Completion records the target as the current deployment.
        assert_eq!(h.history.current().unwrap().version.as_str(), "v3");
    }

    #[tokio::test]
    async fn error_rate_violation_rolls_back_regardless_of_dwell() {
        let h = harness();
        let config = CanaryConfig {
            min_phase_duration_secs: 3600,
            ..test_config()
        };
        let controller = controller_with(&h, config);
        controller.start().await.unwrap();

        // 5/60 failures: ~0.083 error rate, above the 0.05 rollback bound.
        record_canary(&controller, 55, 5, 200.0);
        controller.tick().await;

        let status = controller.status().await;
        assert_eq!(status.phase, CanaryPhase::RolledBack);
        assert_eq!(status.current_weight, 0);
        assert!(!controller.is_running().await);
        // The executor performed the switch back to the prior version.
        assert_eq!(h.orchestrator.calls(), vec!["switch_traffic:v1"]);
        assert_eq!(h.history.current().unwrap().version.as_str(), "v1");
    }

    #[tokio::test]
    async fn latency_violation_rolls_back() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();

        // Error-free but far above the 3000ms rollback P95 bound.
        record_canary(&controller, 60, 0, 5000.0);
        controller.tick().await;

        assert_eq!(controller.phase().await, CanaryPhase::RolledBack);
    }

    #[tokio::test]
    async fn hold_zone_neither_promotes_nor_reverts() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();

        // 2/60 failures: ~0.033, above success 0.01 but below rollback 0.05.
        record_canary(&controller, 58, 2, 200.0);
        controller.tick().await;

        assert_eq!(controller.phase().await, CanaryPhase::Canary(1));
        assert!(controller.is_running().await);
    }

    #[tokio::test]
    async fn dwell_gates_promotion_even_with_good_metrics() {
        let h = harness();
        let config = CanaryConfig {
            min_phase_duration_secs: 3600,
            ..test_config()
        };
        let controller = controller_with(&h, config);
        controller.start().await.unwrap();

        record_canary(&controller, 60, 0, 200.0);
        controller.tick().await;

        assert_eq!(controller.phase().await, CanaryPhase::Canary(1));
    }

    #[tokio::test]
    async fn manual_promote_bypasses_criteria() {
        let h = harness();
        let config = CanaryConfig {
            min_phase_duration_secs: 3600,
            ..test_config()
        };
        let controller = controller_with(&h, config);
        controller.start().await.unwrap();

        controller.manual_promote().await.unwrap();
        assert_eq!(controller.phase().await, CanaryPhase::Canary(10));
    }

    #[tokio::test]
    async fn manual_commands_rejected_before_start_and_after_finish() {
        let h = harness();
        let controller = controller_with(&h, test_config());

        assert!(matches!(
            controller.manual_promote().await.unwrap_err(),
            ControlError::NotRunning(_)
        ));

        controller.start().await.unwrap();
        controller
            .manual_rollback(RollbackReason::Manual)
            .await
            .unwrap();

        assert!(matches!(
            controller.manual_promote().await.unwrap_err(),
            ControlError::NotRunning(_)
        ));
        assert!(matches!(
            controller.manual_rollback(RollbackReason::Manual).await.unwrap_err(),
            ControlError::NotRunning(_)
        ));
    }

    #[tokio::test]
    async fn stop_halts_ticks_without_phase_change() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        controller.start().await.unwrap();
        controller.stop().await;

        record_canary(&controller, 60, 0, 200.0);
        controller.tick().await;

        // Loop is halted: no promotion happened.
        assert_eq!(controller.phase().await, CanaryPhase::Canary(1));
        assert!(!controller.is_running().await);

        // But the operator can still drive the rollout manually.
        controller.manual_promote().await.unwrap();
        assert_eq!(controller.phase().await, CanaryPhase::Canary(10));
    }

    #[tokio::test]
    async fn rollback_with_empty_history_surfaces_error() {
        let router = Arc::new(TrafficRouter::new(RouteStrategy::UserBased, TARGET_BASELINE));
        let history = Arc::new(DeploymentHistoryStore::new(10));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let executor = Arc::new(RollbackExecutor::new(
            RollbackConfig::default(),
            orchestrator.clone(),
            history.clone(),
        ));
        let controller = CanaryController::new(
            test_config(),
            None,
            router,
            executor,
            history.clone(),
            EventBus::default(),
            Duration::from_secs(10),
        )
        .unwrap();
        controller.start().await.unwrap();

        let err = controller
            .manual_rollback(RollbackReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoRollbackTarget));
        // Traffic was reverted, but the version record is untouched.
        assert_eq!(controller.phase().await, CanaryPhase::RolledBack);
        assert!(history.current().is_none());
        assert!(orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn phase_weights_are_non_decreasing_over_lifetime() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        let mut rx = h.events.subscribe();
        controller.start().await.unwrap();

        for _ in 0..3 {
            record_canary(&controller, 60, 0, 200.0);
            controller.tick().await;
        }
        assert_eq!(controller.phase().await, CanaryPhase::Completed);

        let mut weights = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RolloutEvent::PhaseChanged { weight, .. } = event {
                weights.push(weight);
            }
        }
        assert_eq!(weights, vec![1, 10, 100]);
        assert!(weights.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn events_cover_start_and_completion() {
        let h = harness();
        let controller = controller_with(&h, test_config());
        let mut rx = h.events.subscribe();
        controller.start().await.unwrap();

        for _ in 0..3 {
            record_canary(&controller, 60, 0, 200.0);
            controller.tick().await;
        }

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                RolloutEvent::Started { .. } => saw_started = true,
                RolloutEvent::Completed { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn manager_rejects_concurrent_rollouts() {
        let h = harness();
        let manager = RolloutManager::new(
            h.router.clone(),
            h.history.clone(),
            h.executor.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        );

        manager.start(test_config(), None).await.unwrap();
        let other = CanaryConfig {
            name: "search".into(),
            ..test_config()
        };
        let err = manager.start(other, None).await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn manager_allows_new_rollout_after_terminal() {
        let h = harness();
        let manager = RolloutManager::new(
            h.router.clone(),
            h.history.clone(),
            h.executor.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        );

        manager.start(test_config(), None).await.unwrap();
        manager.rollback("checkout", None).await.unwrap();

        // Terminal rollout remains queryable...
        let status = manager.status("checkout").await.unwrap();
        assert_eq!(status.phase, CanaryPhase::RolledBack);

        // ...and a new rollout may replace it.
        let next = CanaryConfig {
            name: "checkout-2".into(),
            ..test_config()
        };
        manager.start(next, None).await.unwrap();
        assert!(manager.status("checkout").await.is_err());
        assert!(manager.status("checkout-2").await.is_ok());
    }

    #[tokio::test]
    async fn manager_routes_commands_by_name() {
        let h = harness();
        let manager = RolloutManager::new(
            h.router.clone(),
            h.history.clone(),
            h.executor.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        );
        manager.start(test_config(), None).await.unwrap();

        assert!(matches!(
            manager.status("unknown").await.unwrap_err(),
            ControlError::NotRunning(_)
        ));
        assert!(manager.promote("checkout").await.is_ok());
        manager.stop("checkout").await.unwrap();
    }

    #[tokio::test]
    async fn manager_record_feeds_active_rollout() {
        let h = harness();
        let manager = RolloutManager::new(
            h.router.clone(),
            h.history.clone(),
            h.executor.clone(),
            h.events.clone(),
            Duration::from_secs(10),
        );

        // No active rollout: records are dropped silently.
        manager.record(TARGET_CANARY, true, 100.0).await;

        manager.start(test_config(), None).await.unwrap();
        manager.record(TARGET_CANARY, true, 100.0).await;
        manager.record(TARGET_CANARY, false, 100.0).await;
        manager.record(TARGET_BASELINE, true, 50.0).await;

        let status = manager.status("checkout").await.unwrap();
        assert_eq!(status.canary.requests_total, 2);
        assert_eq!(status.canary.errors_total, 1);
        assert_eq!(status.baseline.requests_total, 1);
    }
}
