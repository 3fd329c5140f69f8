//! Autoscaler service — periodic evaluation, execution, and audit.
//!
//! On each tick every deployment with an enabled policy is evaluated
//! against the metrics facade. Executions go through a callback to the
//! orchestrator; on success the new instance count is persisted, a
//! `ScalingEvent` is appended, and the cooldown window starts. A failed
//! execution is abandoned with an error log and no cooldown, so the
//! next tick retries naturally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use liftoff_metrics::MetricsFacade;
use liftoff_state::{
    MetricThreshold, ScalingEvent, ScalingEventKind, ScalingPolicy, StateError, StateStore,
    UpdateDeployment,
};

use crate::evaluator::{Decision, ScaleAction, decide};
use crate::policy::{PolicyError, validate};

/// Errors from autoscaler operations.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("no scaling policy for deployment: {0}")]
    PolicyNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("invalid policy: {0}")]
    Validation(#[from] PolicyError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("scale execution failed: {0}")]
    Execution(String),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

/// Callback type for performing scaling actions.
///
/// The autoscaler calls this with (deployment_id, target_instances).
pub type ScaleExecutor = Arc<dyn Fn(&str, u32) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// Input for creating a policy; ids and timestamps are assigned here.
#[derive(Debug, Clone)]
pub struct PolicyDraft {
    pub deployment_id: String,
    pub thresholds: Vec<MetricThreshold>,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_secs: u64,
    pub min_instances: u32,
    pub max_instances: u32,
}

/// The autoscaler evaluates metrics and decides whether to scale
/// deployments up or down.
#[derive(Clone)]
pub struct Autoscaler {
    state: StateStore,
    metrics: MetricsFacade,
    /// Epoch seconds of the last successful scale, per deployment.
    last_scaled: Arc<RwLock<HashMap<String, u64>>>,
    /// Callback to perform scaling.
    executor: Option<ScaleExecutor>,
}

impl Autoscaler {
    pub fn new(state: StateStore, metrics: MetricsFacade) -> Self {
        Self {
            state,
            metrics,
            last_scaled: Arc::new(RwLock::new(HashMap::new())),
            executor: None,
        }
    }

    /// Set the callback used to perform scaling.
    pub fn with_executor(mut self, executor: ScaleExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate, persist, and activate a policy.
    pub fn create_policy(&self, draft: PolicyDraft) -> AutoscaleResult<ScalingPolicy> {
        let now = epoch_secs() * 1_000;
        let policy = ScalingPolicy {
            id: format!("pol-{}", Uuid::new_v4()),
            deployment_id: draft.deployment_id,
            thresholds: draft.thresholds,
            scale_up_threshold: draft.scale_up_threshold,
            scale_down_threshold: draft.scale_down_threshold,
            cooldown_secs: draft.cooldown_secs,
            min_instances: draft.min_instances,
            max_instances: draft.max_instances,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        let warnings = validate(&policy)?;
        for warning in &warnings {
            warn!(
                deployment = %policy.deployment_id,
                policy = %policy.id,
                "policy warning: {warning}"
            );
        }

        self.state.put_policy(&policy)?;
        info!(
            deployment = %policy.deployment_id,
            policy = %policy.id,
            warnings = warnings.len(),
            "scaling policy created"
        );
        Ok(policy)
    }

    /// Evaluate one deployment. Pure with respect to persistent state.
    ///
    /// Inside the cooldown window the decision is forced to no-change
    /// with reason "cooldown" (score and confidence still reported).
    pub async fn evaluate(&self, deployment_id: &str) -> AutoscaleResult<Decision> {
        let policy = self
            .state
            .get_policy(deployment_id)?
            .ok_or_else(|| AutoscaleError::PolicyNotFound(deployment_id.to_string()))?;
        let record = self
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| AutoscaleError::DeploymentNotFound(deployment_id.to_string()))?;

        let reading = self.metrics.reading(deployment_id);
        let mut decision = decide(&policy, &reading, record.instances);

        let last = {
            let last_scaled = self.last_scaled.read().await;
            last_scaled.get(deployment_id).copied()
        };
        if let Some(last) = last {
            let now = epoch_secs();
            if now.saturating_sub(last) < policy.cooldown_secs {
                decision = Decision {
                    action: ScaleAction::NoChange,
                    target_instances: record.instances,
                    reason: "cooldown".to_string(),
                    ..decision
                };
            }
        }
        Ok(decision)
    }

    /// Scale a deployment by operator fiat: bypasses and clears the
    /// cooldown, records a `manual_override` event. Returns whether the
    /// scale executed.
    pub async fn manual_scale(
        &self,
        deployment_id: &str,
        target: u32,
        reason: &str,
    ) -> AutoscaleResult<bool> {
        let record = self
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| AutoscaleError::DeploymentNotFound(deployment_id.to_string()))?;

        if let Some(ref executor) = self.executor {
            if let Err(e) = executor(deployment_id, target).await {
                error!(%deployment_id, target, error = %e, "manual scale failed");
                return Ok(false);
            }
        }

        self.persist_scale(
            deployment_id,
            record.instances,
            target,
            ScalingEventKind::ManualOverride,
            None,
            reason,
        )?;
        self.last_scaled.write().await.remove(deployment_id);
        info!(%deployment_id, from = record.instances, to = target, "manual scale applied");
        Ok(true)
    }

    /// Evaluate every deployment with an enabled policy and execute the
    /// resulting decisions. Returns (deployment_id, decision) pairs.
    pub async fn tick(&self) -> AutoscaleResult<Vec<(String, Decision)>> {
        let policies = self.state.list_policies()?;
        let mut decisions = Vec::new();

        for policy in policies.iter().filter(|p| p.enabled) {
            let deployment_id = &policy.deployment_id;
            let decision = match self.evaluate(deployment_id).await {
                Ok(d) => d,
                Err(AutoscaleError::DeploymentNotFound(_)) => continue,
                Err(e) => {
                    warn!(%deployment_id, error = %e, "evaluation failed");
                    continue;
                }
            };

            if decision.action != ScaleAction::NoChange {
                self.execute(policy, &decision).await;
            } else {
                debug!(%deployment_id, reason = %decision.reason, "no scaling change");
            }
            decisions.push((deployment_id.clone(), decision));
        }
        Ok(decisions)
    }

    /// Run the autoscaler loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    /// Execute a scale decision: run the callback, then persist and
    /// start the cooldown only on success.
    async fn execute(&self, policy: &ScalingPolicy, decision: &Decision) {
        let deployment_id = &policy.deployment_id;

        if let Some(ref executor) = self.executor {
            if let Err(e) = executor(deployment_id, decision.target_instances).await {
                error!(
                    %deployment_id,
                    target = decision.target_instances,
                    error = %e,
                    "scaling action failed, skipping to next tick"
                );
                return;
            }
        }

        let kind = match decision.action {
            ScaleAction::ScaleUp => ScalingEventKind::ScaleUp,
            ScaleAction::ScaleDown => ScalingEventKind::ScaleDown,
            ScaleAction::NoChange => return,
        };
        let from = self
            .state
            .get_deployment(deployment_id)
            .ok()
            .flatten()
            .map(|d| d.instances)
            .unwrap_or(1);

        if let Err(e) = self.persist_scale(
            deployment_id,
            from,
            decision.target_instances,
            kind,
            Some(policy.id.clone()),
            &decision.reason,
        ) {
            error!(%deployment_id, error = %e, "failed to persist scaling result");
            return;
        }

        self.last_scaled
            .write()
            .await
            .insert(deployment_id.clone(), epoch_secs());
        info!(
            %deployment_id,
            from,
            to = decision.target_instances,
            score = decision.score,
            "scaled"
        );
    }

    fn persist_scale(
        &self,
        deployment_id: &str,
        from: u32,
        to: u32,
        kind: ScalingEventKind,
        policy_id: Option<String>,
        reason: &str,
    ) -> AutoscaleResult<()> {
        let now = epoch_secs() * 1_000;
        self.state.update_deployment(
            deployment_id,
            &UpdateDeployment {
                instances: Some(to),
                ..Default::default()
            },
            now,
        )?;
        self.state.append_scaling_event(&ScalingEvent {
            id: format!("evt-{}", Uuid::new_v4()),
            deployment_id: deployment_id.to_string(),
            policy_id,
            kind,
            from_instances: from,
            to_instances: to,
            reason: reason.to_string(),
            metrics_snapshot: self.metrics.reading(deployment_id),
            created_at: now,
        })?;
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
