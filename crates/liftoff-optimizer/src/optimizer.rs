//! Resource optimizer service — usage sampling, analytics, budgets,
//! and recommendation refresh.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

use liftoff_metrics::MetricsFacade;
use liftoff_state::{
    DeploymentStatus, Recommendation, ResourceSample, StateError, StateStore,
};

use crate::analytics::{Analytics, analyze};
use crate::budget::{BudgetAlert, BudgetConfig, BudgetTracker, month_key, month_start_ms};
use crate::recommend::recommendations;

/// Estimated wire bytes per request; the sandbox runtime reports no io
/// counters, so network volume is derived from request rate.
const EST_BYTES_PER_REQUEST: f64 = 1_500.0;

/// Errors from optimizer operations.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Optimizer tuning knobs.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Spacing between usage samples.
    pub sample_interval: Duration,
    /// In-memory ring capacity per deployment (24h at 5 min spacing).
    pub ring_capacity: usize,
    /// Base dollar rate per instance-hour for the cost model.
    pub instance_hour_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(300),
            ring_capacity: 288,
            instance_hour_rate: 0.05,
        }
    }
}

/// Aggregates usage, computes cost and efficiency, emits budget alerts,
/// and generates right-sizing recommendations.
#[derive(Clone)]
pub struct ResourceOptimizer {
    state: StateStore,
    metrics: MetricsFacade,
    config: OptimizerConfig,
    rings: Arc<RwLock<HashMap<String, VecDeque<ResourceSample>>>>,
    budgets: Arc<RwLock<BudgetTracker>>,
    alert_tx: broadcast::Sender<BudgetAlert>,
}

impl ResourceOptimizer {
    pub fn new(state: StateStore, metrics: MetricsFacade, config: OptimizerConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(64);
        Self {
            state,
            metrics,
            config,
            rings: Arc::new(RwLock::new(HashMap::new())),
            budgets: Arc::new(RwLock::new(BudgetTracker::default())),
            alert_tx,
        }
    }

    /// Set the monthly budget for a deployment.
    pub async fn set_budget(&self, deployment_id: &str, config: BudgetConfig) {
        self.budgets.write().await.set_budget(deployment_id, config);
    }

    /// Subscribe to budget alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<BudgetAlert> {
        self.alert_tx.subscribe()
    }

    /// Collect one usage sample for a deployment: append to the ring,
    /// persist, and run the budget check.
    pub async fn track_usage(&self, deployment_id: &str) -> OptimizerResult<ResourceSample> {
        let record = self
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| OptimizerError::DeploymentNotFound(deployment_id.to_string()))?;

        let now = epoch_ms();
        let reading = self.metrics.reading(deployment_id);
        let interval_secs = self.config.sample_interval.as_secs_f64();
        let sample = ResourceSample {
            deployment_id: deployment_id.to_string(),
            timestamp: now,
            cpu_pct: reading.cpu_pct,
            memory_pct: reading.memory_pct,
            network_io: (reading.requests_per_sec * interval_secs * EST_BYTES_PER_REQUEST) as u64,
            disk_io: 0,
            cost_per_hour: record.instances as f64 * self.config.instance_hour_rate,
        };

        self.state.put_sample(&sample)?;
        {
            let mut rings = self.rings.write().await;
            let ring = rings.entry(deployment_id.to_string()).or_default();
            ring.push_back(sample.clone());
            while ring.len() > self.config.ring_capacity {
                ring.pop_front();
            }
        }

        self.check_budget(deployment_id, now).await?;
        debug!(%deployment_id, cpu = sample.cpu_pct, "usage sample recorded");
        Ok(sample)
    }

    /// Current in-memory ring for a deployment.
    pub async fn ring(&self, deployment_id: &str) -> Vec<ResourceSample> {
        let rings = self.rings.read().await;
        rings
            .get(deployment_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Analytics over the persisted samples in `[start, end]`.
    pub fn cost_analytics(
        &self,
        deployment_id: &str,
        start: u64,
        end: u64,
    ) -> OptimizerResult<Analytics> {
        let samples = self.state.list_samples(deployment_id, start, end)?;
        Ok(analyze(
            deployment_id,
            &samples,
            start,
            end,
            self.config.sample_interval.as_secs_f64() / 3_600.0,
        ))
    }

    /// Recompute and persist recommendations from the last 24 hours.
    pub fn refresh_recommendations(
        &self,
        deployment_id: &str,
    ) -> OptimizerResult<Vec<Recommendation>> {
        let now = epoch_ms();
        let day_ago = now.saturating_sub(24 * 3_600 * 1_000);
        let analytics = self.cost_analytics(deployment_id, day_ago, now)?;
        let recs = recommendations(&analytics, now);
        self.state.put_recommendations(deployment_id, &recs)?;
        Ok(recs)
    }

    /// Drop in-memory state for a deployment (ring + budget).
    pub async fn forget(&self, deployment_id: &str) {
        self.rings.write().await.remove(deployment_id);
        self.budgets.write().await.remove(deployment_id);
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sample_interval.as_secs(),
            "resource optimizer started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sample_interval) => {
                    if let Err(e) = self.sample_all().await {
                        error!(error = %e, "usage sampling sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource optimizer shutting down");
                    break;
                }
            }
        }
    }

    /// Sample every running deployment and refresh its recommendations.
    pub async fn sample_all(&self) -> OptimizerResult<()> {
        let deployments = self.state.list_deployments()?;
        let now = epoch_ms();
        let day_ago = now.saturating_sub(24 * 3_600 * 1_000);

        for record in deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Running)
        {
            if let Err(e) = self.track_usage(&record.id).await {
                warn!(deployment_id = %record.id, error = %e, "usage sample failed");
                continue;
            }
            if let Err(e) = self.refresh_recommendations(&record.id) {
                warn!(deployment_id = %record.id, error = %e, "recommendation refresh failed");
            }
            // Keep the persisted history aligned with the 24h ring.
            let _ = self.state.prune_samples_before(&record.id, day_ago);
        }
        Ok(())
    }

    /// Sum this month's cost and fire threshold alerts at most once per
    /// threshold per month.
    async fn check_budget(&self, deployment_id: &str, now: u64) -> OptimizerResult<()> {
        let month = month_key(now);
        let samples = self
            .state
            .list_samples(deployment_id, month_start_ms(now), now)?;
        let interval_hours = self.config.sample_interval.as_secs_f64() / 3_600.0;
        let spent: f64 = samples.iter().map(|s| s.cost_per_hour * interval_hours).sum();

        let alert = {
            let mut budgets = self.budgets.write().await;
            budgets.check(deployment_id, &month, spent)
        };
        if let Some(alert) = alert {
            warn!(
                %deployment_id,
                level = ?alert.level,
                spent = alert.spent_usd,
                limit = alert.limit_usd,
                "budget threshold crossed"
            );
            let _ = self.alert_tx.send(alert);
        }
        Ok(())
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLevel;
    use liftoff_state::{DeploymentRecord, ProjectRecord, RuntimeKind, UserRecord};
    use std::collections::HashMap as StdHashMap;

    fn seed(state: &StateStore, deployment_id: &str, instances: u32) {
        state
            .put_user(&UserRecord {
                id: "u1".to_string(),
                email: "u1@example.com".to_string(),
                plan_type: "pro".to_string(),
                created_at: 0,
            })
            .unwrap();
        state
            .put_project(&ProjectRecord {
                id: "p1".to_string(),
                user_id: "u1".to_string(),
                name: "p1".to_string(),
                created_at: 0,
            })
            .unwrap();
        state
            .put_deployment(&DeploymentRecord {
                id: deployment_id.to_string(),
                project_id: "p1".to_string(),
                user_id: "u1".to_string(),
                status: DeploymentStatus::Running,
                runtime_kind: RuntimeKind::GenericNode,
                sandbox_id: Some("sb1".to_string()),
                public_url: Some("https://sb1.mock.host:3000".to_string()),
                instances,
                created_at: 0,
                updated_at: 0,
                last_activity_at: 0,
                env: StdHashMap::new(),
            })
            .unwrap();
    }

    fn optimizer(state: StateStore, metrics: MetricsFacade) -> ResourceOptimizer {
        ResourceOptimizer::new(state, metrics, OptimizerConfig::default())
    }

    #[tokio::test]
    async fn track_usage_persists_and_fills_ring() {
        let state = StateStore::open_in_memory().unwrap();
        seed(&state, "d1", 2);
        let metrics = MetricsFacade::new();
        metrics.register("d1");
        metrics.set_resource_usage("d1", 55.0, 45.0);

        let opt = optimizer(state.clone(), metrics);
        let sample = opt.track_usage("d1").await.unwrap();

        assert_eq!(sample.cpu_pct, 55.0);
        assert_eq!(sample.cost_per_hour, 2.0 * 0.05);
        assert_eq!(opt.ring("d1").await.len(), 1);
        assert_eq!(state.list_samples("d1", 0, u64::MAX).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let state = StateStore::open_in_memory().unwrap();
        seed(&state, "d1", 1);
        let metrics = MetricsFacade::new();
        metrics.register("d1");

        let opt = ResourceOptimizer::new(
            state,
            metrics,
            OptimizerConfig {
                ring_capacity: 3,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            opt.track_usage("d1").await.unwrap();
        }
        assert_eq!(opt.ring("d1").await.len(), 3);
    }

    #[tokio::test]
    async fn unknown_deployment_is_an_error() {
        let state = StateStore::open_in_memory().unwrap();
        let opt = optimizer(state, MetricsFacade::new());
        assert!(matches!(
            opt.track_usage("nope").await.unwrap_err(),
            OptimizerError::DeploymentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn budget_alert_fires_once_per_month() {
        let state = StateStore::open_in_memory().unwrap();
        seed(&state, "d1", 100); // 100 instances × $0.05/h = $5/h.
        let metrics = MetricsFacade::new();
        metrics.register("d1");

        let opt = optimizer(state, metrics);
        opt.set_budget(
            "d1",
            BudgetConfig {
                monthly_limit_usd: 0.5,
                warning_pct: 80.0,
                critical_pct: 95.0,
            },
        )
        .await;
        let mut alerts = opt.subscribe_alerts();

        // Each sample adds 5 $/h × (1/12) h ≈ $0.42: the first crosses
        // warning (0.40), the second crosses critical (0.475).
        opt.track_usage("d1").await.unwrap();
        opt.track_usage("d1").await.unwrap();

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.level, BudgetLevel::Warning);
        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.level, BudgetLevel::Critical);

        // Further samples stay silent this month.
        opt.track_usage("d1").await.unwrap();
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn recommendations_are_persisted() {
        let state = StateStore::open_in_memory().unwrap();
        seed(&state, "d1", 1);
        let metrics = MetricsFacade::new();
        metrics.register("d1");
        metrics.set_resource_usage("d1", 10.0, 20.0); // Idle.

        let opt = optimizer(state.clone(), metrics);
        opt.track_usage("d1").await.unwrap();
        let recs = opt.refresh_recommendations("d1").unwrap();

        assert!(!recs.is_empty());
        assert_eq!(state.get_recommendations("d1").unwrap(), recs);
    }

    #[tokio::test]
    async fn sample_all_skips_non_running() {
        let state = StateStore::open_in_memory().unwrap();
        seed(&state, "d1", 1);
        let metrics = MetricsFacade::new();
        metrics.register("d1");

        let opt = optimizer(state.clone(), metrics);
        opt.sample_all().await.unwrap();
        assert_eq!(opt.ring("d1").await.len(), 1);

        state
            .transition_deployment("d1", DeploymentStatus::Stopped, 2)
            .unwrap();
        opt.sample_all().await.unwrap();
        assert_eq!(opt.ring("d1").await.len(), 1); // Unchanged.
    }
}
