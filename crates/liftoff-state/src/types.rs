//! Domain types for the Liftoff state store.
//!
//! These types represent the persisted state of users, projects,
//! deployments, scaling policies, scaling events, resource usage, and
//! optimization recommendations. All types are serializable to/from JSON
//! for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a project.
pub type ProjectId = String;

/// Unique identifier for a user.
pub type UserId = String;

// ── Users & projects ──────────────────────────────────────────────

/// A platform user (owning principal for projects).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    /// Plan tier: "free", "pro", "team".
    pub plan_type: String,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
}

/// A project groups deployments under one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub user_id: UserId,
    pub name: String,
    pub created_at: u64,
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Building,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl DeploymentStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Destroyed)
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// Forward edges follow the pipeline; every non-terminal state may
    /// fail or be destroyed (cancellation, user-cap reaping).
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            (Pending, Provisioning)
            | (Provisioning, Building)
            | (Building, Running)
            | (Running, Stopped)
            | (Stopped, Destroyed) => true,
            (from, Failed) => !from.is_terminal(),
            (from, Destroyed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Destroyed => "destroyed",
        }
    }
}

/// How the uploaded project is turned into a runnable app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Plain Node.js project, run as uploaded.
    GenericNode,
    /// Scaffold synthesized from a `manifest.yaml` entity description.
    ManifestGenerated,
}

/// The central entity: one managed sandbox lifecycle plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub status: DeploymentStatus,
    pub runtime_kind: RuntimeKind,
    /// Opaque sandbox reference; present iff the deployment has ever
    /// entered `provisioning`, cleared on `destroyed`.
    pub sandbox_id: Option<String>,
    /// Set on first entry into `running`; immutable thereafter.
    pub public_url: Option<String>,
    /// Current instance count (reset to 1 on process restart).
    pub instances: u32,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
    /// Updated on every status transition.
    pub updated_at: u64,
    /// Advanced whenever a log flows, a probe succeeds, or a client
    /// touches the deployment.
    pub last_activity_at: u64,
    /// Environment variables injected into the sandbox.
    pub env: HashMap<String, String>,
}

/// Broadcast notification of one status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub previous_status: Option<DeploymentStatus>,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
}

/// Optional-field update applied to a deployment inside one transaction.
#[derive(Debug, Clone, Default)]
pub struct UpdateDeployment {
    pub status: Option<DeploymentStatus>,
    pub sandbox_id: Option<Option<String>>,
    pub public_url: Option<String>,
    pub instances: Option<u32>,
    pub last_activity_at: Option<u64>,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Metric dimension an autoscaling threshold is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    Cpu,
    Memory,
    Requests,
    ResponseTime,
    ErrorRate,
}

/// Comparison operator for a metric threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    /// Apply the comparison: does `value` satisfy it against `threshold`?
    pub fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Gte => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Lte => value <= threshold,
        }
    }
}

/// One weighted threshold inside a scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricThreshold {
    pub metric: ScalingMetric,
    /// Normalized threshold in `[0,1]`.
    pub threshold: f64,
    pub comparison: Comparison,
    /// Weight in `[0,1]`; weights across a policy should sum to ~1.
    pub weight: f64,
}

/// Autoscaling policy, bound to exactly one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: String,
    pub deployment_id: DeploymentId,
    pub thresholds: Vec<MetricThreshold>,
    /// Score above which the policy scales up, in `[0,1]`.
    pub scale_up_threshold: f64,
    /// Score below which the policy scales down, in `[0,1]`.
    pub scale_down_threshold: f64,
    /// Seconds during which further scaling is suppressed after a
    /// successful scale action.
    pub cooldown_secs: u64,
    pub min_instances: u32,
    pub max_instances: u32,
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Kind of a recorded scaling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventKind {
    ScaleUp,
    ScaleDown,
    ManualOverride,
}

/// Append-only audit record of a scaling action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub id: String,
    pub deployment_id: DeploymentId,
    pub policy_id: Option<String>,
    pub kind: ScalingEventKind,
    pub from_instances: u32,
    pub to_instances: u32,
    pub reason: String,
    /// Raw metric values at decision time.
    pub metrics_snapshot: MetricReading,
    pub created_at: u64,
}

// ── Metrics ───────────────────────────────────────────────────────

/// Raw per-deployment metric values as produced by the metrics facade.
///
/// `cpu_pct`/`memory_pct` are percentages (0–100), `error_rate_pct` is a
/// percentage (0–10 is the meaningful band), `requests_per_sec` and
/// `response_time_ms` are in natural units.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricReading {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub requests_per_sec: f64,
    pub response_time_ms: f64,
    pub error_rate_pct: f64,
}

// ── Resource usage ────────────────────────────────────────────────

/// One usage sample in a deployment's 24h ring (5 min spacing).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSample {
    pub deployment_id: DeploymentId,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    /// Bytes transferred since the previous sample.
    pub network_io: u64,
    /// Bytes read/written since the previous sample.
    pub disk_io: u64,
    pub cost_per_hour: f64,
}

// ── Recommendations ───────────────────────────────────────────────

/// What a right-sizing recommendation proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    DownsizeCpu,
    DownsizeMemory,
    UpsizeCpu,
    AggressivePolicy,
}

/// A right-sizing recommendation for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub deployment_id: DeploymentId,
    pub kind: RecommendationKind,
    pub reason: String,
    /// Estimated monthly cost delta in percent; negative is savings.
    pub estimated_cost_delta_pct: f64,
    pub created_at: u64,
}

impl ScalingEvent {
    /// Build the composite key for the scaling_events table.
    ///
    /// `created_at` is zero-padded so lexicographic key order matches
    /// chronological order within one deployment's prefix.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.deployment_id, self.created_at, self.id)
    }
}

impl ResourceSample {
    /// Build the composite key for the resource_usage table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.deployment_id, self.timestamp)
    }
}
