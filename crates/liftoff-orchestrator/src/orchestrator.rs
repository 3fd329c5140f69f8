//! The orchestrator — single writer of deployment state.
//!
//! Drives the deployment state machine (persist first, then publish),
//! owns the sandbox-handle map and per-user concurrency enforcement,
//! runs the pipeline with classified retry/fallback recovery, forwards
//! sandbox output into the LogHub, and reaps aged/idle/orphaned
//! sandboxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use liftoff_loghub::{LogEntry, LogHub, LogLevel, LogSource, NewLogEntry};
use liftoff_metrics::{Counter, MetricsFacade};
use liftoff_sandbox::{
    OutputStream, RunOptions, Sandbox, SandboxError, SandboxProvider,
};
use liftoff_state::{
    DeploymentRecord, DeploymentStatus, MetricReading, StateError, StateStore, StatusChange,
    UpdateDeployment,
};

use crate::error::{
    FailureKind, OrchestratorError, OrchestratorResult, RecoveryAction, Severity, classify,
    recovery,
};
use crate::scaffold::{ProjectFile, classify_runtime, generate, merge_files, parse_manifest};

/// Minimum spacing between activity-timestamp writes from log flow.
const TOUCH_INTERVAL: Duration = Duration::from_secs(10);

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_per_user: usize,
    pub max_retries: u32,
    /// Default wall-clock budget for one deployment.
    pub default_timeout: Duration,
    /// Reaper: sandboxes older than this are reclaimed.
    pub sandbox_max_age: Duration,
    /// Reaper: sandboxes idle longer than this are reclaimed.
    pub sandbox_max_idle: Duration,
    pub reap_interval: Duration,
    pub default_template: String,
    /// Lesser-resource template used when provisioning hits capacity.
    pub fallback_template: String,
    pub default_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_user: 5,
            max_retries: 3,
            default_timeout: Duration::from_secs(300),
            sandbox_max_age: Duration::from_secs(2 * 3_600),
            sandbox_max_idle: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            default_template: "node-18".to_string(),
            fallback_template: "node-18-small".to_string(),
            default_port: 3_000,
        }
    }
}

/// Per-deployment options recognized by `deploy`.
#[derive(Debug, Clone, Default)]
pub struct DeployConfig {
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    pub port: Option<u16>,
}

/// What a successful deploy returns.
#[derive(Debug, Clone)]
pub struct DeploymentHandle {
    pub deployment_id: String,
    pub sandbox_id: String,
    pub public_url: String,
}

/// Snapshot served by `monitor`.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub record: DeploymentRecord,
    pub healthy: bool,
    pub metrics: MetricReading,
    pub recent_logs: Vec<LogEntry>,
}

/// Options for a cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Ignore age/idle thresholds and reap everything matching.
    pub force: bool,
    pub max_age: Option<Duration>,
    pub max_idle: Option<Duration>,
    /// Restrict the sweep to one user's deployments.
    pub user_id: Option<String>,
}

/// Result of a cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub inspected: usize,
    pub reaped: Vec<String>,
}

struct SandboxEntry {
    sandbox: Arc<dyn Sandbox>,
    created_at: u64,
    cancel: CancellationToken,
}

/// Pipeline-internal error, pre-classification.
enum StepError {
    Cancelled,
    Sandbox(SandboxError),
    Fatal(OrchestratorError),
}

impl From<StateError> for StepError {
    fn from(e: StateError) -> Self {
        StepError::Fatal(OrchestratorError::State(e))
    }
}

struct Inner {
    state: StateStore,
    provider: Arc<dyn SandboxProvider>,
    loghub: LogHub,
    metrics: MetricsFacade,
    config: OrchestratorConfig,
    /// deployment_id → live sandbox handle.
    sandboxes: RwLock<HashMap<String, SandboxEntry>>,
    status_tx: broadcast::Sender<StatusChange>,
}

/// Deployment lifecycle manager.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        provider: Arc<dyn SandboxProvider>,
        loghub: LogHub,
        metrics: MetricsFacade,
        config: OrchestratorConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state,
                provider,
                loghub,
                metrics,
                config,
                sandboxes: RwLock::new(HashMap::new()),
                status_tx,
            }),
        }
    }

    /// Subscribe to status transitions across all deployments.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Number of live sandbox handles.
    pub async fn sandbox_count(&self) -> usize {
        self.inner.sandboxes.read().await.len()
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Provision, build, and start a sandbox for the bundle. Returns
    /// once the deployment reaches `running`, or fails.
    pub async fn deploy(
        &self,
        user_id: &str,
        project_id: &str,
        files: Vec<ProjectFile>,
        config: DeployConfig,
    ) -> OrchestratorResult<DeploymentHandle> {
        if self.inner.state.get_user(user_id)?.is_none() {
            return Err(OrchestratorError::UserNotFound(user_id.to_string()));
        }
        let project = self
            .inner
            .state
            .get_project(project_id)?
            .ok_or_else(|| OrchestratorError::ProjectNotFound(project_id.to_string()))?;
        if project.user_id != user_id {
            return Err(OrchestratorError::Validation(format!(
                "project {project_id} is not owned by {user_id}"
            )));
        }
        if files.is_empty() {
            return Err(OrchestratorError::Validation("empty project bundle".to_string()));
        }

        self.enforce_user_limit(user_id).await?;

        let runtime_kind = classify_runtime(&files);
        let files = match runtime_kind {
            liftoff_state::RuntimeKind::ManifestGenerated => {
                let manifest = parse_manifest(&files)
                    .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
                merge_files(files, generate(&manifest))
            }
            liftoff_state::RuntimeKind::GenericNode => files,
        };

        let deployment_id = format!("dep-{}", Uuid::new_v4());
        let now = epoch_ms();
        self.inner.state.put_deployment(&DeploymentRecord {
            id: deployment_id.clone(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            status: DeploymentStatus::Pending,
            runtime_kind,
            sandbox_id: None,
            public_url: None,
            instances: 1,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            env: config.env.clone(),
        })?;
        self.inner.metrics.register(&deployment_id);
        self.log(
            &deployment_id,
            LogLevel::Info,
            LogSource::Deployment,
            &format!("deployment created ({runtime_kind:?})"),
        )
        .await;
        info!(%deployment_id, %user_id, ?runtime_kind, "deployment accepted");

        match self.provision_and_start(&deployment_id, &files, &config).await {
            Ok(handle) => {
                self.inner.metrics.incr(Counter::DeploymentsStarted);
                Ok(handle)
            }
            Err(e) => {
                self.fail_deployment(&deployment_id, &e).await;
                self.inner.metrics.incr(Counter::DeploymentsFailed);
                Err(e)
            }
        }
    }

    /// Retry loop around the pipeline: classify each failure and apply
    /// the recovery policy (backoff retry, template fallback, abort).
    async fn provision_and_start(
        &self,
        deployment_id: &str,
        files: &[ProjectFile],
        config: &DeployConfig,
    ) -> OrchestratorResult<DeploymentHandle> {
        let budget = config.timeout.unwrap_or(self.inner.config.default_timeout);
        let deadline = Instant::now() + budget;
        let port = config.port.unwrap_or(self.inner.config.default_port);
        let cancel = CancellationToken::new();

        self.transition(deployment_id, DeploymentStatus::Provisioning)
            .await?;

        let mut template = self.inner.config.default_template.clone();
        let mut attempt = 0u32;
        loop {
            match self
                .try_pipeline(deployment_id, &template, files, config, port, deadline, &cancel)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(StepError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(StepError::Fatal(e)) => return Err(e),
                Err(StepError::Sandbox(err)) => {
                    let (kind, severity) = classify(&err);
                    let in_provisioning = self
                        .inner
                        .state
                        .get_deployment(deployment_id)?
                        .map(|r| r.status == DeploymentStatus::Provisioning)
                        .unwrap_or(false);
                    let action =
                        recovery(kind, in_provisioning, attempt, self.inner.config.max_retries);
                    self.release_sandbox(deployment_id, true).await;

                    match action {
                        RecoveryAction::Retry { backoff } => {
                            attempt += 1;
                            warn!(
                                %deployment_id,
                                ?kind,
                                attempt,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %err,
                                "pipeline failed, retrying"
                            );
                            self.log(
                                deployment_id,
                                LogLevel::Warn,
                                LogSource::Deployment,
                                &format!("attempt {attempt} failed ({err}), retrying"),
                            )
                            .await;
                            tokio::time::sleep(backoff).await;
                        }
                        RecoveryAction::Fallback => {
                            attempt += 1;
                            template = self.inner.config.fallback_template.clone();
                            warn!(
                                %deployment_id,
                                %template,
                                error = %err,
                                "provisioning hit capacity, falling back"
                            );
                            self.log(
                                deployment_id,
                                LogLevel::Warn,
                                LogSource::Deployment,
                                &format!("falling back to template {template}"),
                            )
                            .await;
                        }
                        RecoveryAction::Abort => {
                            return Err(OrchestratorError::Pipeline {
                                kind,
                                severity,
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::Pipeline {
                    kind: FailureKind::Timeout,
                    severity: Severity::High,
                    message: "deployment budget exhausted".to_string(),
                });
            }
        }
    }

    /// One pipeline attempt: create sandbox, upload, install, start,
    /// obtain the public host, persist, and transition to running.
    #[allow(clippy::too_many_arguments)]
    async fn try_pipeline(
        &self,
        deployment_id: &str,
        template: &str,
        files: &[ProjectFile],
        config: &DeployConfig,
        port: u16,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DeploymentHandle, StepError> {
        let sandbox = step(cancel, self.inner.provider.create(template)).await?;
        let sandbox: Arc<dyn Sandbox> = Arc::from(sandbox);
        let sandbox_id = sandbox.id().to_string();

        {
            let mut sandboxes = self.inner.sandboxes.write().await;
            sandboxes.insert(
                deployment_id.to_string(),
                SandboxEntry {
                    sandbox: Arc::clone(&sandbox),
                    created_at: epoch_ms(),
                    cancel: cancel.clone(),
                },
            );
        }
        self.inner.state.update_deployment(
            deployment_id,
            &UpdateDeployment {
                sandbox_id: Some(Some(sandbox_id.clone())),
                ..Default::default()
            },
            epoch_ms(),
        )?;
        self.spawn_output_forwarder(deployment_id, sandbox.as_ref());
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::Deployment,
            &format!("sandbox {sandbox_id} provisioned from template {template}"),
        )
        .await;

        for file in files {
            step(cancel, sandbox.write_file(&file.path, &file.contents)).await?;
        }
        debug!(%deployment_id, files = files.len(), "bundle uploaded");

        // Install gets half of the remaining budget.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let install_budget = remaining / 2;

        let current = self
            .inner
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| {
                StepError::Fatal(OrchestratorError::DeploymentNotFound(
                    deployment_id.to_string(),
                ))
            })?;
        if current.status == DeploymentStatus::Provisioning {
            self.transition(deployment_id, DeploymentStatus::Building)
                .await
                .map_err(fatal)?;
        }

        let install = step(
            cancel,
            sandbox.run_command(
                "npm install",
                RunOptions {
                    background: false,
                    env: config.env.clone(),
                    timeout: Some(install_budget),
                },
            ),
        )
        .await?;
        if install.exit_code != 0 {
            return Err(StepError::Sandbox(SandboxError::Sandbox(format!(
                "dependency install failed (exit {}): {}",
                install.exit_code, install.stderr
            ))));
        }
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::Build,
            "dependencies installed",
        )
        .await;

        step(
            cancel,
            sandbox.run_command(
                "npm start",
                RunOptions {
                    background: true,
                    env: config.env.clone(),
                    timeout: None,
                },
            ),
        )
        .await?;

        // The public host must exist before we publish `running`.
        let public_url = step(cancel, sandbox.host(port)).await?;
        self.inner.state.update_deployment(
            deployment_id,
            &UpdateDeployment {
                public_url: Some(public_url.clone()),
                ..Default::default()
            },
            epoch_ms(),
        )?;
        self.transition(deployment_id, DeploymentStatus::Running)
            .await
            .map_err(fatal)?;
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::Deployment,
            &format!("running at {public_url}"),
        )
        .await;
        info!(%deployment_id, %sandbox_id, %public_url, "deployment running");

        Ok(DeploymentHandle {
            deployment_id: deployment_id.to_string(),
            sandbox_id,
            public_url,
        })
    }

    // ── Monitor / Cancel ───────────────────────────────────────────

    /// Current status, metrics, and recent logs. Touches activity.
    pub async fn monitor(&self, deployment_id: &str) -> OrchestratorResult<DeploymentReport> {
        let record = self
            .inner
            .state
            .update_deployment(
                deployment_id,
                &UpdateDeployment {
                    last_activity_at: Some(epoch_ms()),
                    ..Default::default()
                },
                epoch_ms(),
            )
            .map_err(|e| match e {
                StateError::NotFound(id) => OrchestratorError::DeploymentNotFound(id),
                other => OrchestratorError::State(other),
            })?;

        let healthy = record.status == DeploymentStatus::Running;
        let metrics = self.inner.metrics.reading(deployment_id);
        let recent_logs = self.inner.loghub.recent(deployment_id, 50).await;
        Ok(DeploymentReport {
            record,
            healthy,
            metrics,
            recent_logs,
        })
    }

    /// Transition to `destroyed` and release the sandbox. Idempotent:
    /// returns whether the deployment ends up destroyed.
    pub async fn cancel(&self, deployment_id: &str) -> OrchestratorResult<bool> {
        let record = self
            .inner
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(deployment_id.to_string()))?;

        match record.status {
            DeploymentStatus::Destroyed => return Ok(true),
            DeploymentStatus::Failed => return Ok(false),
            _ => {}
        }

        // Abort any in-flight pipeline, then release in a detached task.
        self.release_sandbox(deployment_id, true).await;
        self.transition(deployment_id, DeploymentStatus::Destroyed)
            .await?;
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::Deployment,
            "deployment cancelled",
        )
        .await;
        self.inner.metrics.unregister(deployment_id);
        info!(%deployment_id, "deployment cancelled");
        Ok(true)
    }

    // ── Scaling surface ────────────────────────────────────────────

    /// Execute a scale decision against a live deployment. Used as the
    /// autoscaler's executor; failures never poison deployment state.
    pub async fn set_instances(&self, deployment_id: &str, target: u32) -> OrchestratorResult<()> {
        let record = self
            .inner
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(deployment_id.to_string()))?;
        if record.status != DeploymentStatus::Running {
            return Err(OrchestratorError::Validation(format!(
                "cannot scale deployment in status {}",
                record.status.as_str()
            )));
        }
        let has_sandbox = {
            let sandboxes = self.inner.sandboxes.read().await;
            sandboxes.contains_key(deployment_id)
        };
        if !has_sandbox {
            return Err(OrchestratorError::Validation(
                "no live sandbox for deployment".to_string(),
            ));
        }
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::System,
            &format!("scaled from {} to {target} instances", record.instances),
        )
        .await;
        Ok(())
    }

    // ── Cleanup & reaping ──────────────────────────────────────────

    /// Sweep tracked sandboxes, reaping aged/idle/terminal/orphaned
    /// ones. Forced sweeps ignore thresholds.
    pub async fn cleanup_sandboxes(
        &self,
        opts: CleanupOptions,
    ) -> OrchestratorResult<CleanupReport> {
        let now = epoch_ms();
        let max_age_ms =
            opts.max_age.unwrap_or(self.inner.config.sandbox_max_age).as_millis() as u64;
        let max_idle_ms =
            opts.max_idle.unwrap_or(self.inner.config.sandbox_max_idle).as_millis() as u64;

        let tracked: Vec<(String, u64)> = {
            let sandboxes = self.inner.sandboxes.read().await;
            sandboxes
                .iter()
                .map(|(id, entry)| (id.clone(), entry.created_at))
                .collect()
        };

        let mut report = CleanupReport {
            inspected: tracked.len(),
            reaped: Vec::new(),
        };
        for (deployment_id, created_at) in tracked {
            let record = self.inner.state.get_deployment(&deployment_id)?;

            if let Some(ref filter) = opts.user_id {
                match &record {
                    Some(r) if &r.user_id == filter => {}
                    // Orphans have no owner; a user filter skips them.
                    _ => continue,
                }
            }

            let reap = match &record {
                None => true, // Orphan: no deployment record.
                Some(r) if r.status.is_terminal() => true,
                Some(r) => {
                    opts.force
                        || now.saturating_sub(created_at) > max_age_ms
                        || now.saturating_sub(r.last_activity_at) > max_idle_ms
                }
            };
            if reap {
                self.reap(&deployment_id, record.as_ref()).await;
                report.reaped.push(deployment_id);
            }
        }
        if !report.reaped.is_empty() {
            info!(
                inspected = report.inspected,
                reaped = report.reaped.len(),
                "sandbox cleanup pass"
            );
        }
        Ok(report)
    }

    /// Run the periodic reaper with the configured thresholds.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.inner.config.reap_interval.as_secs(),
            "sandbox reaper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.reap_interval) => {
                    if let Err(e) = self.cleanup_sandboxes(CleanupOptions::default()).await {
                        error!(error = %e, "sandbox cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("sandbox reaper shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal ───────────────────────────────────────────────────

    /// Destroy one sandbox and persist `destroyed` for its deployment.
    async fn reap(&self, deployment_id: &str, record: Option<&DeploymentRecord>) {
        let entry = {
            let mut sandboxes = self.inner.sandboxes.write().await;
            sandboxes.remove(deployment_id)
        };
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Err(e) = entry.sandbox.destroy().await {
                warn!(%deployment_id, error = %e, "sandbox destroy failed (best effort)");
            }
        }
        if let Some(record) = record {
            if !record.status.is_terminal() {
                if let Err(e) = self
                    .transition(deployment_id, DeploymentStatus::Destroyed)
                    .await
                {
                    warn!(%deployment_id, error = %e, "failed to persist reap");
                }
            }
        }
        self.inner.metrics.unregister(deployment_id);
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::System,
            "sandbox reaped",
        )
        .await;
    }

    /// Keep a user under the concurrency cap by force-destroying their
    /// oldest non-terminal deployments (created_at, then id).
    async fn enforce_user_limit(&self, user_id: &str) -> OrchestratorResult<()> {
        let mut active: Vec<DeploymentRecord> = self
            .inner
            .state
            .list_deployments_for_user(user_id)?
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .collect();
        if active.len() < self.inner.config.max_concurrent_per_user {
            return Ok(());
        }

        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let excess = active.len() + 1 - self.inner.config.max_concurrent_per_user;
        for oldest in active.iter().take(excess) {
            warn!(
                %user_id,
                deployment_id = %oldest.id,
                cap = self.inner.config.max_concurrent_per_user,
                "user at concurrency cap, reaping oldest deployment"
            );
            self.reap(&oldest.id, Some(oldest)).await;
        }
        Ok(())
    }

    /// Persist a transition, then publish the status event and a log
    /// entry. An illegal transition is a bug: logged loudly, never
    /// swallowed.
    async fn transition(
        &self,
        deployment_id: &str,
        next: DeploymentStatus,
    ) -> OrchestratorResult<DeploymentRecord> {
        let previous = self
            .inner
            .state
            .get_deployment(deployment_id)?
            .map(|r| r.status);

        let record = match self
            .inner
            .state
            .transition_deployment(deployment_id, next, epoch_ms())
        {
            Ok(record) => record,
            Err(StateError::IllegalTransition(msg)) => {
                error!(%deployment_id, %msg, "illegal status transition attempted");
                return Err(OrchestratorError::State(StateError::IllegalTransition(msg)));
            }
            Err(e) => return Err(OrchestratorError::State(e)),
        };

        let change = StatusChange {
            deployment_id: deployment_id.to_string(),
            status: next,
            previous_status: previous,
            timestamp: record.updated_at,
        };
        let _ = self.inner.status_tx.send(change);
        self.log(
            deployment_id,
            LogLevel::Info,
            LogSource::Deployment,
            &format!(
                "status: {} -> {}",
                previous.map(|s| s.as_str()).unwrap_or("?"),
                next.as_str()
            ),
        )
        .await;
        Ok(record)
    }

    /// Mark a deployment failed and release its sandbox.
    async fn fail_deployment(&self, deployment_id: &str, err: &OrchestratorError) {
        error!(%deployment_id, error = %err, "deployment failed");
        self.log(
            deployment_id,
            LogLevel::Error,
            LogSource::Deployment,
            &format!("deployment failed: {err}"),
        )
        .await;
        self.release_sandbox(deployment_id, true).await;

        let current = self
            .inner
            .state
            .get_deployment(deployment_id)
            .ok()
            .flatten()
            .map(|r| r.status);
        if let Some(status) = current {
            if !status.is_terminal() {
                if let Err(e) = self
                    .transition(deployment_id, DeploymentStatus::Failed)
                    .await
                {
                    error!(%deployment_id, error = %e, "failed to persist failure");
                }
            }
        }
    }

    /// Remove the sandbox entry; optionally destroy it in a detached
    /// task. Destruction is best-effort.
    async fn release_sandbox(&self, deployment_id: &str, destroy: bool) {
        let entry = {
            let mut sandboxes = self.inner.sandboxes.write().await;
            sandboxes.remove(deployment_id)
        };
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if destroy {
                let sandbox = entry.sandbox;
                let id = deployment_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = sandbox.destroy().await {
                        debug!(deployment_id = %id, error = %e, "detached sandbox destroy failed");
                    }
                });
            }
        }
    }

    /// Forward sandbox stdout/stderr into the LogHub, advancing
    /// activity at most once per `TOUCH_INTERVAL`.
    fn spawn_output_forwarder(&self, deployment_id: &str, sandbox: &dyn Sandbox) {
        let mut output = sandbox.subscribe_output();
        let loghub = self.inner.loghub.clone();
        let state = self.inner.state.clone();
        let deployment_id = deployment_id.to_string();
        tokio::spawn(async move {
            let mut last_touch: Option<Instant> = None;
            loop {
                let chunk = match output.recv().await {
                    Ok(chunk) => chunk,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let level = match chunk.stream {
                    OutputStream::Stdout => LogLevel::Info,
                    OutputStream::Stderr => LogLevel::Warn,
                };
                loghub
                    .append(NewLogEntry::new(
                        &deployment_id,
                        level,
                        LogSource::Application,
                        &chunk.line,
                    ))
                    .await;

                let due = last_touch.is_none_or(|t| t.elapsed() >= TOUCH_INTERVAL);
                if due {
                    let now = epoch_ms();
                    let _ = state.update_deployment(
                        &deployment_id,
                        &UpdateDeployment {
                            last_activity_at: Some(now),
                            ..Default::default()
                        },
                        now,
                    );
                    last_touch = Some(Instant::now());
                }
            }
        });
    }

    async fn log(&self, deployment_id: &str, level: LogLevel, source: LogSource, message: &str) {
        self.inner
            .loghub
            .append(NewLogEntry::new(deployment_id, level, source, message))
            .await;
    }
}

/// Race a sandbox call against the cancellation token.
async fn step<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SandboxError>>,
) -> Result<T, StepError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = fut => result.map_err(StepError::Sandbox),
    }
}

fn fatal(e: OrchestratorError) -> StepError {
    StepError::Fatal(e)
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
    use liftoff_loghub::LogHubConfig;
    use liftoff_sandbox::MockSandboxProvider;
    use liftoff_state::{ProjectRecord, RuntimeKind, UserRecord};

    fn seed_principals(state: &StateStore, user_id: &str, project_id: &str) {
        state
            .put_user(&UserRecord {
                id: user_id.to_string(),
                email: format!("{user_id}@example.com"),
                plan_type: "pro".to_string(),
                created_at: 0,
            })
            .unwrap();
        state
            .put_project(&ProjectRecord {
                id: project_id.to_string(),
                user_id: user_id.to_string(),
                name: project_id.to_string(),
                created_at: 0,
            })
            .unwrap();
    }

    fn harness(config: OrchestratorConfig) -> (Orchestrator, MockSandboxProvider, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        let provider = MockSandboxProvider::new();
        let orchestrator = Orchestrator::new(
            state.clone(),
            Arc::new(provider.clone()),
            LogHub::new(LogHubConfig::default()),
            MetricsFacade::new(),
            config,
        );
        (orchestrator, provider, state)
    }

    fn node_bundle() -> Vec<ProjectFile> {
        vec![
            ProjectFile::new("index.js", "console.log('hi')"),
            ProjectFile::new("package.json", r#"{"name":"app"}"#),
        ]
    }

    const MANIFEST: &str = r#"
name: blog
entities:
  - name: Post
    fields:
      - name: title
        type: text
        required: true
      - name: body
        type: longtext
"#;

    #[tokio::test]
    async fn successful_generic_deploy_reaches_running() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let mut status_rx = orch.subscribe_status();

        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let record = state.get_deployment(&handle.deployment_id).unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
        assert_eq!(record.runtime_kind, RuntimeKind::GenericNode);
        assert_eq!(record.sandbox_id.as_deref(), Some(handle.sandbox_id.as_str()));
        assert_eq!(record.public_url.as_deref(), Some(handle.public_url.as_str()));
        assert!(handle.public_url.ends_with(":3000"));

        let sandbox = &provider.created()[0];
        let files = sandbox.files();
        assert!(files.contains_key("index.js"));
        assert!(files.contains_key("package.json"));
        let commands = sandbox.commands();
        assert_eq!(commands, vec!["npm install".to_string(), "npm start".to_string()]);

        // The status stream announces provisioning, building, running.
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(status_rx.recv().await.unwrap());
        }
        assert_eq!(
            seen.iter().map(|c| c.status).collect::<Vec<_>>(),
            vec![
                DeploymentStatus::Provisioning,
                DeploymentStatus::Building,
                DeploymentStatus::Running
            ]
        );
        let last = &seen[2];
        assert_eq!(last.previous_status, Some(DeploymentStatus::Building));
    }

    #[tokio::test]
    async fn manifest_deploy_uploads_generated_scaffold() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");

        let bundle = vec![ProjectFile::new("manifest.yaml", MANIFEST)];
        let handle = orch
            .deploy("u1", "p1", bundle, DeployConfig::default())
            .await
            .unwrap();

        let record = state.get_deployment(&handle.deployment_id).unwrap().unwrap();
        assert_eq!(record.runtime_kind, RuntimeKind::ManifestGenerated);

        let files = provider.created()[0].files();
        for path in ["package.json", "index.js", "database.js", "README.md", "manifest.yaml"] {
            assert!(files.contains_key(path), "missing {path}");
        }
    }

    #[tokio::test]
    async fn user_cap_reaps_oldest_deployment() {
        let (orch, provider, state) = harness(OrchestratorConfig {
            max_concurrent_per_user: 2,
            ..Default::default()
        });
        seed_principals(&state, "u1", "p1");

        // Spaced out so created_at strictly orders them.
        let d1 = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let d2 = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let d3 = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let r1 = state.get_deployment(&d1.deployment_id).unwrap().unwrap();
        assert_eq!(r1.status, DeploymentStatus::Destroyed);
        assert_eq!(r1.sandbox_id, None);
        assert!(provider.created()[0].is_destroyed());

        let active: Vec<String> = state
            .list_deployments_for_user("u1")
            .unwrap()
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .map(|d| d.id)
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&d2.deployment_id));
        assert!(active.contains(&d3.deployment_id));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_during_provisioning_is_retried() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        provider.fail_next_create(SandboxError::Timeout(Duration::from_secs(300)));

        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let record = state.get_deployment(&handle.deployment_id).unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
        assert_eq!(provider.created().len(), 1); // First create never produced a sandbox.
    }

    #[tokio::test]
    async fn resource_pressure_falls_back_to_lesser_template() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        provider.fail_create_for_template(
            "node-18",
            SandboxError::Resource("no capacity".to_string()),
        );

        orch.deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        assert_eq!(provider.created()[0].template(), "node-18-small");
    }

    #[tokio::test]
    async fn sandbox_failure_aborts_to_failed() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        provider.fail_commands_matching(
            "npm install",
            SandboxError::Sandbox("runtime crashed".to_string()),
        );

        let err = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Pipeline {
                kind: FailureKind::Sandbox,
                ..
            }
        ));

        let records = state.list_deployments().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        assert_eq!(orch.sandbox_count().await, 0);
    }

    #[tokio::test]
    async fn bad_manifest_is_a_validation_error() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");

        let bundle = vec![ProjectFile::new("manifest.yaml", "entities: []")];
        let err = orch
            .deploy("u1", "p1", bundle, DeployConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        // Nothing was persisted.
        assert!(state.list_deployments().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        assert!(orch.cancel(&handle.deployment_id).await.unwrap());
        assert!(orch.cancel(&handle.deployment_id).await.unwrap());

        let record = state.get_deployment(&handle.deployment_id).unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Destroyed);
        assert_eq!(record.sandbox_id, None);

        // Detached destroy is best-effort; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(provider.created()[0].is_destroyed());
    }

    #[tokio::test]
    async fn cancel_of_failed_deployment_returns_false() {
        let (orch, provider, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        provider.fail_commands_matching(
            "npm install",
            SandboxError::Sandbox("crash".to_string()),
        );
        let _ = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap_err();

        let id = state.list_deployments().unwrap()[0].id.clone();
        assert!(!orch.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn monitor_reports_and_touches() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let before = state
            .get_deployment(&handle.deployment_id)
            .unwrap()
            .unwrap()
            .last_activity_at;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = orch.monitor(&handle.deployment_id).await.unwrap();
        assert!(report.healthy);
        assert!(!report.recent_logs.is_empty());
        assert!(report.record.last_activity_at >= before);

        assert!(matches!(
            orch.monitor("ghost").await.unwrap_err(),
            OrchestratorError::DeploymentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn cleanup_reaps_terminal_and_orphaned_sandboxes() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        // Make the deployment terminal behind the orchestrator's back.
        state
            .transition_deployment(&handle.deployment_id, DeploymentStatus::Stopped, epoch_ms())
            .unwrap();
        state
            .transition_deployment(&handle.deployment_id, DeploymentStatus::Destroyed, epoch_ms())
            .unwrap();

        let report = orch
            .cleanup_sandboxes(CleanupOptions::default())
            .await
            .unwrap();
        assert_eq!(report.inspected, 1);
        assert_eq!(report.reaped, vec![handle.deployment_id.clone()]);
        assert_eq!(orch.sandbox_count().await, 0);
    }

    #[tokio::test]
    async fn forced_cleanup_honors_user_filter() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        seed_principals(&state, "u2", "p2");
        let d1 = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();
        let d2 = orch
            .deploy("u2", "p2", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let report = orch
            .cleanup_sandboxes(CleanupOptions {
                force: true,
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.reaped, vec![d1.deployment_id.clone()]);

        let r2 = state.get_deployment(&d2.deployment_id).unwrap().unwrap();
        assert_eq!(r2.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn fresh_active_sandboxes_survive_default_cleanup() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        let report = orch
            .cleanup_sandboxes(CleanupOptions::default())
            .await
            .unwrap();
        assert!(report.reaped.is_empty());
        let record = state.get_deployment(&handle.deployment_id).unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn scaling_requires_a_running_deployment() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        seed_principals(&state, "u1", "p1");
        let handle = orch
            .deploy("u1", "p1", node_bundle(), DeployConfig::default())
            .await
            .unwrap();

        orch.set_instances(&handle.deployment_id, 3).await.unwrap();

        orch.cancel(&handle.deployment_id).await.unwrap();
        assert!(matches!(
            orch.set_instances(&handle.deployment_id, 4).await.unwrap_err(),
            OrchestratorError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn deploy_for_unknown_principals_fails_fast() {
        let (orch, _, state) = harness(OrchestratorConfig::default());
        assert!(matches!(
            orch.deploy("ghost", "p1", node_bundle(), DeployConfig::default())
                .await
                .unwrap_err(),
            OrchestratorError::UserNotFound(_)
        ));

        seed_principals(&state, "u1", "p1");
        assert!(matches!(
            orch.deploy("u1", "nope", node_bundle(), DeployConfig::default())
                .await
                .unwrap_err(),
            OrchestratorError::ProjectNotFound(_)
        ));
    }
}
