//! Failure classification and recovery policy.
//!
//! Every pipeline failure is classified into a kind and severity; the
//! recovery table maps (kind, stage) to retry-with-backoff, a one-shot
//! template fallback, or an abort.

use std::time::Duration;

use thiserror::Error;

use liftoff_sandbox::SandboxError;
use liftoff_state::StateError;

/// Failure kind, driving the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Network,
    Resource,
    Sandbox,
    Unknown,
}

/// How bad a failure is; recorded in logs and error surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the pipeline should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Sleep the backoff, then retry the pipeline.
    Retry { backoff: Duration },
    /// Recreate the sandbox from the lesser-resource template, then retry.
    Fallback,
    /// Give up; the deployment fails.
    Abort,
}

/// Classify a sandbox error into kind and severity.
pub fn classify(err: &SandboxError) -> (FailureKind, Severity) {
    match err {
        SandboxError::Timeout(_) => (FailureKind::Timeout, Severity::High),
        SandboxError::Network(_) => (FailureKind::Network, Severity::Medium),
        SandboxError::Resource(_) => (FailureKind::Resource, Severity::High),
        SandboxError::Sandbox(_) => (FailureKind::Sandbox, Severity::Critical),
        SandboxError::Other(_) => (FailureKind::Unknown, Severity::Medium),
    }
}

/// Exponential backoff: `min(1s · 2^attempt, 30s)`.
pub fn backoff_for(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs.min(30))
}

/// Recovery policy table.
///
/// `attempt` is zero-based; once it reaches `max_retries` everything
/// becomes an abort.
pub fn recovery(
    kind: FailureKind,
    in_provisioning: bool,
    attempt: u32,
    max_retries: u32,
) -> RecoveryAction {
    if attempt >= max_retries {
        return RecoveryAction::Abort;
    }
    match kind {
        FailureKind::Timeout | FailureKind::Unknown => RecoveryAction::Retry {
            backoff: backoff_for(attempt),
        },
        FailureKind::Network => RecoveryAction::Retry {
            backoff: (backoff_for(attempt) * 2).min(Duration::from_secs(30)),
        },
        FailureKind::Resource if in_provisioning => RecoveryAction::Fallback,
        FailureKind::Resource => RecoveryAction::Abort,
        FailureKind::Sandbox => RecoveryAction::Abort,
    }
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("invalid project bundle: {0}")]
    Validation(String),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("deployment failed ({kind:?}/{severity:?}): {message}")]
    Pipeline {
        kind: FailureKind,
        severity: Severity,
        message: String,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Wrap a sandbox error with its classification.
    pub fn from_sandbox(err: &SandboxError) -> Self {
        let (kind, severity) = classify(err);
        OrchestratorError::Pipeline {
            kind,
            severity,
            message: err.to_string(),
        }
    }
}
