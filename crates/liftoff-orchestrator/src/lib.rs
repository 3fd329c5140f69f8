//! liftoff-orchestrator — the deployment lifecycle core.
//!
//! The orchestrator is the single writer of deployment state. It
//! classifies uploaded bundles (plain Node vs manifest-scaffolded),
//! provisions sandboxes through the external provider, runs the
//! upload/install/start pipeline with classified retry and fallback
//! recovery, enforces per-user concurrency caps by reaping the oldest
//! deployment, forwards sandbox output into the LogHub, and sweeps
//! aged, idle, terminal, and orphaned sandboxes.
//!
//! Every status transition persists first, then publishes an in-memory
//! `StatusChange` event and a `deployment`-source log entry.

pub mod error;
pub mod orchestrator;
pub mod scaffold;

pub use error::{
    FailureKind, OrchestratorError, OrchestratorResult, RecoveryAction, Severity, classify,
    recovery,
};
pub use orchestrator::{
    CleanupOptions, CleanupReport, DeployConfig, DeploymentHandle, DeploymentReport, Orchestrator,
    OrchestratorConfig,
};
pub use scaffold::{Manifest, ProjectFile, ScaffoldError, classify_runtime, generate, merge_files};
