//! liftoff-sandbox — the sandbox collaborator seam.
//!
//! The cloud runtime that actually hosts user code is external to the
//! control plane; this crate defines the capability set the orchestrator
//! consumes (`SandboxProvider` / `Sandbox`) and a fully in-memory mock
//! used by tests and the daemon's dev mode.
//!
//! Errors are typed (`SandboxError`) so the orchestrator can classify
//! failures into its recovery taxonomy without string-matching.

pub mod mock;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use mock::{FailureScript, MockSandboxProvider};

/// Errors from sandbox operations.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("insufficient resources: {0}")]
    Resource(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("sandbox error: {0}")]
    Other(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Options for running a command inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run detached; the call returns immediately with a pid.
    pub background: bool,
    /// Environment variables visible to the command.
    pub env: HashMap<String, String>,
    /// Wall-clock budget for foreground commands.
    pub timeout: Option<Duration>,
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Present for background commands.
    pub pid: Option<u32>,
}

/// One line of sandbox output, tagged with its stream.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub line: String,
}

/// Which stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An isolated execution environment holding a process, its files, and a
/// reachable network port.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Opaque sandbox identifier assigned by the provider.
    fn id(&self) -> &str;

    /// Idempotent overwrite of a file inside the sandbox.
    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()>;

    /// Run a command. Foreground blocks until exit; background returns a pid.
    async fn run_command(&self, cmd: &str, opts: RunOptions) -> SandboxResult<CommandOutput>;

    /// Return the external URL routing to the given internal port.
    async fn host(&self, port: u16) -> SandboxResult<String>;

    /// Best-effort termination.
    async fn destroy(&self) -> SandboxResult<()>;

    /// Subscribe to the sandbox's stdout/stderr stream.
    fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk>;
}

/// Factory for sandboxes; the only entry point the orchestrator needs.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new sandbox from the named template.
    async fn create(&self, template: &str) -> SandboxResult<Box<dyn Sandbox>>;
}
