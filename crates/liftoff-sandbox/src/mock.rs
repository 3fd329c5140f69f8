//! In-memory mock sandbox provider.
//!
//! Used by unit and integration tests and by the daemon's dev mode.
//! Failures are scriptable per call or per template so recovery paths
//! (retry, fallback, abort) can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    CommandOutput, OutputChunk, OutputStream, RunOptions, Sandbox, SandboxError, SandboxProvider,
    SandboxResult,
};

/// Scripted failures for a mock provider.
#[derive(Default)]
pub struct FailureScript {
    /// Errors returned by successive `create()` calls, regardless of template.
    create_failures: Mutex<VecDeque<SandboxError>>,
    /// Per-template create failures (consumed before the global queue).
    template_failures: Mutex<HashMap<String, VecDeque<SandboxError>>>,
    /// Commands containing any of these substrings fail with the mapped error.
    command_failures: Mutex<Vec<(String, SandboxError)>>,
    /// Error returned by `host()`, if set.
    host_failure: Mutex<Option<SandboxError>>,
}

impl FailureScript {
    fn next_create_failure(&self, template: &str) -> Option<SandboxError> {
        let mut by_template = self.template_failures.lock().unwrap();
        if let Some(queue) = by_template.get_mut(template) {
            if let Some(err) = queue.pop_front() {
                return Some(err);
            }
        }
        self.create_failures.lock().unwrap().pop_front()
    }

    fn command_failure(&self, cmd: &str) -> Option<SandboxError> {
        let failures = self.command_failures.lock().unwrap();
        failures
            .iter()
            .find(|(needle, _)| cmd.contains(needle))
            .map(|(_, err)| err.clone())
    }
}

/// An in-memory sandbox. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct MockSandbox {
    id: String,
    template: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    commands: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
    next_pid: Arc<AtomicU32>,
    output_tx: broadcast::Sender<OutputChunk>,
    script: Arc<FailureScript>,
}

impl MockSandbox {
    fn new(template: &str, script: Arc<FailureScript>) -> Self {
        let (output_tx, _) = broadcast::channel(256);
        Self {
            id: format!("sb-{}", Uuid::new_v4()),
            template: template.to_string(),
            files: Arc::new(Mutex::new(HashMap::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
            next_pid: Arc::new(AtomicU32::new(100)),
            output_tx,
            script,
        }
    }

    /// Template this sandbox was created from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Snapshot of files written so far.
    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.files.lock().unwrap().clone()
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Whether `destroy()` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Push an output line to subscribers (test hook).
    pub fn emit(&self, stream: OutputStream, line: &str) {
        let _ = self.output_tx.send(OutputChunk {
            stream,
            line: line.to_string(),
        });
    }

    fn check_alive(&self) -> SandboxResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxError::Sandbox(format!(
                "sandbox {} is destroyed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        self.check_alive()?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn run_command(&self, cmd: &str, opts: RunOptions) -> SandboxResult<CommandOutput> {
        self.check_alive()?;
        self.commands.lock().unwrap().push(cmd.to_string());

        if let Some(err) = self.script.command_failure(cmd) {
            return Err(err);
        }

        if opts.background {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.emit(OutputStream::Stdout, &format!("started: {cmd}"));
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                pid: Some(pid),
            });
        }

        self.emit(OutputStream::Stdout, &format!("ran: {cmd}"));
        Ok(CommandOutput {
            stdout: format!("ok: {cmd}"),
            stderr: String::new(),
            exit_code: 0,
            pid: None,
        })
    }

    async fn host(&self, port: u16) -> SandboxResult<String> {
        self.check_alive()?;
        if let Some(err) = self.script.host_failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(format!("https://{}.mock.host:{port}", self.id))
    }

    async fn destroy(&self) -> SandboxResult<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        debug!(sandbox_id = %self.id, "mock sandbox destroyed");
        Ok(())
    }

    fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.output_tx.subscribe()
    }
}

/// Provider handing out `MockSandbox` instances.
#[derive(Clone, Default)]
pub struct MockSandboxProvider {
    script: Arc<FailureScript>,
    created: Arc<Mutex<Vec<MockSandbox>>>,
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `create()` call (any template) with `err`.
    pub fn fail_next_create(&self, err: SandboxError) {
        self.script.create_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next `create()` for a specific template with `err`.
    pub fn fail_create_for_template(&self, template: &str, err: SandboxError) {
        self.script
            .template_failures
            .lock()
            .unwrap()
            .entry(template.to_string())
            .or_default()
            .push_back(err);
    }

    /// Fail every command containing `needle` with `err`.
    pub fn fail_commands_matching(&self, needle: &str, err: SandboxError) {
        self.script
            .command_failures
            .lock()
            .unwrap()
            .push((needle.to_string(), err));
    }

    /// Fail the next `host()` call on any sandbox with `err`.
    pub fn fail_next_host(&self, err: SandboxError) {
        *self.script.host_failure.lock().unwrap() = Some(err);
    }

    /// Sandboxes created so far (inspection hook for tests).
    pub fn created(&self) -> Vec<MockSandbox> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(&self, template: &str) -> SandboxResult<Box<dyn Sandbox>> {
        if let Some(err) = self.script.next_create_failure(template) {
            return Err(err);
        }
        let sandbox = MockSandbox::new(template, Arc::clone(&self.script));
        debug!(sandbox_id = %sandbox.id, %template, "mock sandbox created");
        self.created.lock().unwrap().push(sandbox.clone());
        Ok(Box::new(sandbox))
    }
}
