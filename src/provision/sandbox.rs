//! Remote sandbox lifecycle: look up, create, destroy, and spawn sessions.
//!
//! A session is a shell invocation inside a sandbox whose output arrives as
//! a stream of [`SessionEvent`]s. Output is forwarded chunk by chunk, and the
//! exit event is always the last event of a session. When the receiver is
//! dropped the process keeps running and its output is drained and
//! discarded; only [`RemoteSession::kill`] or destroying the sandbox stops it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::errors::{ProvisionError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
    /// Backend specific identity (directory path, container id).
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub region: String,
    pub image: String,
    pub memory: String,
    pub cpus: f64,
}

impl SandboxSpec {
    pub fn from_config(name: &str, region: &str, config: &SandboxConfig) -> Self {
        Self {
            name: name.to_string(),
            region: region.to_string(),
            image: config.image.clone(),
            memory: config.memory.clone(),
            cpus: config.cpus,
        }
    }
}

/// A shell script plus the environment it runs with.
#[derive(Clone, Default)]
pub struct SessionCommand {
    pub script: String,
    pub env: BTreeMap<String, String>,
}

impl fmt::Debug for SessionCommand {
    // Env values may hold credentials; only the keys are printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCommand")
            .field("script_len", &self.script.len())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output { stream: OutputStream, chunk: String },
    /// `None` when the process was killed by a signal.
    Exited { code: Option<i32> },
    /// The session broke without a normal exit (wait failed, attach lost).
    Failed { message: String },
}

pub struct RemoteSession {
    pub process_id: String,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
}

impl RemoteSession {
    pub fn new(
        process_id: impl Into<String>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            events,
            cancel,
        }
    }

    /// Stop the remote process.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("process_id", &self.process_id)
            .finish()
    }
}

#[async_trait]
pub trait RemoteSandbox: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>>;

    /// Create a sandbox. Fails with `Conflict` if `spec.name` exists.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Destroy a sandbox and every session running in it. Absent sandboxes
    /// are not an error.
    async fn destroy(&self, name: &str) -> Result<()>;

    async fn spawn(&self, sandbox: &SandboxHandle, command: &SessionCommand) -> Result<RemoteSession>;

    /// Directory sessions in `sandbox` should use for the configured path.
    fn working_directory(&self, _sandbox: &SandboxHandle, configured: &str) -> String {
        configured.to_string()
    }
}

/// Look up `spec.name`, creating it if absent.
///
/// Creation runs under `policy`, and every attempt re-checks for existence
/// first, so a create that timed out but actually succeeded is never
/// duplicated. A `Conflict` from create means another caller won the race
/// and is resolved by a final lookup.
pub async fn ensure_sandbox(
    sandbox: &dyn RemoteSandbox,
    spec: &SandboxSpec,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<SandboxHandle> {
    policy
        .run("ensure_sandbox", cancel, move |attempt| async move {
            if let Some(existing) = sandbox.lookup(&spec.name).await? {
                debug!(sandbox = %spec.name, attempt, "Reusing existing sandbox");
                return Ok(existing);
            }
            match sandbox.create(spec).await {
                Ok(handle) => {
                    info!(sandbox = %spec.name, id = %handle.id, "Created sandbox");
                    Ok(handle)
                }
                Err(e) if e.is_conflict() => sandbox.lookup(&spec.name).await?.ok_or_else(|| {
                    ProvisionError::Transient(format!("sandbox {} vanished after conflict", spec.name))
                }),
                Err(e) => Err(e),
            }
        })
        .await
}
