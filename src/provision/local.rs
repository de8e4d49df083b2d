//! Local sandbox backend: one directory per sandbox, sessions are `sh -c`
//! child processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sandbox::{
    OutputStream, RemoteSandbox, RemoteSession, SandboxHandle, SandboxSpec, SessionCommand,
    SessionEvent,
};
use crate::errors::{ProvisionError, Result};

const READ_CHUNK: usize = 8192;
/// How long to wait for output pipes to close after the shell exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct LocalSandbox {
    root: PathBuf,
    /// Per-sandbox token; sessions hold child tokens so destroy stops them all.
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn handle(&self, name: &str) -> SandboxHandle {
        SandboxHandle {
            name: name.to_string(),
            id: self.dir(name).to_string_lossy().into_owned(),
        }
    }

    async fn sandbox_token(&self, name: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().await;
        tokens.entry(name.to_string()).or_default().clone()
    }
}

fn forward_output<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep draining after the receiver is gone so the process
                    // never blocks on a full pipe.
                    let _ = tx.send(SessionEvent::Output {
                        stream,
                        chunk: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    });
                }
            }
        }
    })
}

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let _ = tokio::process::Command::new("kill")
        .args(["-TERM", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

#[async_trait]
impl RemoteSandbox for LocalSandbox {
    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>> {
        if self.dir(name).is_dir() {
            Ok(Some(self.handle(name)))
        } else {
            Ok(None)
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let dir = self.dir(&spec.name);
        if dir.exists() {
            return Err(ProvisionError::conflict(format!("sandbox {}", spec.name)));
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ProvisionError::Configuration(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        info!(sandbox = %spec.name, path = %dir.display(), "Created local sandbox");
        Ok(self.handle(&spec.name))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        if let Some(token) = self.tokens.lock().await.remove(name) {
            token.cancel();
        }
        let dir = self.dir(name);
        if dir.exists() {
            // Give killed sessions a moment to release the directory.
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                ProvisionError::Other(anyhow::anyhow!("Failed to remove {}: {}", dir.display(), e))
            })?;
        }
        info!(sandbox = %name, "Destroyed local sandbox");
        Ok(())
    }

    async fn spawn(&self, sandbox: &SandboxHandle, command: &SessionCommand) -> Result<RemoteSession> {
        let dir = Path::new(&sandbox.id);
        if !dir.is_dir() {
            return Err(ProvisionError::not_found(format!("sandbox {}", sandbox.name)));
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&command.script)
            .current_dir(dir)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProvisionError::RemoteExecution {
            message: format!("Failed to spawn shell in sandbox {}: {}", sandbox.name, e),
            exit_code: None,
            diagnostics: None,
        })?;
        let pid = child.id().unwrap_or_default();
        debug!(sandbox = %sandbox.name, pid, "Spawned local session");

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| forward_output(out, OutputStream::Stdout, tx.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| forward_output(err, OutputStream::Stderr, tx.clone()));

        let cancel = self.sandbox_token(&sandbox.name).await.child_token();
        let session_cancel = cancel.clone();
        let name = sandbox.name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sandbox = %name, pid, "Killing local session");
                    kill_process_group(pid).await;
                    let _ = child.kill().await;
                    child.wait().await
                }
                status = child.wait() => status,
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                    warn!(sandbox = %name, pid, "Output pipe still open after exit");
                }
            }

            let event = match status {
                Ok(status) => SessionEvent::Exited {
                    code: status.code(),
                },
                Err(e) => SessionEvent::Failed {
                    message: format!("Failed to wait for session: {}", e),
                },
            };
            let _ = tx.send(event);
        });

        Ok(RemoteSession::new(pid.to_string(), rx, session_cancel))
    }

    fn working_directory(&self, sandbox: &SandboxHandle, configured: &str) -> String {
        Path::new(&sandbox.id)
            .join(configured.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned()
    }
}
