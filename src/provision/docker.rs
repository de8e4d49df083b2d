//! Docker sandbox backend (feature `docker`): one long-lived container per
//! sandbox, sessions are attached `exec`s.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ExecConfig, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder,
    },
};
use futures_util::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sandbox::{
    OutputStream, RemoteSandbox, RemoteSession, SandboxHandle, SandboxSpec, SessionCommand,
    SessionEvent,
};
use crate::errors::{ProvisionError, Result};

const LABEL_APP: &str = "preview.app";
const LABEL_REGION: &str = "preview.region";

/// Parse sizes like `512m`, `2g`, `1024` (bytes).
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(error, BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404)
}

fn docker_error(operation: &str, name: &str, error: BollardError) -> ProvisionError {
    match &error {
        BollardError::DockerResponseServerError { status_code: 409, .. } => {
            ProvisionError::conflict(format!("container {}", name))
        }
        BollardError::DockerResponseServerError { status_code, .. } if *status_code >= 500 => {
            ProvisionError::Transient(format!("{} {}: {}", operation, name, error))
        }
        _ => ProvisionError::Other(anyhow::anyhow!("{} {}: {}", operation, name, error)),
    }
}

pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ProvisionError::Configuration(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self { docker })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| docker_error("pull_image", image, e))?;
        Ok(())
    }

    /// Kill the process recorded in `pid_file` inside the container.
    async fn kill_session(docker: &Docker, container: &str, pid_file: &str) {
        let config = ExecConfig {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("kill -TERM -$(cat {0}) 2>/dev/null || kill -TERM $(cat {0})", pid_file),
            ]),
            ..Default::default()
        };
        if let Ok(exec) = docker.create_exec(container, config).await {
            let _ = docker.start_exec(&exec.id, None::<StartExecOptions>).await;
        }
    }
}

#[async_trait]
impl RemoteSandbox for DockerSandbox {
    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                if !running {
                    debug!(sandbox = %name, "Container exists but is not running");
                    self.docker
                        .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
                        .await
                        .map_err(|e| docker_error("start_container", name, e))?;
                }
                Ok(Some(SandboxHandle {
                    name: name.to_string(),
                    id: info.id.unwrap_or_else(|| name.to_string()),
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(docker_error("inspect_container", name, e)),
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        self.pull_image(&spec.image).await?;

        let labels = HashMap::from([
            (LABEL_APP.to_string(), spec.name.clone()),
            (LABEL_REGION.to_string(), spec.region.clone()),
        ]);
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(HostConfig {
                network_mode: Some("host".to_string()),
                memory: parse_memory(&spec.memory),
                nano_cpus: Some((spec.cpus * 1_000_000_000.0) as i64),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(|e| docker_error("create_container", &spec.name, e))?;

        self.docker
            .start_container(&spec.name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| docker_error("start_container", &spec.name, e))?;

        info!(sandbox = %spec.name, id = %created.id, image = %spec.image, "Created container sandbox");
        Ok(SandboxHandle {
            name: spec.name.clone(),
            id: created.id,
        })
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(_) => {
                info!(sandbox = %name, "Removed container sandbox");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("remove_container", name, e)),
        }
    }

    async fn spawn(&self, sandbox: &SandboxHandle, command: &SessionCommand) -> Result<RemoteSession> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let pid_file = format!("/tmp/preview-session-{}.pid", session_id);
        // Record the shell pid so the session can be killed from a second exec.
        let script = format!("echo $$ > {}; {}", pid_file, command.script);

        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            env: Some(
                command
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&sandbox.name, config)
            .await
            .map_err(|e| docker_error("create_exec", &sandbox.name, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| docker_error("start_exec", &sandbox.name, e))?;
        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(ProvisionError::RemoteExecution {
                message: format!("exec in {} did not attach", sandbox.name),
                exit_code: None,
                diagnostics: None,
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let docker = self.docker.clone();
        let container = sandbox.name.clone();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        Self::kill_session(&docker, &container, &pid_file).await;
                        break;
                    }
                    item = output.next() => match item {
                        Some(Ok(log)) => {
                            let (stream, bytes) = match log {
                                bollard::container::LogOutput::StdErr { message } => (OutputStream::Stderr, message),
                                bollard::container::LogOutput::StdOut { message }
                                | bollard::container::LogOutput::Console { message } => (OutputStream::Stdout, message),
                                bollard::container::LogOutput::StdIn { .. } => continue,
                            };
                            let _ = tx.send(SessionEvent::Output {
                                stream,
                                chunk: String::from_utf8_lossy(&bytes).into_owned(),
                            });
                        }
                        Some(Err(e)) => {
                            warn!(sandbox = %container, error = %e, "Exec stream failed");
                            let _ = tx.send(SessionEvent::Failed { message: e.to_string() });
                            return;
                        }
                        None => break,
                    }
                }
            }

            let code = match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => inspect.exit_code.map(|c| c as i32),
                Err(_) => None,
            };
            let _ = tx.send(SessionEvent::Exited { code });
        });

        Ok(RemoteSession::new(exec.id, rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("64k"), Some(64 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_conflict_maps_to_conflict() {
        let err = docker_error(
            "create_container",
            "app",
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "name in use".into(),
            },
        );
        assert!(err.is_conflict());
    }
}
