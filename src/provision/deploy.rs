//! Deployment client contract and its sandbox-backed implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bringup::{BringUpOptions, bring_up};
use super::classify::RuntimeHints;
use super::sandbox::{RemoteSandbox, RemoteSession, SandboxSpec, SessionEvent, ensure_sandbox};
use crate::config::{BringupConfig, SandboxConfig, Secret};
use crate::errors::{ProvisionError, Result};
use crate::retry::RetryPolicy;

pub const ENV_SOURCE_REPO: &str = "PREVIEW_SOURCE_REPO";
pub const ENV_FORK_REPO: &str = "PREVIEW_FORK_REPO";
pub const ENV_BRANCH: &str = "PREVIEW_BRANCH";
pub const ENV_WORKFLOW_ID: &str = "PREVIEW_WORKFLOW_ID";

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub workflow_id: String,
    pub app_name: String,
    pub clone_url: String,
    pub branch: String,
    pub region: String,
    pub env: BTreeMap<String, String>,
    pub runtime: RuntimeHints,
    pub vcs_token: Option<Secret>,
}

impl DeployRequest {
    /// Variables identifying the source and fork, set on every deployment.
    pub fn identity_env(
        workflow_id: &str,
        source_repo: &str,
        fork_repo: &str,
        branch: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ENV_SOURCE_REPO.to_string(), source_repo.to_string()),
            (ENV_FORK_REPO.to_string(), fork_repo.to_string()),
            (ENV_BRANCH.to_string(), branch.to_string()),
            (ENV_WORKFLOW_ID.to_string(), workflow_id.to_string()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReceipt {
    pub preview_url: String,
    pub release_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running { port: Option<u16> },
    Error { message: String },
    /// Bring-up gave up waiting for a listening port.
    TimedOut { message: String, elapsed_ms: u64 },
}

#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Submit a deployment. Returns once the work is accepted, not when the
    /// app is reachable; use [`DeploymentClient::get_status`] for that.
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt>;

    /// Fails with `NotFound` for apps this client never deployed.
    async fn get_status(&self, app_name: &str) -> Result<DeploymentStatus>;

    async fn destroy(&self, app_name: &str) -> Result<()>;
}

struct ActiveDeployment {
    release_id: String,
    cancel: CancellationToken,
    status: DeploymentStatus,
}

type DeploymentMap = Arc<RwLock<HashMap<String, ActiveDeployment>>>;

/// [`DeploymentClient`] running each app's dev server in its own sandbox.
///
/// Each app has at most one live bring-up session; a new deploy for the
/// same app cancels the previous one first.
pub struct SandboxDeployer {
    sandbox: Arc<dyn RemoteSandbox>,
    sandbox_config: SandboxConfig,
    bringup: BringupConfig,
    retry: RetryPolicy,
    deployments: DeploymentMap,
}

impl SandboxDeployer {
    pub fn new(
        sandbox: Arc<dyn RemoteSandbox>,
        sandbox_config: SandboxConfig,
        bringup: BringupConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sandbox,
            sandbox_config,
            bringup,
            retry,
            deployments: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Record `status` unless `release_id` has been superseded or destroyed.
async fn set_status(deployments: &DeploymentMap, app: &str, release_id: &str, status: DeploymentStatus) {
    let mut map = deployments.write().await;
    if let Some(active) = map.get_mut(app)
        && active.release_id == release_id
    {
        active.status = status;
    }
}

/// Follow a ready dev server until it exits or the deployment is cancelled.
async fn watch_session(
    deployments: DeploymentMap,
    app: String,
    release_id: String,
    mut session: RemoteSession,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                session.kill();
                debug!(app = %app, release = %release_id, "Stopped dev server");
                return;
            }
            event = session.events.recv() => match event {
                Some(SessionEvent::Output { .. }) => {}
                Some(SessionEvent::Exited { code }) => {
                    warn!(app = %app, ?code, "Dev server exited");
                    let message = match code {
                        Some(code) => format!("Dev server exited with code {}", code),
                        None => "Dev server was terminated".to_string(),
                    };
                    set_status(&deployments, &app, &release_id, DeploymentStatus::Error { message }).await;
                    return;
                }
                Some(SessionEvent::Failed { message }) => {
                    warn!(app = %app, error = %message, "Dev server session failed");
                    set_status(&deployments, &app, &release_id, DeploymentStatus::Error { message }).await;
                    return;
                }
                None => return,
            }
        }
    }
}

#[async_trait]
impl DeploymentClient for SandboxDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt> {
        let app = request.app_name.clone();
        let cancel = CancellationToken::new();
        let spec = SandboxSpec::from_config(&app, &request.region, &self.sandbox_config);
        let handle = ensure_sandbox(self.sandbox.as_ref(), &spec, &self.retry, &cancel).await?;

        let release_id = format!("rel-{}", uuid::Uuid::new_v4().simple());
        {
            let mut map = self.deployments.write().await;
            let previous = map.insert(
                app.clone(),
                ActiveDeployment {
                    release_id: release_id.clone(),
                    cancel: cancel.clone(),
                    status: DeploymentStatus::Pending,
                },
            );
            if let Some(previous) = previous {
                info!(app = %app, replaced = %previous.release_id, "Replacing active deployment");
                previous.cancel.cancel();
            }
        }

        let mut options = BringUpOptions::from_config(&self.bringup, &request.runtime);
        options.vcs_token = request.vcs_token.clone();
        options.env = self.sandbox_config.env.clone();
        options.env.extend(request.env.clone());

        let sandbox = Arc::clone(&self.sandbox);
        let deployments = Arc::clone(&self.deployments);
        let clone_url = request.clone_url.clone();
        let branch = request.branch.clone();
        let release = release_id.clone();
        tokio::spawn(async move {
            match bring_up(sandbox.as_ref(), &handle, &clone_url, &branch, &options, &cancel).await {
                Ok(outcome) => {
                    let port = outcome.port;
                    set_status(&deployments, &app, &release, DeploymentStatus::Running { port: Some(port) }).await;
                    watch_session(deployments, app, release, outcome.session, cancel).await;
                }
                Err(ProvisionError::Cancelled(_)) => {
                    debug!(app = %app, release = %release, "Bring-up cancelled");
                }
                Err(ProvisionError::Timeout { elapsed, message }) => {
                    let status = DeploymentStatus::TimedOut {
                        message,
                        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    };
                    set_status(&deployments, &app, &release, status).await;
                }
                Err(e) => {
                    set_status(&deployments, &app, &release, DeploymentStatus::Error { message: e.to_string() }).await;
                }
            }
        });

        let preview_url = self.sandbox_config.preview_url(&request.app_name, &request.region);
        info!(app = %request.app_name, release = %release_id, url = %preview_url, "Deployment submitted");
        Ok(DeployReceipt {
            preview_url,
            release_id,
        })
    }

    async fn get_status(&self, app_name: &str) -> Result<DeploymentStatus> {
        self.deployments
            .read()
            .await
            .get(app_name)
            .map(|active| active.status.clone())
            .ok_or_else(|| ProvisionError::not_found(format!("deployment {}", app_name)))
    }

    async fn destroy(&self, app_name: &str) -> Result<()> {
        if let Some(active) = self.deployments.write().await.remove(app_name) {
            active.cancel.cancel();
        }
        self.sandbox.destroy(app_name).await?;
        info!(app = %app_name, "Deployment destroyed");
        Ok(())
    }
}
