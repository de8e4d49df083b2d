//! Fork-and-deploy workflow.
//!
//! A run moves strictly forward through
//! `initialize → fork_start → fork_complete → branch_create → branch_ready →
//! deploy_start → deploy_submitted → polling → deployed`, with `error`
//! reachable from any non-terminal step. The orchestration steps are never
//! retried themselves; retry lives in the sub-operations.
//!
//! Every wait (fork polling, status polling, sleeps) is bounded by the run's
//! [`Deadline`] and observes the run's cancellation token. Cancellation ends
//! the run through the same failure path as a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use preview_common::{
    DeploymentTarget, ForkResult, ReadyState, StepStatus, WorkflowEvent, WorkflowId, WorkflowRun,
    WorkflowStep,
};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classify::{ManifestClassifier, ProjectClassifier, RuntimeHints};
use super::deploy::{DeployRequest, DeploymentClient, DeploymentStatus};
use super::events::EventBus;
use super::registry::WorkflowRegistry;
use super::vcs::{RepoInfo, VcsClient};
use crate::config::{NamingConfig, PreviewToml, Secret};
use crate::errors::{ProvisionError, Result};
use crate::naming::{derive_app_name, project_key, timestamp_salt};
use crate::retry::{Deadline, is_transient, sleep_or_cancel};

const MANIFEST_FILE: &str = "package.json";
const POLL_PROGRESS_START: u32 = 60;
const POLL_PROGRESS_SPAN: u32 = 35;

/// Timing and naming knobs for workflow runs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub naming: NamingConfig,
    pub fork_poll_attempts: u32,
    pub fork_poll_delay: Duration,
    pub status_poll_interval: Duration,
    pub status_poll_max_attempts: u32,
    pub total_deadline: Duration,
    pub retention: Duration,
    pub fresh_names: bool,
    pub default_region: String,
}

impl OrchestratorSettings {
    pub fn from_config(toml: &PreviewToml) -> Self {
        let o = &toml.orchestrator;
        Self {
            naming: toml.naming.clone(),
            fork_poll_attempts: o.fork_poll_attempts,
            fork_poll_delay: o.fork_poll_delay(),
            status_poll_interval: o.status_poll_interval(),
            status_poll_max_attempts: o.status_poll_max_attempts.max(1),
            total_deadline: o.total_deadline(),
            retention: o.retention(),
            fresh_names: o.fresh_names,
            default_region: toml.sandbox.default_region.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&PreviewToml::default())
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub user_id: String,
    pub source_owner: String,
    pub source_repo: String,
    /// Defaults to the fork's default branch.
    pub branch: Option<String>,
    pub region: Option<String>,
    /// Used by the sandbox to clone the fork; never logged.
    pub vcs_token: Option<Secret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutcome {
    pub workflow_id: WorkflowId,
    pub fork: ForkResult,
    pub deployment: DeploymentTarget,
    pub ready_state: ReadyState,
    pub port: Option<u16>,
}

/// Per-run state threaded through the steps.
struct RunContext {
    id: WorkflowId,
    request: WorkflowRequest,
    cancel: CancellationToken,
    deadline: Deadline,
}

impl RunContext {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!("workflow {} cancelled", self.id)));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    vcs: Arc<dyn VcsClient>,
    deployer: Arc<dyn DeploymentClient>,
    classifier: Arc<dyn ProjectClassifier>,
    registry: WorkflowRegistry,
    events: Arc<EventBus>,
    settings: Arc<OrchestratorSettings>,
    cancels: Arc<Mutex<HashMap<WorkflowId, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        vcs: Arc<dyn VcsClient>,
        deployer: Arc<dyn DeploymentClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            vcs,
            deployer,
            classifier: Arc::new(ManifestClassifier),
            registry: WorkflowRegistry::new(),
            events: Arc::new(EventBus::default()),
            settings: Arc::new(settings),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ProjectClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub async fn get_workflow_status(&self, id: &WorkflowId) -> Option<WorkflowRun> {
        self.registry.get(id).await
    }

    /// Request cooperative cancellation. Returns `false` if the run is
    /// unknown or already finished.
    pub async fn cancel_workflow(&self, id: &WorkflowId) -> bool {
        match self.cancels.lock().await.get(id) {
            Some(token) => {
                info!(workflow_id = %id, "Cancelling workflow");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Destroy a deployed preview. Forks are left alone.
    pub async fn teardown(&self, app_name: &str) -> Result<()> {
        self.deployer.destroy(app_name).await
    }

    /// Run a workflow to its terminal state.
    pub async fn start_workflow(&self, request: WorkflowRequest) -> Result<WorkflowOutcome> {
        let ctx = self.prepare(request).await;
        self.execute(ctx).await
    }

    /// Start a workflow in the background and return its id immediately.
    pub async fn spawn_workflow(&self, request: WorkflowRequest) -> WorkflowId {
        let ctx = self.prepare(request).await;
        let id = ctx.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            // The outcome is recorded in the registry and the event stream.
            let _ = this.execute(ctx).await;
        });
        id
    }

    async fn prepare(&self, request: WorkflowRequest) -> RunContext {
        let pruned = self.registry.prune_expired(self.settings.retention).await;
        if pruned > 0 {
            debug!(pruned, "Evicted expired workflow runs");
        }

        let id = WorkflowId::new();
        let region = request
            .region
            .clone()
            .unwrap_or_else(|| self.settings.default_region.clone());
        let run = WorkflowRun::new(
            id.clone(),
            &request.user_id,
            &request.source_owner,
            &request.source_repo,
            request.branch.as_deref().unwrap_or_default(),
            &region,
        );
        self.registry.insert(run).await;

        let cancel = CancellationToken::new();
        self.cancels.lock().await.insert(id.clone(), cancel.clone());

        info!(
            workflow_id = %id,
            source = %format!("{}/{}", request.source_owner, request.source_repo),
            "Workflow created"
        );
        self.events.emit(WorkflowEvent::new(
            id.clone(),
            WorkflowStep::Initialize,
            StepStatus::InProgress,
            format!("Preparing preview for {}/{}", request.source_owner, request.source_repo),
            WorkflowStep::Initialize.progress_floor(),
        ));

        RunContext {
            id,
            request,
            cancel,
            deadline: Deadline::new(self.settings.total_deadline),
        }
    }

    async fn execute(&self, ctx: RunContext) -> Result<WorkflowOutcome> {
        let result = self.run_steps(&ctx).await;
        self.cancels.lock().await.remove(&ctx.id);
        if let Err(e) = &result {
            self.fail(&ctx.id, e).await;
        }
        result
    }

    async fn run_steps(&self, ctx: &RunContext) -> Result<WorkflowOutcome> {
        let fork = self.fork_step(ctx).await?;
        let branch = self.branch_step(ctx, &fork).await?;
        let runtime = self.classify(&fork, &branch).await;
        let deployment = self.deploy_step(ctx, &fork, &branch, runtime).await?;
        let (ready_state, port) = self.poll_step(ctx, &deployment).await?;

        let message = match ready_state {
            ReadyState::Confirmed => format!("Preview is running at {}", deployment.preview_url),
            ReadyState::Assumed => format!(
                "Deployment status unknown; assuming the preview is running at {}",
                deployment.preview_url
            ),
        };
        let mut details = vec![
            ("previewUrl", Value::from(deployment.preview_url.clone())),
            ("readyState", serde_json::to_value(ready_state).unwrap_or(Value::Null)),
        ];
        if let Some(port) = port {
            details.push(("port", Value::from(port)));
        }
        self.transition(ctx, WorkflowStep::Deployed, 100, StepStatus::Completed, message, details, |run| {
            run.ready_state = Some(ready_state);
        })
        .await;

        info!(
            workflow_id = %ctx.id,
            app_name = %deployment.app_name,
            ready = ?ready_state,
            elapsed_ms = ctx.deadline.elapsed().as_millis() as u64,
            "Workflow deployed"
        );
        Ok(WorkflowOutcome {
            workflow_id: ctx.id.clone(),
            fork,
            deployment,
            ready_state,
            port,
        })
    }

    /// Apply a transition to the registry, then emit the matching event with
    /// the run's recorded progress.
    #[allow(clippy::too_many_arguments)]
    async fn transition<F>(
        &self,
        ctx: &RunContext,
        step: WorkflowStep,
        progress: u8,
        status: StepStatus,
        message: impl Into<String>,
        details: Vec<(&str, Value)>,
        update: F,
    ) where
        F: FnOnce(&mut WorkflowRun),
    {
        let message = message.into();
        let Some(run) = self.registry.transition(&ctx.id, step, progress, update).await else {
            return;
        };
        debug!(workflow_id = %ctx.id, step = %step, progress = run.progress_percent, "{}", message);
        let mut event = WorkflowEvent::new(ctx.id.clone(), step, status, message, run.progress_percent);
        for (key, value) in details {
            event = event.with_detail(key, value);
        }
        self.events.emit(event);
    }

    async fn fail(&self, id: &WorkflowId, err: &ProvisionError) {
        let message = err.to_string();
        error!(workflow_id = %id, kind = ?err.kind(), error = %message, "Workflow failed");
        let recorded = message.clone();
        let Some(run) = self
            .registry
            .transition(id, WorkflowStep::Error, 0, |run| run.last_error = Some(recorded))
            .await
        else {
            return;
        };
        let mut event = WorkflowEvent::new(
            id.clone(),
            WorkflowStep::Error,
            StepStatus::Error,
            message,
            run.progress_percent,
        )
        .with_detail("errorKind", format!("{:?}", err.kind()));
        if let Some(hint) = err.hint() {
            event = event.with_detail("hint", hint);
        }
        self.events.emit(event);
    }

    // ── fork ──

    async fn fork_step(&self, ctx: &RunContext) -> Result<ForkResult> {
        ctx.check_cancelled()?;
        let req = &ctx.request;
        self.transition(
            ctx,
            WorkflowStep::ForkStart,
            WorkflowStep::ForkStart.progress_floor(),
            StepStatus::InProgress,
            format!("Forking {}/{}", req.source_owner, req.source_repo),
            vec![],
            |_| {},
        )
        .await;

        let identity = self.vcs.authenticated_identity().await?;
        if identity.eq_ignore_ascii_case(&req.source_owner) {
            return Err(ProvisionError::Configuration(format!(
                "{} owns {}/{} and cannot fork its own repository; use a different account",
                identity, req.source_owner, req.source_repo
            )));
        }
        let (repo, is_new_fork) = match self.vcs.get_repo(&identity, &req.source_repo).await {
            Ok(existing) if !existing.fork => {
                return Err(ProvisionError::conflict(format!(
                    "Repository {} (not a fork of {}/{})",
                    existing.full_name(),
                    req.source_owner,
                    req.source_repo
                )));
            }
            Ok(existing) => {
                info!(workflow_id = %ctx.id, fork = %existing.full_name(), "Reusing existing fork");
                (existing, false)
            }
            Err(e) if e.is_not_found() => {
                let created = self.vcs.create_fork(&req.source_owner, &req.source_repo).await?;
                info!(workflow_id = %ctx.id, fork = %created.full_name(), "Fork requested");
                self.await_fork(ctx, &created).await?;
                (created, true)
            }
            Err(e) => return Err(e),
        };

        let fork = ForkResult {
            url: repo.html_url.clone(),
            clone_url: repo.clone_url.clone(),
            fork_owner: repo.owner.clone(),
            repo_name: repo.name.clone(),
            default_branch: repo.default_branch.clone(),
            is_new_fork,
        };
        let recorded = fork.clone();
        self.transition(
            ctx,
            WorkflowStep::ForkComplete,
            WorkflowStep::ForkComplete.progress_floor(),
            StepStatus::Completed,
            if is_new_fork {
                format!("Created fork {}", repo.full_name())
            } else {
                format!("Using existing fork {}", repo.full_name())
            },
            vec![
                ("forkUrl", Value::from(fork.url.clone())),
                ("isNewFork", Value::from(is_new_fork)),
            ],
            |run| run.fork = Some(recorded),
        )
        .await;
        Ok(fork)
    }

    /// Wait until a freshly requested fork is queryable. Gives up quietly
    /// when the attempts or the run's deadline run out.
    async fn await_fork(&self, ctx: &RunContext, fork: &RepoInfo) -> Result<()> {
        for attempt in 1..=self.settings.fork_poll_attempts {
            match self.vcs.get_repo(&fork.owner, &fork.name).await {
                Ok(_) => {
                    debug!(workflow_id = %ctx.id, attempt, "Fork is queryable");
                    return Ok(());
                }
                Err(e) if e.is_not_found() || is_transient(&e) => {
                    debug!(workflow_id = %ctx.id, attempt, error = %e, "Fork not ready yet");
                }
                Err(e) => return Err(e),
            }
            if ctx.deadline.is_expired() {
                break;
            }
            sleep_or_cancel(ctx.deadline.clamp(self.settings.fork_poll_delay), &ctx.cancel).await?;
        }
        warn!(workflow_id = %ctx.id, fork = %fork.full_name(), "Fork not visible yet, proceeding");
        Ok(())
    }

    // ── branch ──

    async fn branch_step(&self, ctx: &RunContext, fork: &ForkResult) -> Result<String> {
        ctx.check_cancelled()?;
        let req = &ctx.request;
        let branch = req
            .branch
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| fork.default_branch.clone());

        if branch == fork.default_branch {
            self.transition(
                ctx,
                WorkflowStep::BranchCreate,
                WorkflowStep::BranchCreate.progress_floor(),
                StepStatus::Skipped,
                format!("Using default branch {}", branch),
                vec![],
                |_| {},
            )
            .await;
        } else {
            self.transition(
                ctx,
                WorkflowStep::BranchCreate,
                WorkflowStep::BranchCreate.progress_floor(),
                StepStatus::InProgress,
                format!("Ensuring branch {} on fork", branch),
                vec![("branch", Value::from(branch.clone()))],
                |_| {},
            )
            .await;
            self.ensure_branch(ctx, fork, &branch).await?;
        }

        let recorded = branch.clone();
        self.transition(
            ctx,
            WorkflowStep::BranchReady,
            WorkflowStep::BranchReady.progress_floor(),
            StepStatus::Completed,
            format!("Branch {} ready", branch),
            vec![("branch", Value::from(branch.clone()))],
            |run| run.branch = recorded,
        )
        .await;
        Ok(branch)
    }

    async fn ensure_branch(&self, ctx: &RunContext, fork: &ForkResult, branch: &str) -> Result<()> {
        match self.vcs.get_branch_ref(&fork.fork_owner, &fork.repo_name, branch).await {
            Ok(_) => {
                debug!(workflow_id = %ctx.id, branch, "Branch already exists on fork");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let req = &ctx.request;
        let sha = self
            .vcs
            .get_branch_ref(&req.source_owner, &req.source_repo, branch)
            .await?;
        match self
            .vcs
            .create_branch_ref(&fork.fork_owner, &fork.repo_name, branch, &sha)
            .await
        {
            Ok(()) => {
                info!(workflow_id = %ctx.id, branch, sha = %sha, "Created branch on fork");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(workflow_id = %ctx.id, branch, "Branch appeared concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── classify ──

    /// Runtime hints for the fork; detection problems fall back to defaults.
    async fn classify(&self, fork: &ForkResult, branch: &str) -> RuntimeHints {
        let files = match self
            .vcs
            .list_root_files(&fork.fork_owner, &fork.repo_name, branch)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(fork = %fork.repo_name, error = %e, "Could not list repository files, using defaults");
                return RuntimeHints::default();
            }
        };
        let manifest = if files.iter().any(|f| f == MANIFEST_FILE) {
            self.vcs
                .read_file(&fork.fork_owner, &fork.repo_name, branch, MANIFEST_FILE)
                .await
                .unwrap_or_else(|e| {
                    warn!(fork = %fork.repo_name, error = %e, "Could not read package.json");
                    None
                })
        } else {
            None
        };
        self.classifier.classify(&files, manifest.as_deref())
    }

    // ── deploy ──

    async fn deploy_step(
        &self,
        ctx: &RunContext,
        fork: &ForkResult,
        branch: &str,
        runtime: RuntimeHints,
    ) -> Result<DeploymentTarget> {
        ctx.check_cancelled()?;
        let req = &ctx.request;
        let naming_branch = (branch != fork.default_branch).then_some(branch);
        let salt = self.settings.fresh_names.then(timestamp_salt);
        let app_name = derive_app_name(
            &self.settings.naming.prefix,
            self.settings.naming.max_len,
            &req.user_id,
            &project_key(&req.source_owner, &req.source_repo, naming_branch),
            salt.as_deref(),
        );
        let region = req
            .region
            .clone()
            .unwrap_or_else(|| self.settings.default_region.clone());

        self.transition(
            ctx,
            WorkflowStep::DeployStart,
            WorkflowStep::DeployStart.progress_floor(),
            StepStatus::InProgress,
            format!("Deploying {}", app_name),
            vec![
                ("appName", Value::from(app_name.clone())),
                ("packageManager", Value::from(runtime.package_manager.as_str())),
                ("startScript", Value::from(runtime.start_script.clone())),
            ],
            |_| {},
        )
        .await;

        let source = format!("{}/{}", req.source_owner, req.source_repo);
        let fork_name = format!("{}/{}", fork.fork_owner, fork.repo_name);
        let request = DeployRequest {
            workflow_id: ctx.id.to_string(),
            app_name: app_name.clone(),
            clone_url: fork.clone_url.clone(),
            branch: branch.to_string(),
            region: region.clone(),
            env: DeployRequest::identity_env(ctx.id.as_str(), &source, &fork_name, branch),
            runtime,
            vcs_token: req.vcs_token.clone(),
        };
        let receipt = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ProvisionError::Cancelled(format!("workflow {} cancelled during deploy", ctx.id)));
            }
            receipt = self.deployer.deploy(&request) => receipt?,
        };

        let target = DeploymentTarget {
            app_name,
            preview_url: receipt.preview_url,
            region,
            release_id: Some(receipt.release_id),
        };
        let recorded = target.clone();
        self.transition(
            ctx,
            WorkflowStep::DeploySubmitted,
            WorkflowStep::DeploySubmitted.progress_floor(),
            StepStatus::Completed,
            format!("Deployment submitted for {}", target.app_name),
            vec![("previewUrl", Value::from(target.preview_url.clone()))],
            |run| run.deployment = Some(recorded),
        )
        .await;
        Ok(target)
    }

    // ── poll ──

    /// Poll until the deployment runs, fails, or the poll budget (or the
    /// run's deadline) is spent. Running out of budget is not a failure.
    async fn poll_step(
        &self,
        ctx: &RunContext,
        target: &DeploymentTarget,
    ) -> Result<(ReadyState, Option<u16>)> {
        let max = self.settings.status_poll_max_attempts.max(1);
        for attempt in 1..=max {
            ctx.check_cancelled()?;
            let running = match self.deployer.get_status(&target.app_name).await {
                Ok(DeploymentStatus::Running { port }) => {
                    debug!(workflow_id = %ctx.id, attempt, ?port, "Deployment running");
                    Some(port)
                }
                Ok(DeploymentStatus::Error { message }) => {
                    return Err(ProvisionError::RemoteExecution {
                        message: format!("Deployment failed: {}", message),
                        exit_code: None,
                        diagnostics: None,
                    });
                }
                Ok(DeploymentStatus::TimedOut { message, elapsed_ms }) => {
                    return Err(ProvisionError::Timeout {
                        elapsed: Duration::from_millis(elapsed_ms),
                        message: format!("Deployment failed: {}", message),
                    });
                }
                Ok(DeploymentStatus::Pending) => None,
                Err(e) if is_transient(&e) => {
                    warn!(workflow_id = %ctx.id, attempt, error = %e, "Status query failed, treating as pending");
                    None
                }
                Err(e) => return Err(e),
            };

            let progress = POLL_PROGRESS_START + attempt * POLL_PROGRESS_SPAN / max;
            let message = match running {
                Some(_) => format!("{} is running", target.app_name),
                None => format!("Waiting for {} ({}/{})", target.app_name, attempt, max),
            };
            self.transition(
                ctx,
                WorkflowStep::Polling,
                progress as u8,
                StepStatus::InProgress,
                message,
                vec![("attempt", Value::from(attempt))],
                |_| {},
            )
            .await;

            if let Some(port) = running {
                return Ok((ReadyState::Confirmed, port));
            }
            if attempt == max || ctx.deadline.is_expired() {
                break;
            }
            sleep_or_cancel(ctx.deadline.clamp(self.settings.status_poll_interval), &ctx.cancel).await?;
        }
        warn!(workflow_id = %ctx.id, app_name = %target.app_name, "Status polling exhausted, assuming ready");
        Ok((ReadyState::Assumed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::provision::deploy::DeployReceipt;
    use async_trait::async_trait;
    use preview_common::TerminalState;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // ── mocks ──

    struct MockVcs {
        identity: String,
        repos: StdMutex<HashMap<(String, String), RepoInfo>>,
        refs: StdMutex<HashMap<(String, String, String), String>>,
        /// `get_repo` misses for a new fork before it becomes visible.
        fork_hidden_for: StdMutex<u32>,
        ref_conflict: bool,
        files: Vec<String>,
        manifest: Option<String>,
        calls: StdMutex<Vec<String>>,
    }

    fn repo(owner: &str, name: &str) -> RepoInfo {
        RepoInfo {
            owner: owner.into(),
            name: name.into(),
            html_url: format!("https://github.com/{}/{}", owner, name),
            clone_url: format!("https://github.com/{}/{}.git", owner, name),
            default_branch: "main".into(),
            fork: owner != "octocat",
        }
    }

    impl MockVcs {
        fn new() -> Self {
            let mock = Self {
                identity: "me".into(),
                repos: StdMutex::new(HashMap::new()),
                refs: StdMutex::new(HashMap::new()),
                fork_hidden_for: StdMutex::new(0),
                ref_conflict: false,
                files: vec![],
                manifest: None,
                calls: StdMutex::new(vec![]),
            };
            mock.add_repo("octocat", "hello");
            mock.add_ref("octocat", "hello", "main", "sha-main");
            mock
        }

        fn add_repo(&self, owner: &str, name: &str) {
            self.repos
                .lock()
                .unwrap()
                .insert((owner.into(), name.into()), repo(owner, name));
        }

        fn add_ref(&self, owner: &str, name: &str, branch: &str, sha: &str) {
            self.refs
                .lock()
                .unwrap()
                .insert((owner.into(), name.into(), branch.into()), sha.into());
        }

        fn called(&self, prefix: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl VcsClient for MockVcs {
        async fn authenticated_identity(&self) -> Result<String> {
            Ok(self.identity.clone())
        }

        async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoInfo> {
            self.calls.lock().unwrap().push(format!("get_repo {}/{}", owner, repo));
            let found = self.repos.lock().unwrap().get(&(owner.into(), repo.into())).cloned();
            if found.is_some() && owner == self.identity {
                let mut hidden = self.fork_hidden_for.lock().unwrap();
                if *hidden > 0 {
                    *hidden -= 1;
                    return Err(ProvisionError::not_found(format!("{}/{}", owner, repo)));
                }
            }
            found.ok_or_else(|| ProvisionError::not_found(format!("{}/{}", owner, repo)))
        }

        async fn create_fork(&self, owner: &str, repo: &str) -> Result<RepoInfo> {
            self.calls.lock().unwrap().push(format!("create_fork {}/{}", owner, repo));
            let identity = self.identity.clone();
            self.add_repo(&identity, repo);
            Ok(super::tests::repo(&identity, repo))
        }

        async fn get_branch_ref(&self, owner: &str, repo: &str, branch: &str) -> Result<String> {
            self.refs
                .lock()
                .unwrap()
                .get(&(owner.into(), repo.into(), branch.into()))
                .cloned()
                .ok_or_else(|| ProvisionError::not_found(format!("{}/{}@{}", owner, repo, branch)))
        }

        async fn create_branch_ref(&self, owner: &str, repo: &str, branch: &str, sha: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create_branch_ref {}/{}@{}={}", owner, repo, branch, sha));
            if self.ref_conflict {
                return Err(ProvisionError::conflict(format!("Reference refs/heads/{}", branch)));
            }
            self.add_ref(owner, repo, branch, sha);
            Ok(())
        }

        async fn list_root_files(&self, _owner: &str, _repo: &str, _branch: &str) -> Result<Vec<String>> {
            Ok(self.files.clone())
        }

        async fn read_file(&self, _owner: &str, _repo: &str, _branch: &str, _path: &str) -> Result<Option<String>> {
            Ok(self.manifest.clone())
        }
    }

    #[derive(Default)]
    struct MockDeployer {
        statuses: StdMutex<VecDeque<Result<DeploymentStatus>>>,
        status_calls: StdMutex<u32>,
        deploys: StdMutex<Vec<DeployRequest>>,
        deploy_error: StdMutex<Option<ProvisionError>>,
        destroyed: StdMutex<Vec<String>>,
    }

    impl MockDeployer {
        fn with_statuses(statuses: Vec<Result<DeploymentStatus>>) -> Self {
            let mock = Self::default();
            *mock.statuses.lock().unwrap() = statuses.into();
            mock
        }
    }

    #[async_trait]
    impl DeploymentClient for MockDeployer {
        async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt> {
            if let Some(err) = self.deploy_error.lock().unwrap().take() {
                return Err(err);
            }
            self.deploys.lock().unwrap().push(request.clone());
            Ok(DeployReceipt {
                preview_url: format!("https://{}.preview.local", request.app_name),
                release_id: "rel-1".into(),
            })
        }

        async fn get_status(&self, _app_name: &str) -> Result<DeploymentStatus> {
            *self.status_calls.lock().unwrap() += 1;
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(DeploymentStatus::Pending))
        }

        async fn destroy(&self, app_name: &str) -> Result<()> {
            self.destroyed.lock().unwrap().push(app_name.into());
            Ok(())
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            fork_poll_attempts: 3,
            fork_poll_delay: Duration::from_millis(1),
            status_poll_interval: Duration::from_millis(1),
            status_poll_max_attempts: 5,
            total_deadline: Duration::from_secs(30),
            ..OrchestratorSettings::default()
        }
    }

    fn orchestrator(vcs: &Arc<MockVcs>, deployer: &Arc<MockDeployer>) -> Orchestrator {
        Orchestrator::new(vcs.clone(), deployer.clone(), settings())
    }

    fn request(branch: Option<&str>) -> WorkflowRequest {
        WorkflowRequest {
            user_id: "user-1".into(),
            source_owner: "octocat".into(),
            source_repo: "hello".into(),
            branch: branch.map(String::from),
            region: None,
            vcs_token: Some(Secret::new("ghp_token")),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ── scenarios ──

    #[tokio::test]
    async fn test_new_fork_reaches_deployed() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::with_statuses(vec![
            Ok(DeploymentStatus::Pending),
            Ok(DeploymentStatus::Running { port: Some(3000) }),
        ]));
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let outcome = orch.start_workflow(request(Some("main"))).await.unwrap();
        assert!(outcome.fork.is_new_fork);
        assert_eq!(outcome.fork.fork_owner, "me");
        assert_eq!(outcome.ready_state, ReadyState::Confirmed);
        assert_eq!(outcome.port, Some(3000));

        let run = orch.get_workflow_status(&outcome.workflow_id).await.unwrap();
        assert_eq!(run.current_step, WorkflowStep::Deployed);
        assert_eq!(run.progress_percent, 100);
        assert_eq!(run.terminal_state, TerminalState::Succeeded);
        assert_eq!(run.ready_state, Some(ReadyState::Confirmed));
        assert!(run.fork.unwrap().is_new_fork);
        assert_eq!(vcs.called("create_fork"), 1);

        let events = drain(&mut rx);
        let steps: Vec<_> = events.iter().map(|e| e.step).collect();
        assert_eq!(steps.first(), Some(&WorkflowStep::Initialize));
        assert_eq!(steps.last(), Some(&WorkflowStep::Deployed));
        assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
        let branch_create = events.iter().find(|e| e.step == WorkflowStep::BranchCreate).unwrap();
        assert_eq!(branch_create.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_status_error_stops_polling() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::with_statuses(vec![
            Ok(DeploymentStatus::Pending),
            Ok(DeploymentStatus::Error {
                message: "boot failed".into(),
            }),
            Ok(DeploymentStatus::Running { port: None }),
        ]));
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let err = orch.start_workflow(request(None)).await.unwrap_err();
        assert!(err.to_string().contains("boot failed"));
        assert_eq!(*deployer.status_calls.lock().unwrap(), 2);

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last.step, WorkflowStep::Error);
        assert_eq!(last.status, StepStatus::Error);
        assert_eq!(events.iter().filter(|e| e.step == WorkflowStep::Error).count(), 1);

        let run = orch.get_workflow_status(&last.workflow_id).await.unwrap();
        assert_eq!(run.current_step, WorkflowStep::Error);
        assert_eq!(run.terminal_state, TerminalState::Failed);
        assert!(run.last_error.unwrap().contains("boot failed"));
    }

    #[tokio::test]
    async fn test_branch_conflict_is_success() {
        let mut vcs = MockVcs::new();
        vcs.ref_conflict = true;
        vcs.add_ref("octocat", "hello", "feature", "sha-feature");
        let vcs = Arc::new(vcs);
        let deployer = Arc::new(MockDeployer::with_statuses(vec![Ok(DeploymentStatus::Running { port: None })]));
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let outcome = orch.start_workflow(request(Some("feature"))).await.unwrap();
        assert_eq!(vcs.called("create_branch_ref me/hello@feature=sha-feature"), 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.step == WorkflowStep::BranchReady));
        let run = orch.get_workflow_status(&outcome.workflow_id).await.unwrap();
        assert_eq!(run.branch, "feature");
        assert_eq!(deployer.deploys.lock().unwrap()[0].branch, "feature");
    }

    #[tokio::test]
    async fn test_missing_source_branch_fails() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        let orch = orchestrator(&vcs, &deployer);

        let err = orch.start_workflow(request(Some("nope"))).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(deployer.deploys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_fork_is_reused() {
        let vcs = Arc::new(MockVcs::new());
        vcs.add_repo("me", "hello");
        let deployer = Arc::new(MockDeployer::with_statuses(vec![Ok(DeploymentStatus::Running { port: None })]));
        let orch = orchestrator(&vcs, &deployer);

        let outcome = orch.start_workflow(request(None)).await.unwrap();
        assert!(!outcome.fork.is_new_fork);
        assert_eq!(vcs.called("create_fork"), 0);
    }

    #[tokio::test]
    async fn test_same_named_non_fork_is_a_conflict() {
        let vcs = Arc::new(MockVcs::new());
        vcs.add_repo("me", "hello");
        vcs.repos
            .lock()
            .unwrap()
            .get_mut(&("me".to_string(), "hello".to_string()))
            .unwrap()
            .fork = false;
        let deployer = Arc::new(MockDeployer::default());
        let orch = orchestrator(&vcs, &deployer);

        let err = orch.start_workflow(request(None)).await.unwrap_err();
        assert!(err.is_conflict(), "{:?}", err);
        assert!(err.to_string().contains("me/hello"));
        assert_eq!(vcs.called("create_fork"), 0);
        assert!(deployer.deploys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_owner_cannot_fork_own_repo() {
        let mut vcs = MockVcs::new();
        vcs.identity = "octocat".into();
        let vcs = Arc::new(vcs);
        let deployer = Arc::new(MockDeployer::default());
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let err = orch.start_workflow(request(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(vcs.called("get_repo"), 0);
        assert_eq!(vcs.called("create_fork"), 0);
        assert!(deployer.deploys.lock().unwrap().is_empty());

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last.step, WorkflowStep::Error);
        assert_eq!(last.details["errorKind"], "Configuration");
    }

    #[tokio::test]
    async fn test_slow_fork_visibility_degrades() {
        let vcs = Arc::new(MockVcs::new());
        *vcs.fork_hidden_for.lock().unwrap() = 100;
        let deployer = Arc::new(MockDeployer::with_statuses(vec![Ok(DeploymentStatus::Running { port: None })]));
        let orch = orchestrator(&vcs, &deployer);

        let outcome = orch.start_workflow(request(None)).await.unwrap();
        assert!(outcome.fork.is_new_fork);
        // One existence check plus three polls.
        assert_eq!(vcs.called("get_repo me/hello"), 4);
        assert_eq!(deployer.deploys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_exhaustion_assumes_ready() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let outcome = orch.start_workflow(request(None)).await.unwrap();
        assert_eq!(outcome.ready_state, ReadyState::Assumed);
        assert_eq!(*deployer.status_calls.lock().unwrap(), 5);

        let run = orch.get_workflow_status(&outcome.workflow_id).await.unwrap();
        assert_eq!(run.terminal_state, TerminalState::Succeeded);
        assert_eq!(run.ready_state, Some(ReadyState::Assumed));

        let events = drain(&mut rx);
        let polls: Vec<_> = events
            .iter()
            .filter(|e| e.step == WorkflowStep::Polling)
            .map(|e| e.progress)
            .collect();
        assert_eq!(polls, vec![67, 74, 81, 88, 95]);
        let last = events.last().unwrap();
        assert!(last.message.contains("assuming"));
        assert_eq!(last.details["readyState"], "assumed");
    }

    #[tokio::test]
    async fn test_transient_status_errors_count_as_pending() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::with_statuses(vec![
            Err(ProvisionError::Transient("connection reset".into())),
            Ok(DeploymentStatus::Running { port: Some(8080) }),
        ]));
        let orch = orchestrator(&vcs, &deployer);
        let outcome = orch.start_workflow(request(None)).await.unwrap();
        assert_eq!(outcome.ready_state, ReadyState::Confirmed);
        assert_eq!(outcome.port, Some(8080));
    }

    #[tokio::test]
    async fn test_running_on_first_poll_still_reports_polling() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::with_statuses(vec![Ok(DeploymentStatus::Running { port: Some(3000) })]));
        let orch = orchestrator(&vcs, &deployer);
        let mut rx = orch.subscribe();

        let outcome = orch.start_workflow(request(None)).await.unwrap();
        assert_eq!(outcome.ready_state, ReadyState::Confirmed);

        let events = drain(&mut rx);
        let steps: Vec<_> = events.iter().map(|e| e.step).collect();
        let polling = steps.iter().position(|s| *s == WorkflowStep::Polling).unwrap();
        let deployed = steps.iter().position(|s| *s == WorkflowStep::Deployed).unwrap();
        assert_eq!(polling + 1, deployed);
        assert_eq!(steps[polling - 1], WorkflowStep::DeploySubmitted);
        assert_eq!(events[polling].progress, 67);
    }

    #[tokio::test]
    async fn test_bring_up_timeout_fails_run_as_timeout() {
        use crate::config::{BringupConfig, SandboxConfig};
        use crate::provision::deploy::SandboxDeployer;
        use crate::provision::sandbox::testing::MockSandbox;
        use crate::retry::RetryPolicy;

        let vcs = Arc::new(MockVcs::new());
        // The default session never prints a port.
        let deployer = Arc::new(SandboxDeployer::new(
            Arc::new(MockSandbox::default()),
            SandboxConfig::default(),
            BringupConfig {
                timeout_secs: 0,
                ..BringupConfig::default()
            },
            RetryPolicy::default(),
        ));
        let orch = Orchestrator::new(
            vcs.clone(),
            deployer,
            OrchestratorSettings {
                status_poll_interval: Duration::from_millis(10),
                status_poll_max_attempts: 500,
                ..settings()
            },
        );
        let mut rx = orch.subscribe();

        let err = orch.start_workflow(request(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("No listening port detected"), "{}", err);
        assert_eq!(err.hint(), Some("Try a longer-running configuration (bringup.timeout_secs)"));

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last.step, WorkflowStep::Error);
        assert_eq!(last.details["errorKind"], "Timeout");
        assert_eq!(last.details["hint"], "Try a longer-running configuration (bringup.timeout_secs)");
    }

    #[tokio::test]
    async fn test_deploy_failure_is_fatal() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        *deployer.deploy_error.lock().unwrap() = Some(ProvisionError::Configuration("no sandbox backend".into()));
        let orch = orchestrator(&vcs, &deployer);

        let err = orch.start_workflow(request(None)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert_eq!(*deployer.status_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deploy_request_carries_identity_and_runtime() {
        let mut vcs = MockVcs::new();
        vcs.files = vec!["pnpm-lock.yaml".into(), "package.json".into()];
        vcs.manifest = Some(r#"{"scripts":{"start":"node server.js"}}"#.into());
        let vcs = Arc::new(vcs);
        let deployer = Arc::new(MockDeployer::with_statuses(vec![Ok(DeploymentStatus::Running { port: None })]));
        let orch = orchestrator(&vcs, &deployer);
        let outcome = orch.start_workflow(request(None)).await.unwrap();

        let deploys = deployer.deploys.lock().unwrap();
        let sent = &deploys[0];
        assert_eq!(sent.runtime.package_manager.as_str(), "pnpm");
        assert_eq!(sent.runtime.start_script, "start");
        assert_eq!(sent.clone_url, "https://github.com/me/hello.git");
        assert_eq!(sent.env["PREVIEW_SOURCE_REPO"], "octocat/hello");
        assert_eq!(sent.env["PREVIEW_FORK_REPO"], "me/hello");
        assert_eq!(sent.env["PREVIEW_WORKFLOW_ID"], outcome.workflow_id.as_str());
        assert_eq!(sent.vcs_token.as_ref().map(Secret::expose), Some("ghp_token"));
        assert!(sent.app_name.starts_with("preview-"));
        assert_eq!(outcome.deployment.preview_url, format!("https://{}.preview.local", sent.app_name));
    }

    #[tokio::test]
    async fn test_app_name_is_stable_across_runs() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        deployer.statuses.lock().unwrap().extend([
            Ok(DeploymentStatus::Running { port: None }),
            Ok(DeploymentStatus::Running { port: None }),
        ]);
        let orch = orchestrator(&vcs, &deployer);
        let first = orch.start_workflow(request(None)).await.unwrap();
        let second = orch.start_workflow(request(None)).await.unwrap();
        assert_ne!(first.workflow_id, second.workflow_id);
        assert_eq!(first.deployment.app_name, second.deployment.app_name);
    }

    #[tokio::test]
    async fn test_cancel_ends_run_in_error() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        let orch = Orchestrator::new(
            vcs.clone(),
            deployer.clone(),
            OrchestratorSettings {
                status_poll_interval: Duration::from_secs(5),
                status_poll_max_attempts: 120,
                ..settings()
            },
        );

        let id = orch.spawn_workflow(request(None)).await;
        for _ in 0..200 {
            if *deployer.status_calls.lock().unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(orch.cancel_workflow(&id).await);

        let mut run = None;
        for _ in 0..200 {
            let current = orch.get_workflow_status(&id).await.unwrap();
            if current.is_terminal() {
                run = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let run = run.expect("run should finish after cancel");
        assert_eq!(run.terminal_state, TerminalState::Failed);
        assert!(run.last_error.unwrap().contains("cancelled"));
        assert!(!orch.cancel_workflow(&id).await);
    }

    #[tokio::test]
    async fn test_teardown_destroys_deployment() {
        let vcs = Arc::new(MockVcs::new());
        let deployer = Arc::new(MockDeployer::default());
        let orch = orchestrator(&vcs, &deployer);
        orch.teardown("preview-app").await.unwrap();
        assert_eq!(deployer.destroyed.lock().unwrap().as_slice(), ["preview-app".to_string()]);
    }
}
