use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(format!("wf-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Orchestrator steps, in execution order.
///
/// Each step carries a progress floor. `Polling` spans 60..=95 and is the
/// only step that is re-entered (once per poll attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Initialize,
    ForkStart,
    ForkComplete,
    BranchCreate,
    BranchReady,
    DeployStart,
    DeploySubmitted,
    Polling,
    Deployed,
    Error,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ForkStart => "fork_start",
            Self::ForkComplete => "fork_complete",
            Self::BranchCreate => "branch_create",
            Self::BranchReady => "branch_ready",
            Self::DeployStart => "deploy_start",
            Self::DeploySubmitted => "deploy_submitted",
            Self::Polling => "polling",
            Self::Deployed => "deployed",
            Self::Error => "error",
        }
    }

    /// Minimum progress percentage reported when this step is entered.
    pub fn progress_floor(&self) -> u8 {
        match self {
            Self::Initialize => 5,
            Self::ForkStart => 10,
            Self::ForkComplete => 25,
            Self::BranchCreate => 35,
            Self::BranchReady => 45,
            Self::DeployStart => 50,
            Self::DeploySubmitted => 60,
            Self::Polling => 60,
            Self::Deployed => 100,
            // Error keeps whatever progress the run had reached.
            Self::Error => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Error)
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Self::Initialize),
            "fork_start" => Ok(Self::ForkStart),
            "fork_complete" => Ok(Self::ForkComplete),
            "branch_create" => Ok(Self::BranchCreate),
            "branch_ready" => Ok(Self::BranchReady),
            "deploy_start" => Ok(Self::DeployStart),
            "deploy_submitted" => Ok(Self::DeploySubmitted),
            "polling" => Ok(Self::Polling),
            "deployed" => Ok(Self::Deployed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid workflow step: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    #[default]
    None,
    Succeeded,
    Failed,
}

/// How a successful run concluded that the preview is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    /// The deployment reported `running`.
    Confirmed,
    /// The status poll budget ran out; the preview URL is deterministic and
    /// is assumed to become reachable.
    Assumed,
}

/// Fork of the source repository used as the deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkResult {
    pub url: String,
    pub clone_url: String,
    pub fork_owner: String,
    pub repo_name: String,
    pub default_branch: String,
    pub is_new_fork: bool,
}

/// Identity of the provisioned compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTarget {
    pub app_name: String,
    pub preview_url: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
}

/// One provisioning attempt, as observed by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub workflow_id: WorkflowId,
    pub owner_user_id: String,
    pub source_owner: String,
    pub source_repo: String,
    pub branch: String,
    pub region: String,
    pub current_step: WorkflowStep,
    pub progress_percent: u8,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub terminal_state: TerminalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_state: Option<ReadyState>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: WorkflowId,
        owner_user_id: &str,
        source_owner: &str,
        source_repo: &str,
        branch: &str,
        region: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            owner_user_id: owner_user_id.to_string(),
            source_owner: source_owner.to_string(),
            source_repo: source_repo.to_string(),
            branch: branch.to_string(),
            region: region.to_string(),
            current_step: WorkflowStep::Initialize,
            progress_percent: WorkflowStep::Initialize.progress_floor(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            terminal_state: TerminalState::None,
            last_error: None,
            fork: None,
            deployment: None,
            ready_state: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_state != TerminalState::None
    }

    /// Move to `step` with at least `progress` percent.
    ///
    /// Returns `false` (and leaves the run untouched) for backwards moves or
    /// for any move out of a terminal state. Progress never decreases.
    pub fn advance(&mut self, step: WorkflowStep, progress: u8) -> bool {
        if self.is_terminal() {
            return false;
        }
        if step != WorkflowStep::Error && step < self.current_step {
            return false;
        }

        self.current_step = step;
        self.progress_percent = self.progress_percent.max(progress.min(100));
        self.updated_at = Utc::now();

        match step {
            WorkflowStep::Deployed => {
                self.progress_percent = 100;
                self.terminal_state = TerminalState::Succeeded;
                self.finished_at = Some(self.updated_at);
            }
            WorkflowStep::Error => {
                self.terminal_state = TerminalState::Failed;
                self.finished_at = Some(self.updated_at);
            }
            _ => {}
        }
        true
    }
}
