use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::{WorkflowId, WorkflowStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Skipped,
    Error,
}

/// Progress event emitted on step entry and completion.
///
/// Step specific fields (fork URL, app name, poll attempt, ...) are carried in
/// `details` and flattened into the serialized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub workflow_id: WorkflowId,
    pub step: WorkflowStep,
    pub status: StepStatus,
    pub message: String,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl WorkflowEvent {
    pub fn new(
        workflow_id: WorkflowId,
        step: WorkflowStep,
        status: StepStatus,
        message: impl Into<String>,
        progress: u8,
    ) -> Self {
        Self {
            workflow_id,
            step,
            status,
            message: message.into(),
            progress: progress.min(100),
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }
}
