//! Shared domain types for preview provisioning.
//!
//! These types are produced by the orchestrator in the `preview` crate and
//! read by anything that reports on a run (CLI renderers, status queries).

pub mod event;
pub mod workflow;

pub use event::{StepStatus, WorkflowEvent};
pub use workflow::{
    DeploymentTarget, ForkResult, ReadyState, TerminalState, WorkflowId, WorkflowRun, WorkflowStep,
};
