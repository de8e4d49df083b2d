//! In-memory registry of workflow runs.
//!
//! Each run is written only by its own workflow task and read by status
//! queries. A transition updates step, progress and any step fields under
//! one write guard, so readers never see a half-applied step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use preview_common::{WorkflowId, WorkflowRun, WorkflowStep};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    runs: Arc<RwLock<HashMap<WorkflowId, WorkflowRun>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: WorkflowRun) {
        self.runs.write().await.insert(run.workflow_id.clone(), run);
    }

    pub async fn get(&self, id: &WorkflowId) -> Option<WorkflowRun> {
        self.runs.read().await.get(id).cloned()
    }

    /// Advance `id` to `step` and apply `update` in the same critical
    /// section. Returns the updated snapshot, or `None` if the run is
    /// unknown or the move was rejected (backwards or out of a terminal
    /// state), in which case `update` is not applied.
    pub async fn transition<F>(
        &self,
        id: &WorkflowId,
        step: WorkflowStep,
        progress: u8,
        update: F,
    ) -> Option<WorkflowRun>
    where
        F: FnOnce(&mut WorkflowRun),
    {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(id)?;
        if !run.advance(step, progress) {
            debug!(workflow_id = %id, step = %step, current = %run.current_step, "Rejected transition");
            return None;
        }
        update(run);
        Some(run.clone())
    }

    /// All runs, oldest first.
    pub async fn list(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub async fn remove(&self, id: &WorkflowId) -> Option<WorkflowRun> {
        self.runs.write().await.remove(id)
    }

    /// Evict terminal runs that finished more than `retention` ago. Returns
    /// how many were removed.
    pub async fn prune_expired(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, run| match run.finished_at {
            Some(finished) if run.is_terminal() => now.signed_duration_since(finished) < retention,
            _ => true,
        });
        before - runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preview_common::{ForkResult, TerminalState};

    fn run(id: &WorkflowId) -> WorkflowRun {
        WorkflowRun::new(id.clone(), "u1", "octocat", "hello", "main", "local")
    }

    #[tokio::test]
    async fn test_transition_updates_step_and_fields_together() {
        let registry = WorkflowRegistry::new();
        let id = WorkflowId::new();
        registry.insert(run(&id)).await;

        let snapshot = registry
            .transition(&id, WorkflowStep::ForkComplete, 25, |run| {
                run.fork = Some(ForkResult {
                    url: "https://github.com/me/hello".into(),
                    clone_url: "https://github.com/me/hello.git".into(),
                    fork_owner: "me".into(),
                    repo_name: "hello".into(),
                    default_branch: "main".into(),
                    is_new_fork: true,
                });
            })
            .await
            .unwrap();
        assert_eq!(snapshot.current_step, WorkflowStep::ForkComplete);
        assert_eq!(snapshot.progress_percent, 25);

        let stored = registry.get(&id).await.unwrap();
        assert!(stored.fork.unwrap().is_new_fork);
    }

    #[tokio::test]
    async fn test_rejected_transition_skips_update() {
        let registry = WorkflowRegistry::new();
        let id = WorkflowId::new();
        registry.insert(run(&id)).await;
        registry.transition(&id, WorkflowStep::Deployed, 100, |_| {}).await.unwrap();

        let rejected = registry
            .transition(&id, WorkflowStep::Error, 0, |run| run.last_error = Some("late".into()))
            .await;
        assert!(rejected.is_none());
        let stored = registry.get(&id).await.unwrap();
        assert_eq!(stored.terminal_state, TerminalState::Succeeded);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let registry = WorkflowRegistry::new();
        let id = WorkflowId::from("wf-missing");
        assert!(registry.get(&id).await.is_none());
        assert!(registry.transition(&id, WorkflowStep::ForkStart, 10, |_| {}).await.is_none());
    }

    #[tokio::test]
    async fn test_prune_only_evicts_old_terminal_runs() {
        let registry = WorkflowRegistry::new();
        let active = WorkflowId::new();
        let finished = WorkflowId::new();
        registry.insert(run(&active)).await;
        registry.insert(run(&finished)).await;
        registry.transition(&finished, WorkflowStep::Error, 0, |_| {}).await.unwrap();

        assert_eq!(registry.prune_expired(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.prune_expired(Duration::from_millis(1)).await, 1);

        let remaining = registry.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].workflow_id, active);
    }
}
