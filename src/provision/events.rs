//! Progress event fan-out.
//!
//! Emission never fails and never blocks the workflow: with no subscribers,
//! or with a subscriber that lags behind, events are simply dropped for it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use preview_common::{WorkflowEvent, WorkflowId};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
    /// Highest progress emitted so far, per run.
    high_water: Mutex<HashMap<WorkflowId, u8>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            high_water: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`, raising its progress to the highest value already
    /// emitted for the same run. Terminal events release the run's entry.
    pub fn emit(&self, mut event: WorkflowEvent) {
        {
            let mut high_water = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
            let seen = high_water.entry(event.workflow_id.clone()).or_insert(0);
            event.progress = event.progress.max(*seen);
            *seen = event.progress;
            if event.is_terminal() {
                high_water.remove(&event.workflow_id);
            }
        }
        trace!(workflow_id = %event.workflow_id, step = %event.step, progress = event.progress, "Emitting event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
