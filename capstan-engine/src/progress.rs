//! Progress looper: re-publishes plan progress while an operation runs.
//!
//! Polls the plan store and emits a progress event whenever the persisted
//! revision advances, so a client attached mid-operation still sees the
//! current completion state.

use std::sync::Arc;
use std::time::Duration;

use capstan_core::{
    Event, EventSink, OperationKey, PhaseState, PlanStore, ProgressEntry,
};
use tokio_util::sync::CancellationToken;

/// Polls the store and republishes progress.
pub struct ProgressLooper {
    store: Arc<dyn PlanStore>,
    key: OperationKey,
    events: Arc<dyn EventSink>,
    interval: Duration,
}

impl ProgressLooper {
    /// Create a looper for one operation.
    pub fn new(
        store: Arc<dyn PlanStore>,
        key: OperationKey,
        events: Arc<dyn EventSink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            key,
            events,
            interval,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut last_revision = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let snapshot = match self.store.load_plan(&self.key) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::debug!(error = %err, "progress poll failed");
                    continue;
                }
            };
            if snapshot.revision == last_revision {
                continue;
            }
            last_revision = snapshot.revision;
            let active = snapshot
                .plan
                .leaves()
                .find(|p| p.state == PhaseState::InProgress)
                .map(|p| p.id.to_string());
            let message = match &active {
                Some(id) => format!("Executing phase {id}"),
                None => "Waiting for the next phase".to_string(),
            };
            let mut entry =
                ProgressEntry::message(message);
            entry.completion = snapshot.plan.completion_percent();
            entry.phase_id = active;
            self.events.send(Event::progress(entry));
        }
    }
}
