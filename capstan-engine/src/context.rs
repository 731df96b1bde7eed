//! Execution context handed to phase workers.
//!
//! Workers receive narrow capabilities rather than the engine itself: a
//! [`PlanReader`] for consistent plan snapshots and an
//! [`capstan_core::EventSink`] for progress. Neither side owns the other.

use std::sync::Arc;

use capstan_core::{
    Event, EventSink, Operation, OperationKey, Phase, PhaseId, PlanStore, ProgressEntry, Result,
    VersionedPlan,
};
use tokio_util::sync::CancellationToken;

/// Read-only view of the persisted plan, consistent per call as of the
/// revision the snapshot was loaded at.
#[derive(Clone)]
pub struct PlanReader {
    store: Arc<dyn PlanStore>,
    key: OperationKey,
}

impl PlanReader {
    /// Create a reader for one operation's plan.
    pub fn new(store: Arc<dyn PlanStore>, key: OperationKey) -> Self {
        Self { store, key }
    }

    /// The operation key the reader is scoped to.
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Load the latest plan snapshot.
    pub fn snapshot(&self) -> Result<VersionedPlan> {
        self.store.load_plan(&self.key)
    }

    /// Load one phase from the latest snapshot.
    pub fn phase(&self, id: &PhaseId) -> Result<Phase> {
        let snapshot = self.snapshot()?;
        snapshot
            .plan
            .get(id)
            .cloned()
            .ok_or_else(|| capstan_core::CoreError::NotFound {
                what: format!("phase {id}"),
            })
    }
}

/// Everything a phase worker gets to see.
pub struct PhaseContext {
    /// The operation being executed.
    pub operation: Operation,
    /// Snapshot of the phase being run (id, data, target server).
    pub phase: Phase,
    /// Cluster-wide plan store.
    pub store: Arc<dyn PlanStore>,
    /// Node-local store for state that must survive without the cluster.
    pub local_store: Arc<dyn PlanStore>,
    /// Read-only plan view.
    pub plan: PlanReader,
    /// Progress sink.
    pub events: Arc<dyn EventSink>,
    /// Suppress user-facing output.
    pub silent: bool,
    /// Cancelled when the operation is aborted; workers observe it at
    /// their next RPC or polling point.
    pub cancel: CancellationToken,
}

impl PhaseContext {
    /// Publish a progress entry attributed to this phase.
    pub fn progress(&self, completion: u8, message: impl Into<String>) {
        self.events.send(Event::progress(ProgressEntry::for_phase(
            self.phase.id.to_string(),
            completion,
            message,
        )));
    }

    /// True once the operation has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
