//! Registry-backed phase handler for peer agents.
//!
//! The agent crate only knows the narrow `PhaseHandler` seam; this module
//! implements it on top of the worker registry so a node's agent executes
//! the same implementations the controller runs in-process.

use std::sync::Arc;

use capstan_agent::{HandlerFuture, PhaseAssignment, PhaseHandler};
use capstan_core::{Event, EventSink, Operation, Phase, PlanStore, ProgressEntry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{PhaseContext, PlanReader};
use crate::registry::WorkerRegistry;

/// Sink forwarding progress entries into a dispatch stream.
struct ChannelSink {
    tx: mpsc::Sender<ProgressEntry>,
}

impl EventSink for ChannelSink {
    fn send(&self, event: Event) {
        if let Some(entry) = event.progress {
            // A full channel means the consumer lags; drop rather than
            // block phase work on progress delivery.
            let _ = self.tx.try_send(entry);
        }
    }
}

/// Executes dispatched phases through the worker registry.
pub struct RegistryHandler {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn PlanStore>,
    local_store: Arc<dyn PlanStore>,
    operation: Operation,
    cancel: CancellationToken,
}

impl RegistryHandler {
    /// Create a handler for one operation.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn PlanStore>,
        local_store: Arc<dyn PlanStore>,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            local_store,
            operation,
            cancel,
        }
    }
}

impl PhaseHandler for RegistryHandler {
    fn run_phase(
        &self,
        assignment: PhaseAssignment,
        progress: mpsc::Sender<ProgressEntry>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut phase = Phase::leaf(assignment.phase_id.clone(), assignment.executor.clone());
            phase.data = assignment.data.clone();

            let ctx = PhaseContext {
                operation: self.operation.clone(),
                phase: phase.clone(),
                store: self.store.clone(),
                local_store: self.local_store.clone(),
                plan: PlanReader::new(self.store.clone(), assignment.operation_key.clone()),
                events: Arc::new(ChannelSink { tx: progress }),
                silent: true,
                cancel: self.cancel.child_token(),
            };

            let worker = self.registry.create(&phase)?;
            if assignment.rollback {
                worker.rollback(&ctx).await
            } else {
                worker.execute(&ctx).await
            }
        })
    }
}
