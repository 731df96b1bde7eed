//! The updater: a fully wired engine handle for one operation.
//!
//! What a flavor's `new_updater` returns: the FSM plus the small amount of
//! glue the CLI drives directly (run, single-phase operations, manual
//! completion, activation).

use std::sync::Arc;
use std::time::Duration;

use capstan_core::{
    ClusterServer, CoreError, EventSink, Operation, OperationState, PhaseState, PlanStore, Result,
};
use tokio_util::sync::CancellationToken;

use crate::executor::ExecutorConfig;
use crate::fsm::{Fsm, FsmConfig, PhaseParams};
use crate::registry::WorkerRegistry;

/// Configuration for a wired updater.
pub struct UpdaterConfig {
    /// The operation to drive.
    pub operation: Operation,
    /// Cluster-wide plan store.
    pub store: Arc<dyn PlanStore>,
    /// Node-local store.
    pub local_store: Arc<dyn PlanStore>,
    /// Phase implementations.
    pub registry: Arc<WorkerRegistry>,
    /// Fabric for remote phases.
    pub runner: Option<Arc<capstan_agent::AgentRunner>>,
    /// Progress sink.
    pub events: Arc<dyn EventSink>,
    /// The local cluster member, if any.
    pub local_server: Option<ClusterServer>,
    /// Suppress user-facing output.
    pub silent: bool,
}

/// Engine handle for one operation.
pub struct Updater {
    fsm: Fsm,
    store: Arc<dyn PlanStore>,
    operation: Operation,
}

impl Updater {
    /// Wire an updater.
    pub fn new(config: UpdaterConfig) -> Self {
        let operation = config.operation.clone();
        let store = config.store.clone();
        let fsm = Fsm::new(FsmConfig {
            operation: config.operation,
            store: config.store,
            local_store: config.local_store,
            registry: config.registry,
            runner: config.runner,
            events: config.events,
            local_server: config.local_server,
            silent: config.silent,
            executor: ExecutorConfig::default(),
        });
        Self {
            fsm,
            store,
            operation,
        }
    }

    /// The underlying engine.
    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    /// Drive the plan to completion and mark the operation terminal.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.fsm.execute_plan(cancel).await;
        if let Err(err) = self.fsm.complete(result.as_ref().err()).await {
            tracing::warn!(error = %err, "failed to complete operation");
            return result.and(Err(err));
        }
        result
    }

    /// Execute one phase.
    pub async fn execute_phase(
        &self,
        cancel: &CancellationToken,
        params: PhaseParams,
    ) -> Result<()> {
        self.fsm.execute_phase(cancel, params).await
    }

    /// Roll back one phase.
    pub async fn rollback_phase(
        &self,
        cancel: &CancellationToken,
        params: PhaseParams,
        timeout: Duration,
    ) -> Result<()> {
        self.fsm.rollback_phase(cancel, params, timeout).await
    }

    /// Administrative phase-state override.
    pub async fn set_phase(
        &self,
        phase_id: &capstan_core::PhaseId,
        state: PhaseState,
    ) -> Result<()> {
        self.fsm.set_phase(phase_id, state).await
    }

    /// Manually complete the operation.
    pub async fn complete(&self, outcome: Option<&CoreError>) -> Result<()> {
        self.fsm.complete(outcome).await
    }

    /// Flip the operation record to its terminal state once the plan is
    /// done and release the update lease.
    pub fn activate(&self) -> Result<()> {
        let operation = self.store.get_operation(&self.operation.key)?;
        if operation.state.is_terminal() {
            return Ok(());
        }
        let plan_done = self
            .store
            .load_plan(&self.operation.key)
            .map(|s| s.plan.is_completed())
            .unwrap_or(false);
        if !plan_done {
            return Err(CoreError::PreconditionFailed {
                reason: format!(
                    "operation {} still has incomplete phases",
                    self.operation.key
                ),
            });
        }
        self.store
            .update_operation_state(&self.operation.key, OperationState::Completed)?;
        self.store
            .append_note(&self.operation.key, "update lease released".into())?;
        Ok(())
    }
}
