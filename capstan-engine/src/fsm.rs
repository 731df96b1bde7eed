//! The plan engine: a durable, phase-structured state machine.
//!
//! Drives an operation's plan to completion by repeatedly picking the
//! deterministically-earliest runnable phase from the frontier, persisting
//! the transition before the work starts and after it returns. A crash
//! between the two persisted states is recoverable by replay because phase
//! work is re-entrant by contract.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::{
    ClusterServer, CoreError, Event, EventSink, Operation, OperationKey, OperationState, Phase,
    PhaseChange, PhaseId, PhaseState, PlanStore, ProgressEntry, Result, Revision, VersionedPlan,
};
use tokio_util::sync::CancellationToken;

use crate::context::{PhaseContext, PlanReader};
use crate::executor::{ExecutorConfig, PhaseExecutor};
use crate::registry::WorkerRegistry;

/// Bounded retries for lost compare-and-swap races and backend blips.
const STORE_RETRIES: u32 = 3;

/// Parameters for single-phase operations.
#[derive(Debug, Clone)]
pub struct PhaseParams {
    /// Target phase.
    pub phase_id: PhaseId,
    /// Bypass ordering and state checks.
    pub force: bool,
    /// Log the intended action without mutating anything but a changelog
    /// marker.
    pub dry_run: bool,
}

impl PhaseParams {
    /// Plain parameters for a phase.
    pub fn new(phase_id: impl Into<PhaseId>) -> Self {
        Self {
            phase_id: phase_id.into(),
            force: false,
            dry_run: false,
        }
    }
}

/// Everything the engine needs to drive one operation.
pub struct FsmConfig {
    /// The operation being driven.
    pub operation: Operation,
    /// Cluster-wide plan store.
    pub store: Arc<dyn PlanStore>,
    /// Node-local store.
    pub local_store: Arc<dyn PlanStore>,
    /// Phase implementations.
    pub registry: Arc<WorkerRegistry>,
    /// Fabric for phases pinned to remote nodes; `None` runs everything
    /// in-process.
    pub runner: Option<Arc<capstan_agent::AgentRunner>>,
    /// Progress sink.
    pub events: Arc<dyn EventSink>,
    /// The node this engine runs on, if it doubles as a cluster member.
    pub local_server: Option<ClusterServer>,
    /// Suppress user-facing output.
    pub silent: bool,
    /// Executor tuning.
    pub executor: ExecutorConfig,
}

/// The plan engine for one operation.
pub struct Fsm {
    operation: Operation,
    store: Arc<dyn PlanStore>,
    local_store: Arc<dyn PlanStore>,
    events: Arc<dyn EventSink>,
    silent: bool,
    executor: PhaseExecutor,
}

impl Fsm {
    /// Wire an engine from its configuration.
    pub fn new(config: FsmConfig) -> Self {
        let executor = PhaseExecutor::new(
            config.registry,
            config.runner,
            config.local_server,
            config.executor,
        );
        Self {
            operation: config.operation,
            store: config.store,
            local_store: config.local_store,
            events: config.events,
            silent: config.silent,
            executor,
        }
    }

    /// The operation key this engine drives.
    pub fn key(&self) -> &OperationKey {
        &self.operation.key
    }

    /// Drive the plan to completion.
    ///
    /// Stops after the current phase returns when `cancel` fires; the
    /// phase's own cancellation is forwarded through its context.
    pub async fn execute_plan(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            let snapshot = self.load().await?;
            let next = {
                let executor = &self.executor;
                snapshot
                    .plan
                    .frontier_with(&|p| executor.tolerates_rolled_back(p))
                    .first()
                    .map(|p| (*p).clone())
            };
            let Some(phase) = next else {
                if snapshot.plan.is_completed() {
                    return Ok(());
                }
                let failed = snapshot.plan.failed_phases();
                if let Some(first) = failed.first() {
                    let causes = failed
                        .iter()
                        .map(|p| {
                            format!("{} ({})", p.id, p.error.as_deref().unwrap_or("unknown"))
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(CoreError::PhaseFailed {
                        phase: first.id.to_string(),
                        cause: causes,
                    });
                }
                return Err(CoreError::fatal(
                    "plan stalled: no runnable phase but the plan is incomplete",
                ));
            };
            self.run_leaf(cancel, phase, false, false).await?;
        }
    }

    /// Run a single phase (or, for a composite, its subtree in DAG order).
    pub async fn execute_phase(
        &self,
        cancel: &CancellationToken,
        params: PhaseParams,
    ) -> Result<()> {
        let snapshot = self.load().await?;
        let phase = snapshot
            .plan
            .get(&params.phase_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                what: format!("phase {}", params.phase_id),
            })?;

        if phase.is_leaf() {
            if !phase.state.is_startable() && !params.force {
                return Err(CoreError::PreconditionFailed {
                    reason: format!(
                        "phase {} is {}; re-run requires force",
                        phase.id, phase.state
                    ),
                });
            }
            if !params.force {
                let executor = &self.executor;
                if !snapshot
                    .plan
                    .requires_satisfied(&phase, &|p| executor.tolerates_rolled_back(p))
                {
                    return Err(CoreError::PreconditionFailed {
                        reason: format!(
                            "phase {} has unsatisfied requirements: {:?}",
                            phase.id, phase.requires
                        ),
                    });
                }
            }
            return self
                .run_leaf(cancel, phase, params.force, params.dry_run)
                .await;
        }

        // Composite: drive the subtree leaf by leaf.
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            let snapshot = self.load().await?;
            let root = snapshot
                .plan
                .get(&params.phase_id)
                .ok_or_else(|| CoreError::NotFound {
                    what: format!("phase {}", params.phase_id),
                })?;
            let subtree: HashSet<PhaseId> = root.iter().map(|p| p.id.clone()).collect();
            let next = if params.force {
                root.iter()
                    .find(|p| p.is_leaf() && p.state.is_startable())
                    .cloned()
            } else {
                let executor = &self.executor;
                snapshot
                    .plan
                    .frontier_with(&|p| executor.tolerates_rolled_back(p))
                    .into_iter()
                    .find(|p| subtree.contains(&p.id))
                    .cloned()
            };
            let Some(phase) = next else {
                let done = root
                    .iter()
                    .filter(|p| p.is_leaf())
                    .all(|p| p.state.is_completed());
                if done || params.dry_run {
                    return Ok(());
                }
                return Err(CoreError::PreconditionFailed {
                    reason: format!(
                        "phase {} cannot make progress; some leaves are blocked or failed",
                        params.phase_id
                    ),
                });
            };
            self.run_leaf(cancel, phase, params.force, params.dry_run)
                .await?;
            if params.dry_run {
                // One pass is enough; nothing was persisted.
                return Ok(());
            }
        }
    }

    /// Roll back a single phase.
    ///
    /// `timeout` bounds only the rollback work of each leaf, not the store
    /// writes around it.
    pub async fn rollback_phase(
        &self,
        cancel: &CancellationToken,
        params: PhaseParams,
        timeout: Duration,
    ) -> Result<()> {
        let snapshot = self.load().await?;
        let root = snapshot
            .plan
            .get(&params.phase_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                what: format!("phase {}", params.phase_id),
            })?;

        let subtree: HashSet<PhaseId> = root.iter().map(|p| p.id.clone()).collect();
        if !params.force {
            // Dependents of this subtree must already be unwound.
            for p in snapshot.plan.iter() {
                if subtree.contains(&p.id) {
                    continue;
                }
                // A failed dependent never finished its work, so it does
                // not pin this phase's effects in place.
                let depends = p.requires.iter().any(|r| subtree.contains(r));
                if depends
                    && matches!(p.state, PhaseState::Completed | PhaseState::InProgress)
                {
                    return Err(CoreError::PreconditionFailed {
                        reason: format!(
                            "phase {} depends on {}; roll it back first",
                            p.id, params.phase_id
                        ),
                    });
                }
            }
            if !root.is_leaf() {
                // A composite rollback requires its children unwound first.
                let blocked: Vec<String> = root
                    .iter()
                    .skip(1)
                    .filter(|p| {
                        p.is_leaf()
                            && !matches!(
                                p.state,
                                PhaseState::Unstarted | PhaseState::RolledBack
                            )
                    })
                    .map(|p| p.id.to_string())
                    .collect();
                if !blocked.is_empty() {
                    return Err(CoreError::PreconditionFailed {
                        reason: format!(
                            "phase {} has children that are not rolled back: {}",
                            params.phase_id,
                            blocked.join(", ")
                        ),
                    });
                }
                return Ok(());
            }
        }

        // Walk completed leaves in reverse completion order. A bare leaf
        // is its own single-element walk.
        let order: Vec<Phase> = if root.is_leaf() {
            vec![root]
        } else {
            snapshot
                .plan
                .rollback_order(&params.phase_id)
                .into_iter()
                .cloned()
                .collect()
        };
        for phase in order {
            if cancel.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            if matches!(phase.state, PhaseState::Unstarted | PhaseState::RolledBack) {
                continue;
            }
            self.rollback_leaf(cancel, phase, params.force, params.dry_run, timeout)
                .await?;
        }
        Ok(())
    }

    /// Administrative phase-state override. Bypasses every check; the
    /// changelog entry is tagged as forced.
    pub async fn set_phase(&self, phase_id: &PhaseId, state: PhaseState) -> Result<()> {
        self.persist(phase_id, state, None, true).await?;
        self.send_message(format!("Phase {phase_id} set to {state}"));
        Ok(())
    }

    /// Mark the operation terminal.
    ///
    /// With an error, the operation record goes to `failed` (or `aborted`)
    /// without touching phase states; without one, it completes only if
    /// the plan did.
    pub async fn complete(&self, outcome: Option<&CoreError>) -> Result<()> {
        let plan_done = self
            .load()
            .await
            .map(|s| s.plan.is_completed())
            .unwrap_or(false);
        let (state, note) = match outcome {
            Some(err) if err.is_aborted() => {
                (OperationState::Aborted, format!("operation aborted: {err}"))
            }
            Some(err) => (OperationState::Failed, format!("operation failed: {err}")),
            None if plan_done => (OperationState::Completed, "operation completed".into()),
            None => (
                OperationState::Failed,
                "operation completed manually with an incomplete plan".into(),
            ),
        };
        self.store
            .update_operation_state(&self.operation.key, state)?;
        self.store.append_note(&self.operation.key, note)?;
        Ok(())
    }

    async fn run_leaf(
        &self,
        cancel: &CancellationToken,
        phase: Phase,
        force: bool,
        dry_run: bool,
    ) -> Result<()> {
        if dry_run {
            self.store.append_note(
                self.key(),
                format!("dry-run: phase {} would execute", phase.id),
            )?;
            self.send_message(format!("Would execute phase {}", phase.id));
            return Ok(());
        }
        self.ensure_in_progress()?;
        self.persist(&phase.id, PhaseState::InProgress, None, force)
            .await?;
        tracing::info!(phase = %phase.id, "executing phase");

        let ctx = self.phase_context(phase.clone(), cancel.child_token());
        match self.executor.run(&ctx, false).await {
            Ok(()) => {
                self.persist(&phase.id, PhaseState::Completed, None, force)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.persist(&phase.id, PhaseState::Failed, Some(err.to_string()), force)
                    .await?;
                tracing::warn!(phase = %phase.id, error = %err, "phase failed");
                match err {
                    wrapped @ CoreError::PhaseFailed { .. } => Err(wrapped),
                    other => Err(CoreError::phase_failed(&phase.id, other)),
                }
            }
        }
    }

    async fn rollback_leaf(
        &self,
        cancel: &CancellationToken,
        phase: Phase,
        force: bool,
        dry_run: bool,
        timeout: Duration,
    ) -> Result<()> {
        if dry_run {
            self.store.append_note(
                self.key(),
                format!("dry-run: phase {} would roll back", phase.id),
            )?;
            self.send_message(format!("Would roll back phase {}", phase.id));
            return Ok(());
        }
        self.persist(&phase.id, PhaseState::InProgress, None, force)
            .await?;
        tracing::info!(phase = %phase.id, "rolling back phase");

        let ctx = self.phase_context(phase.clone(), cancel.child_token());
        let result = match tokio::time::timeout(timeout, self.executor.run(&ctx, true)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::phase_failed(
                &phase.id,
                format!("rollback timed out after {timeout:?}"),
            )),
        };
        match result {
            Ok(()) => {
                self.persist(&phase.id, PhaseState::RolledBack, None, force)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.persist(&phase.id, PhaseState::Failed, Some(err.to_string()), force)
                    .await?;
                match err {
                    wrapped @ CoreError::PhaseFailed { .. } => Err(wrapped),
                    other => Err(CoreError::phase_failed(&phase.id, other)),
                }
            }
        }
    }

    fn phase_context(&self, phase: Phase, cancel: CancellationToken) -> PhaseContext {
        PhaseContext {
            operation: self.operation.clone(),
            phase,
            store: self.store.clone(),
            local_store: self.local_store.clone(),
            plan: PlanReader::new(self.store.clone(), self.operation.key.clone()),
            events: self.events.clone(),
            silent: self.silent,
            cancel,
        }
    }

    fn ensure_in_progress(&self) -> Result<()> {
        let op = self.store.get_operation(&self.operation.key)?;
        if op.state == OperationState::Initialized {
            self.store
                .update_operation_state(&self.operation.key, OperationState::InProgress)?;
        }
        Ok(())
    }

    fn send_message(&self, message: String) {
        if !self.silent {
            self.events
                .send(Event::progress(ProgressEntry::message(message)));
        }
    }

    /// Load the plan, retrying transient backend failures.
    async fn load(&self) -> Result<VersionedPlan> {
        let mut attempt = 0u32;
        loop {
            match self.store.load_plan(&self.operation.key) {
                Err(err @ CoreError::BackendUnavailable { .. }) => {
                    if attempt + 1 >= STORE_RETRIES {
                        return Err(err);
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Persist one phase transition, retrying lost CAS races a bounded
    /// number of times before surfacing the stale revision.
    async fn persist(
        &self,
        phase_id: &PhaseId,
        state: PhaseState,
        error: Option<String>,
        forced: bool,
    ) -> Result<Revision> {
        let mut attempt = 0u32;
        loop {
            let revision = self.load().await?.revision;
            let change = PhaseChange {
                phase_id: phase_id.clone(),
                new_state: state,
                error: error.clone(),
                expected_revision: revision,
                forced,
            };
            match self.store.update_phase(&self.operation.key, change) {
                Ok(revision) => return Ok(revision),
                Err(err @ (CoreError::StaleRevision { .. } | CoreError::BackendUnavailable { .. })) => {
                    if attempt + 1 >= STORE_RETRIES {
                        return Err(err);
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
