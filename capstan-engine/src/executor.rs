//! Single-phase execution.
//!
//! Selects the implementation by the phase's executor name and runs it
//! either in-process or on the target node's agent. Transport failures are
//! retried with exponential backoff before being reclassified as a phase
//! failure; a running event is published on entry and a terminal event on
//! exit.

use std::sync::Arc;
use std::time::Duration;

use capstan_agent::{AgentRunner, PhaseAssignment};
use capstan_core::{ClusterServer, CoreError, Event, ProgressEntry, Result};

use crate::context::PhaseContext;
use crate::registry::WorkerRegistry;

/// Tuning for the phase executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per phase before a transport failure becomes terminal.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_base: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

/// Runs one phase against the right target.
pub struct PhaseExecutor {
    registry: Arc<WorkerRegistry>,
    runner: Option<Arc<AgentRunner>>,
    local_server: Option<ClusterServer>,
    config: ExecutorConfig,
}

impl PhaseExecutor {
    /// Create an executor.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        runner: Option<Arc<AgentRunner>>,
        local_server: Option<ClusterServer>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            runner,
            local_server,
            config,
        }
    }

    /// Whether the worker behind `phase` accepts rolled-back dependencies.
    pub fn tolerates_rolled_back(&self, phase: &capstan_core::Phase) -> bool {
        self.registry
            .create(phase)
            .map(|w| w.tolerates_rolled_back())
            .unwrap_or(false)
    }

    /// Run a phase (or its rollback) to completion.
    pub async fn run(&self, ctx: &PhaseContext, rollback: bool) -> Result<()> {
        let verb = if rollback { "Rolling back" } else { "Executing" };
        let completion = ctx
            .plan
            .snapshot()
            .map(|s| s.plan.completion_percent())
            .unwrap_or(0);
        ctx.events.send(Event::progress(ProgressEntry::for_phase(
            ctx.phase.id.to_string(),
            completion,
            format!("{verb} phase {}", ctx.phase.id),
        )));

        let mut attempt = 0;
        loop {
            let result = self.attempt(ctx, rollback).await;
            match result {
                Ok(()) => {
                    ctx.progress(100, format!("Phase {} completed", ctx.phase.id));
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.config.retry_attempts => {
                    let delay = self.config.retry_base * 2u32.pow(attempt);
                    tracing::warn!(
                        phase = %ctx.phase.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying phase after transport failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    // Exhausted transport retries count as a phase failure.
                    let err = if err.is_retryable() {
                        CoreError::phase_failed(&ctx.phase.id, err)
                    } else {
                        err
                    };
                    ctx.progress(completion, format!("Phase {} failed: {err}", ctx.phase.id));
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, ctx: &PhaseContext, rollback: bool) -> Result<()> {
        match (self.remote_target(ctx), &self.runner) {
            (Some(target), Some(runner)) => {
                let assignment = PhaseAssignment {
                    operation_key: ctx.operation.key.clone(),
                    phase_id: ctx.phase.id.clone(),
                    executor: ctx.phase.executor.clone(),
                    data: ctx.phase.data.clone(),
                    rollback,
                };
                let events = ctx.events.clone();
                runner
                    .dispatch(target, assignment, move |entry| {
                        events.send(Event::progress(entry));
                    })
                    .await
                    .map_err(CoreError::from)
            }
            _ => {
                let worker = self.registry.create(&ctx.phase)?;
                if rollback {
                    worker.rollback(ctx).await
                } else {
                    worker.execute(ctx).await
                }
            }
        }
    }

    /// A phase pinned to a node other than the controller's runs remotely.
    fn remote_target<'a>(&self, ctx: &'a PhaseContext) -> Option<&'a ClusterServer> {
        let target = ctx.phase.server.as_ref()?;
        match &self.local_server {
            Some(local) if local.advertise_ip == target.advertise_ip => None,
            _ => Some(target),
        }
    }
}
