//! Phase-worker registry.
//!
//! Phases identify their implementation by the `executor` string; the
//! registry maps that name to a constructor. Adding a phase type is a
//! registration, not an enum extension.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use capstan_core::{CoreError, Phase, Result};

use crate::context::PhaseContext;

/// Boxed future returned by phase work.
pub type WorkerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The logic behind one phase.
///
/// Workers must be re-entrant: the engine may invoke the same phase id
/// multiple times (resume after crash, forced re-run) and the work must
/// converge — observe the target state and return, or bring it about.
pub trait PhaseWorker: Send + Sync {
    /// Run the phase's work.
    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> WorkerFuture<'a>;

    /// Run the phase's inverse operation.
    fn rollback<'a>(&'a self, ctx: &'a PhaseContext) -> WorkerFuture<'a> {
        let phase = ctx.phase.id.clone();
        Box::pin(async move {
            Err(CoreError::NotImplemented {
                hint: format!("phase {phase} does not support rollback"),
            })
        })
    }

    /// True when this worker accepts rolled-back dependencies.
    fn tolerates_rolled_back(&self) -> bool {
        false
    }

    /// True when this worker may run concurrently with sibling phases on
    /// disjoint agents. The shipped engine serializes regardless; the
    /// declaration is recorded for schedulers that honor it.
    fn concurrency_safe(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn PhaseWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn PhaseWorker>")
    }
}

type WorkerCtor = Box<dyn Fn(&Phase) -> Result<Box<dyn PhaseWorker>> + Send + Sync>;

/// Maps executor names to worker constructors.
#[derive(Default)]
pub struct WorkerRegistry {
    ctors: HashMap<String, WorkerCtor>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Phase) -> Result<Box<dyn PhaseWorker>> + Send + Sync + 'static,
    {
        self.ctors.insert(name.into(), Box::new(ctor));
    }

    /// Instantiate the worker for a phase.
    pub fn create(&self, phase: &Phase) -> Result<Box<dyn PhaseWorker>> {
        let ctor = self
            .ctors
            .get(&phase.executor)
            .ok_or_else(|| CoreError::NotFound {
                what: format!("phase executor {:?}", phase.executor),
            })?;
        ctor(phase)
    }

    /// True when an executor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered executor names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ctors.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::PhaseId;

    struct NoopWorker;

    impl PhaseWorker for NoopWorker {
        fn execute<'a>(&'a self, _ctx: &'a PhaseContext) -> WorkerFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn create_by_executor_name() {
        let mut registry = WorkerRegistry::new();
        registry.register("test/noop", |_| Ok(Box::new(NoopWorker)));

        let phase = Phase::leaf(PhaseId::new("root/a"), "test/noop");
        assert!(registry.create(&phase).is_ok());
        assert!(registry.contains("test/noop"));
    }

    #[test]
    fn unknown_executor_is_not_found() {
        let registry = WorkerRegistry::new();
        let phase = Phase::leaf(PhaseId::new("root/a"), "test/missing");
        assert!(registry.create(&phase).unwrap_err().is_not_found());
    }
}
