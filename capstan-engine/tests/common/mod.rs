//! Common test utilities for engine integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use capstan_core::{
    BufferedSink, CoreError, MemoryStore, Operation, OperationFlavor, OperationKey,
    OperationPlan, Phase, PhaseId, PlanStore,
};
use capstan_engine::{
    PhaseContext, PhaseWorker, Updater, UpdaterConfig, WorkerFuture, WorkerRegistry,
};

/// Executor name every test phase uses.
pub const TEST_EXECUTOR: &str = "test/phase";

/// Shared observation point for test workers.
#[derive(Default)]
pub struct WorkerLog {
    executions: Mutex<Vec<String>>,
    rollbacks: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Notified whenever a worker enters its work section.
    pub entered: Notify,
}

impl WorkerLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, id: &str) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.executions.lock().push(id.to_string());
        self.entered.notify_waiters();
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Phase ids in execution order, repeats included.
    pub fn executions(&self) -> Vec<String> {
        self.executions.lock().clone()
    }

    /// Phase ids in rollback order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().clone()
    }

    /// How many times `id` executed.
    pub fn count(&self, id: &str) -> usize {
        self.executions.lock().iter().filter(|e| *e == id).count()
    }

    /// Peak number of concurrently running workers.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Mutable failure injection shared between the test and its workers.
#[derive(Default)]
pub struct Failures {
    failing: Mutex<HashSet<String>>,
    wait_for_cancel: Mutex<HashSet<String>>,
}

impl Failures {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `id` fail until cleared.
    pub fn fail(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    /// Clear every injected failure.
    pub fn clear(&self) {
        self.failing.lock().clear();
    }

    /// Make `id` park until the operation is aborted.
    pub fn park(&self, id: &str) {
        self.wait_for_cancel.lock().insert(id.to_string());
    }

    fn fails(&self, id: &str) -> bool {
        self.failing.lock().contains(id)
    }

    fn parks(&self, id: &str) -> bool {
        self.wait_for_cancel.lock().contains(id)
    }
}

struct RecordingWorker {
    id: String,
    log: Arc<WorkerLog>,
    failures: Arc<Failures>,
    delay: Duration,
}

impl PhaseWorker for RecordingWorker {
    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            self.log.enter(&self.id);
            let result = async {
                if self.failures.parks(&self.id) {
                    ctx.cancel.cancelled().await;
                    return Err(CoreError::Aborted);
                }
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if self.failures.fails(&self.id) {
                    return Err(CoreError::fatal(format!("induced failure in {}", self.id)));
                }
                Ok(())
            }
            .await;
            self.log.exit();
            result
        })
    }

    fn rollback<'a>(&'a self, _ctx: &'a PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            self.log.rollbacks.lock().push(self.id.clone());
            Ok(())
        })
    }
}

/// A registry with one recording worker type under [`TEST_EXECUTOR`].
pub fn recording_registry(
    log: Arc<WorkerLog>,
    failures: Arc<Failures>,
    delay: Duration,
) -> Arc<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();
    registry.register(TEST_EXECUTOR, move |phase| {
        Ok(Box::new(RecordingWorker {
            id: phase.id.to_string(),
            log: log.clone(),
            failures: failures.clone(),
            delay,
        }))
    });
    Arc::new(registry)
}

pub fn op_key() -> OperationKey {
    OperationKey::new("acme", "prod", "op-1")
}

/// The reconfigure-shaped plan from the end-to-end scenarios:
/// validate -> apply/master-1 -> apply/master-2 -> restart.
pub fn reconfigure_plan(key: &OperationKey) -> OperationPlan {
    let root = PhaseId::new("update-config");
    let validate = Phase::leaf(root.child("validate"), TEST_EXECUTOR);
    let first = Phase::leaf(root.child("apply").child("master-1"), TEST_EXECUTOR)
        .requiring(vec![validate.id.clone()]);
    let second = Phase::leaf(root.child("apply").child("master-2"), TEST_EXECUTOR)
        .requiring(vec![first.id.clone()]);
    let restart = Phase::leaf(root.child("restart"), TEST_EXECUTOR)
        .requiring(vec![first.id.clone(), second.id.clone()]);
    let apply = Phase::composite(root.child("apply"), vec![first, second]);
    OperationPlan::new(
        key.clone(),
        "rev-1",
        vec![Phase::composite(root, vec![validate, apply, restart])],
    )
    .unwrap()
}

/// Store seeded with the reconfigure operation and plan.
pub fn seeded_store() -> (Arc<MemoryStore>, Operation) {
    let key = op_key();
    let operation = Operation::new(key.clone(), OperationFlavor::Reconfigure);
    let store = Arc::new(MemoryStore::new());
    store.create_operation(operation.clone()).unwrap();
    store.save_plan(reconfigure_plan(&key)).unwrap();
    (store, operation)
}

/// Wire an updater over the given store and registry.
pub fn updater(
    store: Arc<MemoryStore>,
    operation: Operation,
    registry: Arc<WorkerRegistry>,
    sink: Arc<BufferedSink>,
) -> Updater {
    Updater::new(UpdaterConfig {
        operation,
        store: store.clone(),
        local_store: store,
        registry,
        runner: None,
        events: sink,
        local_server: None,
        silent: false,
    })
}
