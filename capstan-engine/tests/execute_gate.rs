//! The execution token: concurrent Execute calls never overlap their
//! phase-work sections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capstan_core::{ClusterConfig, ClusterState};
use capstan_engine::{
    ConfigInitializer, Controller, ControllerConfig, ControllerExecutor, ExecuteParams, PhaseRef,
};

use common::{recording_registry, seeded_store, Failures, WorkerLog};

fn controller(
    log: Arc<WorkerLog>,
    delay: Duration,
) -> (Arc<Controller>, tempfile::TempDir) {
    let (store, operation) = seeded_store();
    let registry = recording_registry(log, Failures::new(), delay);
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::new(ControllerConfig {
        cluster: ClusterState {
            account_id: operation.key.account_id.clone(),
            name: operation.key.cluster_name.clone(),
            servers: Vec::new(),
            config: ClusterConfig::empty(),
            revision: "rev-1".into(),
        },
        operation,
        store: store.clone(),
        local_store: store,
        registry,
        initializer: Arc::new(ConfigInitializer::reset()),
        local_server: None,
        agent_port: capstan_agent::DEFAULT_AGENT_PORT,
        silent: true,
        shutdown_timeout: Duration::from_secs(5),
        socket_path: dir.path().join("controller.sock"),
    });
    (controller, dir)
}

fn single_phase(id: &str, force: bool) -> ExecuteParams {
    ExecuteParams {
        phase: Some(PhaseRef {
            id: Some(id.into()),
            force,
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn concurrent_executes_are_serialized() {
    let log = WorkerLog::new();
    let (controller, _dir) = controller(log.clone(), Duration::from_millis(50));

    let first = controller.execute(single_phase("update-config/validate", false));
    let second = controller.execute(single_phase("update-config/apply/master-1", true));
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    assert_eq!(log.executions().len(), 2);
    assert_eq!(log.max_in_flight(), 1, "phase-work sections overlapped");
}

#[tokio::test]
async fn execute_after_abort_request_is_rejected() {
    let log = WorkerLog::new();
    let (controller, _dir) = controller(log.clone(), Duration::ZERO);

    controller.request_abort();
    let err = controller
        .execute(single_phase("update-config/validate", false))
        .await
        .unwrap_err();
    assert!(err.is_aborted());
    assert!(log.executions().is_empty());
}
