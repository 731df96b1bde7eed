//! Full-fabric test: the engine dispatches a phase pinned to a remote
//! node through a real peer agent and collects its progress.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use capstan_agent::{mint_token, AgentRunner, PeerAgent, PeerConfig};
use capstan_core::{
    BufferedSink, ClusterServer, EventStatus, MemoryStore, Operation, OperationFlavor,
    OperationPlan, Phase, PhaseId, PhaseState, PlanStore, ServerRole,
};
use capstan_engine::handler::RegistryHandler;
use capstan_engine::{Updater, UpdaterConfig, WorkerRegistry};

use common::{op_key, recording_registry, Failures, WorkerLog, TEST_EXECUTOR};

fn remote_server() -> ClusterServer {
    ClusterServer {
        advertise_ip: "127.0.0.1".parse().unwrap(),
        hostname: "remote-1".into(),
        role: ServerRole::Master,
        profile: "master".into(),
    }
}

#[tokio::test]
async fn phase_pinned_to_remote_node_runs_on_its_agent() {
    let key = op_key();
    let operation = Operation::new(key.clone(), OperationFlavor::Reconfigure);
    let store = Arc::new(MemoryStore::new());
    store.create_operation(operation.clone()).unwrap();

    let server = remote_server();
    let root = PhaseId::new("update-config");
    let apply = Phase::leaf(root.child("apply").child(&server.hostname), TEST_EXECUTOR)
        .on_server(server.clone());
    let plan = OperationPlan::new(
        key.clone(),
        "rev-1",
        vec![Phase::composite(root, vec![apply])],
    )
    .unwrap();
    store.save_plan(plan).unwrap();

    // The agent executes through the recording registry; the controller
    // side carries no workers at all, so local fallback would fail.
    let log = WorkerLog::new();
    let agent_registry = recording_registry(log.clone(), Failures::new(), Duration::ZERO);
    let handler = RegistryHandler::new(
        agent_registry,
        store.clone(),
        store.clone(),
        operation.clone(),
        CancellationToken::new(),
    );

    let token = mint_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let agent = Arc::new(PeerAgent::new(
        PeerConfig {
            listen_addr: listener.local_addr().unwrap(),
            token: token.clone(),
            hostname: server.hostname.clone(),
        },
        Arc::new(handler),
    ));
    let serving = agent.clone();
    tokio::spawn(async move {
        serving.serve_on(listener).await.unwrap();
    });

    let runner = Arc::new(AgentRunner::new(token));
    runner.add_peer(&server, port);

    let sink = Arc::new(BufferedSink::new());
    let updater = Updater::new(UpdaterConfig {
        operation,
        store: store.clone(),
        local_store: store.clone(),
        registry: Arc::new(WorkerRegistry::new()),
        runner: Some(runner.clone()),
        events: sink.clone(),
        local_server: None,
        silent: false,
    });

    updater.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(log.executions(), vec!["update-config/apply/remote-1"]);
    let snapshot = store.load_plan(&op_key()).unwrap();
    assert_eq!(
        snapshot
            .plan
            .get(&"update-config/apply/remote-1".into())
            .unwrap()
            .state,
        PhaseState::Completed
    );
    // Progress from the agent came back through the event stream.
    assert!(sink
        .events()
        .iter()
        .any(|e| e.status == EventStatus::Running));

    runner.stop_group().await.unwrap();
}
