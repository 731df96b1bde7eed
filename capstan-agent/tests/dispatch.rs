//! Loopback tests for the agent fabric: a real peer agent on an ephemeral
//! port, driven by a runner over the wire.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use capstan_agent::{
    mint_token, AgentRunner, HandlerFuture, PeerAgent, PeerConfig, PhaseAssignment, PhaseHandler,
};
use capstan_core::{ClusterServer, CoreError, OperationKey, ProgressEntry, ServerRole};

struct EchoHandler;

impl PhaseHandler for EchoHandler {
    fn run_phase(
        &self,
        assignment: PhaseAssignment,
        progress: mpsc::Sender<ProgressEntry>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            if assignment.rollback {
                return Err(CoreError::NotImplemented {
                    hint: "phase has no rollback".into(),
                });
            }
            let _ = progress
                .send(ProgressEntry::for_phase(
                    assignment.phase_id.to_string(),
                    10,
                    "starting",
                ))
                .await;
            let _ = progress
                .send(ProgressEntry::for_phase(
                    assignment.phase_id.to_string(),
                    100,
                    "done",
                ))
                .await;
            Ok(())
        })
    }
}

fn local_server() -> ClusterServer {
    ClusterServer {
        advertise_ip: "127.0.0.1".parse().unwrap(),
        hostname: "loopback".into(),
        role: ServerRole::Master,
        profile: "master".into(),
    }
}

fn assignment(rollback: bool) -> PhaseAssignment {
    PhaseAssignment {
        operation_key: OperationKey::new("acme", "prod", "op-1"),
        phase_id: "update-config/apply/loopback".into(),
        executor: "config/apply".into(),
        data: None,
        rollback,
    }
}

async fn start_agent(token: &str) -> (Arc<PeerAgent>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let agent = Arc::new(PeerAgent::new(
        PeerConfig {
            listen_addr: listener.local_addr().unwrap(),
            token: token.into(),
            hostname: "loopback".into(),
        },
        Arc::new(EchoHandler),
    ));
    let serving = agent.clone();
    tokio::spawn(async move {
        serving.serve_on(listener).await.unwrap();
    });
    (agent, port)
}

#[tokio::test]
async fn dispatch_streams_progress_in_order() {
    let token = mint_token();
    let (_agent, port) = start_agent(&token).await;

    let runner = AgentRunner::new(token);
    let server = local_server();
    runner.add_peer(&server, port);

    let mut messages = Vec::new();
    runner
        .dispatch(&server, assignment(false), |entry| {
            messages.push((entry.completion, entry.message));
        })
        .await
        .unwrap();

    assert_eq!(
        messages,
        vec![(10, "starting".to_string()), (100, "done".to_string())]
    );
}

#[tokio::test]
async fn remote_failure_surfaces_through_stream() {
    let token = mint_token();
    let (_agent, port) = start_agent(&token).await;

    let runner = AgentRunner::new(token);
    let server = local_server();
    runner.add_peer(&server, port);

    let err = runner
        .dispatch(&server, assignment(true), |_| {})
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no rollback"));
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let token = mint_token();
    let (_agent, port) = start_agent(&token).await;

    let runner = AgentRunner::new("not-the-token");
    let server = local_server();
    runner.add_peer(&server, port);

    let err = runner
        .dispatch(&server, assignment(false), |_| {})
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token"));
}

#[tokio::test]
async fn stop_group_is_idempotent() {
    let token = mint_token();
    let (_agent, port) = start_agent(&token).await;

    let runner = AgentRunner::new(token);
    let server = local_server();
    runner.add_peer(&server, port);

    runner.stop_group().await.unwrap();
    // A second stop must not error even though the agent is shutting down.
    let _ = runner.stop_group().await;
}
