//! The peer agent: a per-node RPC service executing phase work on behalf
//! of the controller.
//!
//! Agents exist only while an operation is active. The controller spawns
//! one on every node during agent deployment, dispatches phases to it, and
//! tears it down at the end of the operation: cooperatively via `Stop`
//! after success, forcibly via `Abort` on failure.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use capstan_core::{CoreError, PhaseId, ProgressEntry};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::service::Interceptor;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::error::Result;
use crate::proto::agent_service_server::{AgentService, AgentServiceServer};
use crate::proto::{AgentStatus, Empty, PhaseRequest, ProgressFrame};

/// One phase handed to an agent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAssignment {
    /// Operation the phase belongs to.
    pub operation_key: capstan_core::OperationKey,
    /// Phase to run.
    pub phase_id: PhaseId,
    /// Executor name selecting the implementation on the agent.
    pub executor: String,
    /// Opaque payload from the plan.
    pub data: Option<serde_json::Value>,
    /// True to run the phase's inverse operation.
    pub rollback: bool,
}

/// Boxed future returned by [`PhaseHandler::run_phase`].
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = capstan_core::Result<()>> + Send + 'a>>;

/// Executes dispatched phase work on the local node.
///
/// The agent crate knows nothing about phase implementations; the engine
/// supplies a registry-backed handler when it deploys agents.
pub trait PhaseHandler: Send + Sync + 'static {
    /// Run (or roll back) one phase, reporting progress through `progress`.
    /// Must be re-entrant: the controller may re-dispatch the same phase
    /// after a crash and the work must converge.
    fn run_phase(
        &self,
        assignment: PhaseAssignment,
        progress: mpsc::Sender<ProgressEntry>,
    ) -> HandlerFuture<'_>;
}

/// Configuration for a peer agent.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address the agent listens on.
    pub listen_addr: SocketAddr,
    /// Operation-scoped bearer token inbound calls must present.
    pub token: String,
    /// This node's hostname, reported by `Status`.
    pub hostname: String,
}

/// A running peer agent.
pub struct PeerAgent {
    config: PeerConfig,
    handler: Arc<dyn PhaseHandler>,
    /// Forced tear-down; cancels in-flight phase work.
    abort: CancellationToken,
    /// Cooperative shutdown; lets in-flight work finish.
    stop: CancellationToken,
    active: Arc<AtomicU32>,
}

impl PeerAgent {
    /// Create an unstarted agent.
    pub fn new(config: PeerConfig, handler: Arc<dyn PhaseHandler>) -> Self {
        Self {
            config,
            handler,
            abort: CancellationToken::new(),
            stop: CancellationToken::new(),
            active: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Token cancelled when the agent is aborted; phase work should
    /// observe it at its next suspension point.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Trigger cooperative shutdown from within the process, equivalent to
    /// an inbound `Stop` call.
    pub fn trigger_stop(&self) {
        self.stop.cancel();
    }

    /// Trigger forced tear-down from within the process, equivalent to an
    /// inbound `Abort` call.
    pub fn trigger_abort(&self) {
        self.abort.cancel();
    }

    /// Serve until stopped or aborted, binding `listen_addr`.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await
            .map_err(|e| CoreError::transport(e))?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener. Used by tests to grab an
    /// ephemeral port before starting the agent.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let svc = AgentServiceImpl {
            handler: self.handler.clone(),
            hostname: self.config.hostname.clone(),
            abort: self.abort.clone(),
            stop: self.stop.clone(),
            active: self.active.clone(),
        };
        let auth = BearerAuth {
            expected: format!("Bearer {}", self.config.token),
        };
        let shutdown = {
            let stop = self.stop.clone();
            let abort = self.abort.clone();
            async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = abort.cancelled() => {}
                }
            }
        };
        tracing::info!(addr = %self.config.listen_addr, "peer agent serving");
        Server::builder()
            .add_service(AgentServiceServer::with_interceptor(svc, auth))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;
        tracing::info!("peer agent stopped");
        Ok(())
    }
}

/// Validates the operation token on every inbound call.
#[derive(Clone)]
struct BearerAuth {
    expected: String,
}

impl Interceptor for BearerAuth {
    fn call(&mut self, request: Request<()>) -> std::result::Result<Request<()>, Status> {
        match request.metadata().get("authorization") {
            Some(value) if value.to_str().ok() == Some(self.expected.as_str()) => Ok(request),
            _ => Err(Status::unauthenticated("missing or invalid agent token")),
        }
    }
}

struct AgentServiceImpl {
    handler: Arc<dyn PhaseHandler>,
    hostname: String,
    abort: CancellationToken,
    stop: CancellationToken,
    active: Arc<AtomicU32>,
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    type DispatchStream = ReceiverStream<std::result::Result<ProgressFrame, Status>>;

    async fn dispatch(
        &self,
        request: Request<PhaseRequest>,
    ) -> std::result::Result<Response<Self::DispatchStream>, Status> {
        if self.stop.is_cancelled() || self.abort.is_cancelled() {
            return Err(Status::unavailable("agent is shutting down"));
        }
        let assignment: PhaseAssignment = serde_json::from_slice(&request.into_inner().data)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        tracing::info!(
            phase = %assignment.phase_id,
            rollback = assignment.rollback,
            "dispatching phase"
        );

        let (entry_tx, mut entry_rx) = mpsc::channel::<ProgressEntry>(16);
        let (out_tx, out_rx) = mpsc::channel::<std::result::Result<ProgressFrame, Status>>(16);

        // Forward progress entries as wire frames in emission order.
        let frame_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = entry_rx.recv().await {
                let data = match serde_json::to_vec(&entry) {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                if frame_tx.send(Ok(ProgressFrame { data })).await.is_err() {
                    break;
                }
            }
        });

        let handler = self.handler.clone();
        let abort = self.abort.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            active.fetch_add(1, Ordering::SeqCst);
            let phase_id = assignment.phase_id.clone();
            let result = tokio::select! {
                res = handler.run_phase(assignment, entry_tx) => res,
                _ = abort.cancelled() => Err(CoreError::Aborted),
            };
            active.fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = result {
                tracing::warn!(phase = %phase_id, error = %err, "phase work failed");
                let status = match &err {
                    CoreError::Aborted => Status::cancelled(err.to_string()),
                    CoreError::PreconditionFailed { reason } => {
                        Status::failed_precondition(reason.clone())
                    }
                    _ => Status::internal(err.to_string()),
                };
                let _ = out_tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    async fn stop(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Empty>, Status> {
        tracing::info!("peer agent stop requested");
        self.stop.cancel();
        Ok(Response::new(Empty {}))
    }

    async fn abort(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Empty>, Status> {
        tracing::info!("peer agent abort requested");
        self.abort.cancel();
        Ok(Response::new(Empty {}))
    }

    async fn status(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<AgentStatus>, Status> {
        Ok(Response::new(AgentStatus {
            hostname: self.hostname.clone(),
            active_phases: self.active.load(Ordering::SeqCst),
            stopping: self.stop.is_cancelled() || self.abort.is_cancelled(),
        }))
    }
}
