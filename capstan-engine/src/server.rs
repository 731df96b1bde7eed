//! The controller server: client requests over a local UNIX socket.
//!
//! `Execute` streams progress events until a terminal status is delivered;
//! `completed-pending` passes through without ending the stream so a
//! client can hold the server up until it acknowledges. Everything else is
//! a thin unary shim over the [`ControllerExecutor`] the controller
//! implements.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use capstan_core::{CoreError, Event, EventSink, OperationKey, PhaseId, PhaseState, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::proto::controller_service_server::{ControllerService, ControllerServiceServer};
use crate::proto::{CompleteRequest, Empty, EventFrame, ExecuteRequest, SetPhaseRequest};

/// Phase selector inside an [`ExecuteParams`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseRef {
    /// Operation the phase belongs to; defaults to the active operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<OperationKey>,
    /// Phase to run; `None` with `resume` continues the whole plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PhaseId>,
    /// Bypass ordering and state checks.
    #[serde(default)]
    pub force: bool,
    /// Run the phase's inverse operation.
    #[serde(default)]
    pub rollback: bool,
    /// Continue from the last incomplete phase.
    #[serde(default)]
    pub resume: bool,
    /// Log the intended action without mutating state.
    #[serde(default)]
    pub dry_run: bool,
}

/// Parameters of an `Execute` call. A missing phase means "run the whole
/// plan".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteParams {
    /// Optional phase selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseRef>,
}

/// Parameters of a `SetPhase` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPhaseParams {
    /// Phase to override.
    pub id: PhaseId,
    /// State to write.
    pub state: PhaseState,
}

/// Boxed future returned by controller operations.
pub type OpFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The surface the controller exposes to its server.
pub trait ControllerExecutor: Send + Sync + 'static {
    /// Run the whole plan or a single phase. Serialized by the execution
    /// token; responsible for emitting the terminal success event.
    fn execute(&self, params: ExecuteParams) -> OpFuture<'_>;

    /// Administrative phase-state override.
    fn set_phase(&self, params: SetPhaseParams) -> OpFuture<'_>;

    /// Manually complete the operation.
    fn complete(&self, key: OperationKey) -> OpFuture<'_>;

    /// Request forced tear-down.
    fn request_abort(&self);

    /// Request cooperative shutdown.
    fn request_shutdown(&self);
}

/// Fans events out to every connected client in FIFO order.
pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    /// Create a broadcaster with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for EventBroadcaster {
    fn send(&self, event: Event) {
        // No subscriber just means no client is attached yet.
        let _ = self.tx.send(event);
    }
}

/// gRPC service implementation wrapping a [`ControllerExecutor`].
pub struct ControllerServer<E> {
    executor: Arc<E>,
    events: Arc<EventBroadcaster>,
}

impl<E: ControllerExecutor> ControllerServer<E> {
    /// Create a server for an executor and its event broadcaster.
    pub fn new(executor: Arc<E>, events: Arc<EventBroadcaster>) -> Self {
        Self { executor, events }
    }

    /// Wrap into the generated tonic service.
    pub fn into_service(self) -> ControllerServiceServer<Self> {
        ControllerServiceServer::new(self)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> std::result::Result<T, Status> {
    serde_json::from_slice(data).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn status_from(err: CoreError) -> Status {
    match &err {
        CoreError::PreconditionFailed { .. } => Status::failed_precondition(err.to_string()),
        CoreError::NotImplemented { .. } => Status::unimplemented(err.to_string()),
        CoreError::NotFound { .. } => Status::not_found(err.to_string()),
        CoreError::AlreadyExists { .. } => Status::already_exists(err.to_string()),
        CoreError::Aborted => Status::cancelled(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl<E: ControllerExecutor> ControllerService for ControllerServer<E> {
    type ExecuteStream = ReceiverStream<std::result::Result<EventFrame, Status>>;

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> std::result::Result<Response<Self::ExecuteStream>, Status> {
        let params: ExecuteParams = decode(&request.into_inner().data)?;
        tracing::info!(?params, "execute requested");

        // Subscribe before the work starts so no event is missed.
        let mut rx = self.events.subscribe();
        let (out_tx, out_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let terminal = event.status.is_terminal();
                let data = match serde_json::to_vec(&event) {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                if out_tx.send(Ok(EventFrame { data })).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        let executor = self.executor.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) = executor.execute(params).await {
                tracing::warn!(error = %err, "execute failed");
                events.send(Event::failed(&err));
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    async fn set_phase(
        &self,
        request: Request<SetPhaseRequest>,
    ) -> std::result::Result<Response<Empty>, Status> {
        let params: SetPhaseParams = decode(&request.into_inner().data)?;
        self.executor
            .set_phase(params)
            .await
            .map_err(status_from)?;
        Ok(Response::new(Empty {}))
    }

    async fn complete(
        &self,
        request: Request<CompleteRequest>,
    ) -> std::result::Result<Response<Empty>, Status> {
        let key: OperationKey = decode(&request.into_inner().data)?;
        self.executor.complete(key).await.map_err(status_from)?;
        Ok(Response::new(Empty {}))
    }

    async fn abort(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Empty>, Status> {
        self.executor.request_abort();
        Ok(Response::new(Empty {}))
    }

    async fn shutdown(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Empty>, Status> {
        self.executor.request_shutdown();
        Ok(Response::new(Empty {}))
    }
}

/// Serve the controller on a UNIX domain socket until `shutdown` resolves.
pub async fn serve_unix<E: ControllerExecutor>(
    socket_path: &Path,
    server: ControllerServer<E>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    // A previous run may have left its socket behind.
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| CoreError::fatal(format!("bind {}: {e}", socket_path.display())))?;
    tracing::info!(socket = %socket_path.display(), "controller listening");
    let result = Server::builder()
        .add_service(server.into_service())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| CoreError::fatal(e.to_string()));
    let _ = std::fs::remove_file(socket_path);
    result
}
