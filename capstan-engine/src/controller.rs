//! The controller: a local supervisor for one operation.
//!
//! Serializes client requests through the execution token, owns the
//! installer-style run loop (controller server, optional local agent,
//! progress looper), and unwinds through the lifecycle supervisor when the
//! operation ends, fails, or is aborted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capstan_agent::{AgentRunner, PeerAgent, PeerConfig};
use capstan_core::{
    ClusterServer, ClusterState, CoreError, Event, EventSink, EventStatus, Operation,
    OperationKey, PlanStore, Result,
};
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::fsm::PhaseParams;
use crate::handler::RegistryHandler;
use crate::initializer::{init_operation_plan, DeployRequest, Initializer};
use crate::progress::ProgressLooper;
use crate::registry::WorkerRegistry;
use crate::server::{
    serve_unix, ControllerExecutor, ControllerServer, EventBroadcaster, ExecuteParams, OpFuture,
    SetPhaseParams,
};
use crate::supervisor::Supervisor;
use crate::updater::{Updater, UpdaterConfig};

/// Default bound for a single phase rollback.
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Controller configuration.
pub struct ControllerConfig {
    /// The operation to supervise.
    pub operation: Operation,
    /// Cluster snapshot the operation runs against.
    pub cluster: ClusterState,
    /// Cluster-wide plan store.
    pub store: Arc<dyn PlanStore>,
    /// Node-local store.
    pub local_store: Arc<dyn PlanStore>,
    /// Phase implementations.
    pub registry: Arc<WorkerRegistry>,
    /// Flavor initializer that built (or will build) the plan.
    pub initializer: Arc<dyn Initializer>,
    /// The cluster member this controller runs on; when set, a local peer
    /// agent is served so the node can receive dispatched phases.
    pub local_server: Option<ClusterServer>,
    /// Port peer agents listen on.
    pub agent_port: u16,
    /// Suppress user-facing output.
    pub silent: bool,
    /// Budget for the cooperative stop path.
    pub shutdown_timeout: Duration,
    /// UNIX socket the controller server listens on.
    pub socket_path: PathBuf,
}

/// The running controller.
pub struct Controller {
    config: ControllerConfig,
    events: Arc<EventBroadcaster>,
    supervisor: Arc<Supervisor>,
    runner: Arc<AgentRunner>,
    execute_gate: Arc<Semaphore>,
    /// Fires when the main operation finished successfully.
    done: CancellationToken,
    abort_requested: CancellationToken,
    shutdown_requested: CancellationToken,
}

impl Controller {
    /// Wire a controller. Mints the operation token and registers every
    /// cluster node as a dispatch peer.
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        let runner = Arc::new(AgentRunner::new(capstan_agent::mint_token()));
        let deploy = config.initializer.update_deploy_request(DeployRequest {
            servers: config.cluster.servers.clone(),
            leader: config.local_server.clone(),
            agent_port: config.agent_port,
        });
        for server in &deploy.servers {
            runner.add_peer(server, deploy.agent_port);
        }
        Arc::new(Self {
            supervisor: Arc::new(Supervisor::new(config.shutdown_timeout)),
            events: Arc::new(EventBroadcaster::new(256)),
            runner,
            execute_gate: Arc::new(Semaphore::new(1)),
            done: CancellationToken::new(),
            abort_requested: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            config,
        })
    }

    /// The progress broadcaster clients subscribe to.
    pub fn events(&self) -> Arc<EventBroadcaster> {
        self.events.clone()
    }

    /// The operation-scoped token peer agents must be started with.
    pub fn agent_token(&self) -> &str {
        self.runner.token()
    }

    /// The teardown supervisor.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Route `SIGINT`/`SIGTERM` into the abort path.
    pub fn watch_signals(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            tracing::info!("signal received, aborting operation");
            controller.request_abort();
        });
    }

    /// Run the controller until the operation finishes, the server dies,
    /// or the local agent fails; then unwind through the matching path.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let (agent_err_tx, mut agent_err_rx) = mpsc::channel::<CoreError>(1);
        self.start_local_agent(agent_err_tx);

        {
            let runner = self.runner.clone();
            self.supervisor.add_aborter("abort-agents", move || {
                let runner = runner.clone();
                async move { runner.abort_group().await }
            });
        }

        let looper = ProgressLooper::new(
            self.config.store.clone(),
            self.config.operation.key.clone(),
            self.events.clone(),
            Duration::from_secs(1),
        );
        tokio::spawn(looper.run(self.supervisor.cancel_token()));

        let server = ControllerServer::new(self.clone(), self.events.clone());
        let shutdown = {
            let abort = self.abort_requested.clone();
            let stop = self.shutdown_requested.clone();
            let done = self.done.clone();
            async move {
                tokio::select! {
                    _ = abort.cancelled() => {}
                    _ = stop.cancelled() => {}
                    _ = done.cancelled() => {}
                }
            }
        };

        let result = tokio::select! {
            served = serve_unix(&self.config.socket_path, server, shutdown) => served,
            Some(err) = agent_err_rx.recv() => {
                tracing::error!(error = %err, "local agent terminated");
                Err(err)
            }
        };

        let aborted = self.abort_requested.is_cancelled()
            || matches!(&result, Err(err) if err.is_aborted());
        if aborted {
            self.abort_path().await;
        } else {
            self.stop_path().await;
        }
        result
    }

    fn start_local_agent(&self, err_tx: mpsc::Sender<CoreError>) {
        let Some(local) = &self.config.local_server else {
            return;
        };
        let agent = Arc::new(PeerAgent::new(
            PeerConfig {
                listen_addr: (local.advertise_ip, self.config.agent_port).into(),
                token: self.runner.token().to_string(),
                hostname: local.hostname.clone(),
            },
            Arc::new(RegistryHandler::new(
                self.config.registry.clone(),
                self.config.store.clone(),
                self.config.local_store.clone(),
                self.config.operation.clone(),
                self.supervisor.cancel_token(),
            )),
        ));
        {
            let agent = agent.clone();
            self.supervisor.add_stopper("stop-local-agent", move || {
                agent.trigger_stop();
                async { Ok::<(), CoreError>(()) }
            });
        }
        {
            let agent = agent.clone();
            self.supervisor.add_aborter("abort-local-agent", move || {
                agent.trigger_abort();
                async { Ok::<(), CoreError>(()) }
            });
        }
        tokio::spawn(async move {
            if let Err(err) = agent.serve().await {
                let _ = err_tx.send(err.into()).await;
            }
        });
    }

    /// Cooperative teardown: cancel the internal context, run stoppers
    /// within the shutdown budget, stop the server.
    async fn stop_path(&self) {
        if let Err(err) = self.supervisor.stop().await {
            tracing::warn!(error = %err, "stop path reported errors");
        }
        self.shutdown_requested.cancel();
    }

    /// Forced teardown: cancel the internal context, run aborters, release
    /// the execution token, stop the server.
    async fn abort_path(&self) {
        if let Err(err) = self.supervisor.abort().await {
            tracing::warn!(error = %err, "abort path reported errors");
        }
        // Waiters on the execution token must not outlive the operation.
        self.execute_gate.close();
        self.events
            .send(Event::failed(&CoreError::Aborted));
        self.abort_requested.cancel();
    }

    fn new_updater(&self) -> Result<Updater> {
        self.config.initializer.new_updater(UpdaterConfig {
            operation: self.config.operation.clone(),
            store: self.config.store.clone(),
            local_store: self.config.local_store.clone(),
            registry: self.config.registry.clone(),
            runner: Some(self.runner.clone()),
            events: self.events.clone(),
            local_server: self.config.local_server.clone(),
            silent: self.config.silent,
        })
    }

    async fn execute_operation(&self, cancel: &CancellationToken) -> Result<()> {
        let key = &self.config.operation.key;
        match init_operation_plan(
            self.config.store.as_ref(),
            self.config.initializer.as_ref(),
            key,
            &self.config.cluster,
        ) {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err),
        }

        let updater = self.new_updater()?;
        updater.run(cancel).await?;

        {
            let runner = self.runner.clone();
            self.supervisor.add_stopper("stop-agents", move || {
                let runner = runner.clone();
                async move { runner.stop_group().await }
            });
        }
        let elapsed = Utc::now().signed_duration_since(self.config.operation.created);
        self.events.send(Event::terminal(
            EventStatus::Completed,
            Some(format!(
                "Operation {} succeeded in {}s",
                self.config.operation.flavor,
                elapsed.num_seconds().max(0)
            )),
        ));
        self.done.cancel();
        Ok(())
    }

    async fn execute_locked(&self, params: ExecuteParams) -> Result<()> {
        if self.abort_requested.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        // The execution token: one Execute at a time, waiters respect
        // cancellation, and a closed gate means the operation is gone.
        let _permit = tokio::select! {
            permit = self.execute_gate.clone().acquire_owned() => {
                permit.map_err(|_| CoreError::Aborted)?
            }
            _ = self.abort_requested.cancelled() => return Err(CoreError::Aborted),
        };
        let cancel = self.supervisor.cancel_token();

        let Some(phase) = params.phase else {
            return self.execute_operation(&cancel).await;
        };
        if phase.resume {
            return self.execute_operation(&cancel).await;
        }
        let Some(phase_id) = phase.id else {
            return self.execute_operation(&cancel).await;
        };
        let updater = self.new_updater()?;
        let phase_params = PhaseParams {
            phase_id,
            force: phase.force,
            dry_run: phase.dry_run,
        };
        if phase.rollback {
            updater
                .rollback_phase(&cancel, phase_params, DEFAULT_ROLLBACK_TIMEOUT)
                .await?;
        } else {
            updater.execute_phase(&cancel, phase_params).await?;
        }
        self.events
            .send(Event::terminal(EventStatus::Completed, None));
        Ok(())
    }
}

impl ControllerExecutor for Controller {
    fn execute(&self, params: ExecuteParams) -> OpFuture<'_> {
        Box::pin(self.execute_locked(params))
    }

    fn set_phase(&self, params: SetPhaseParams) -> OpFuture<'_> {
        Box::pin(async move {
            let updater = self.new_updater()?;
            updater.set_phase(&params.id, params.state).await
        })
    }

    fn complete(&self, key: OperationKey) -> OpFuture<'_> {
        Box::pin(async move {
            if key != self.config.operation.key {
                return Err(CoreError::NotFound {
                    what: format!("operation {key}"),
                });
            }
            let updater = self.new_updater()?;
            updater.complete(None).await?;
            if let Err(err) = updater.activate() {
                tracing::warn!(error = %err, "operation not activated");
            }
            // completed-pending: the server stays up until the client
            // acknowledges with Shutdown.
            self.events.send(Event::terminal(
                EventStatus::CompletedPending,
                Some("Operation marked complete".into()),
            ));
            Ok(())
        })
    }

    fn request_abort(&self) {
        tracing::info!("abort requested");
        // Cancel phase work and fail waiters up front: open Execute
        // streams must reach their terminal event before the server's
        // graceful shutdown can finish.
        self.supervisor.cancel_token().cancel();
        self.execute_gate.close();
        self.abort_requested.cancel();
    }

    fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        // The client's acknowledgement: end any stream still waiting
        // after completed-pending, then let the server exit.
        self.events
            .send(Event::terminal(EventStatus::Completed, None));
        self.shutdown_requested.cancel();
    }
}
