//! `capstan config` - cluster-configuration operations.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use capstan_core::{ClusterConfig, ClusterState, EventStatus, MemoryStore, PlanStore};
use capstan_engine::proto::Empty;
use capstan_engine::{
    config, init_operation_plan, ConfigInitializer, Controller, ControllerConfig, ExecuteParams,
    Initializer, WorkerRegistry,
};

use crate::client;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Update the cluster configuration
    Update(UpdateOpts),

    /// Reset the cluster configuration to defaults
    Reset(UpdateOpts),
}

#[derive(Args)]
pub struct UpdateOpts {
    /// Path to the requested configuration document (JSON). Ignored by
    /// reset.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to the cluster-state document (JSON)
    #[arg(short, long)]
    cluster_state: PathBuf,

    /// Create the operation and exit without executing it
    #[arg(long)]
    manual: bool,

    /// Advertise IP of the node running this command, if it is a cluster
    /// member
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Controller socket path
    #[arg(long, default_value_os_t = super::default_socket())]
    socket: PathBuf,

    /// Port peer agents listen on
    #[arg(long, default_value_t = capstan_agent::DEFAULT_AGENT_PORT)]
    agent_port: u16,
}

pub async fn run(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Update(opts) => {
            let file = opts.file.clone().context("--file is required for update")?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let config: ClusterConfig = serde_json::from_str(&raw)?;
            update(opts, ConfigInitializer::new(config)).await
        }
        ConfigCommands::Reset(opts) => update(opts, ConfigInitializer::reset()).await,
    }
}

async fn update(opts: UpdateOpts, initializer: ConfigInitializer) -> Result<()> {
    let raw = std::fs::read_to_string(&opts.cluster_state)
        .with_context(|| format!("reading {}", opts.cluster_state.display()))?;
    let cluster: ClusterState = serde_json::from_str(&raw)?;

    let store = Arc::new(MemoryStore::new());
    initializer.validate_preconditions(store.as_ref(), &cluster)?;

    let key = initializer.new_operation(store.as_ref(), &cluster)?;
    let operation = store.get_operation(&key)?;
    init_operation_plan(store.as_ref(), &initializer, &key, &cluster)?;
    tracing::info!(operation = %key, "created reconfigure operation");

    if opts.manual {
        println!("The operation has been created in manual mode.");
        println!("Advance it phase by phase with 'capstan plan execute --phase <id>'.");
        return Ok(());
    }

    let mut registry = WorkerRegistry::new();
    config::register_workers(&mut registry);

    let local_server = opts
        .advertise_ip
        .and_then(|ip| cluster.find_server(ip).cloned());
    let cluster_has_remote_nodes = cluster
        .servers
        .iter()
        .any(|s| local_server.as_ref().map(|l| l.advertise_ip) != Some(s.advertise_ip));

    let controller = Controller::new(ControllerConfig {
        operation,
        cluster,
        store: store.clone(),
        local_store: store,
        registry: Arc::new(registry),
        initializer: Arc::new(initializer),
        local_server,
        agent_port: opts.agent_port,
        silent: false,
        shutdown_timeout: Duration::from_secs(30),
        socket_path: opts.socket.clone(),
    });
    controller.watch_signals();
    if cluster_has_remote_nodes {
        println!(
            "Start agents on the remaining nodes with: capstan agent \
             --listen <ip>:{} --token {} --operation {} --hostname <name>",
            opts.agent_port,
            controller.agent_token(),
            key,
        );
    }

    let serving = controller.clone();
    let run = tokio::spawn(async move { serving.run().await });

    client::wait_for_socket(&opts.socket, Duration::from_secs(5)).await?;
    let mut client = client::connect(&opts.socket).await?;
    let status = client::execute_and_stream(&mut client, ExecuteParams::default()).await?;
    let _ = client.shutdown(Empty {}).await;
    let _ = run.await;

    match status {
        EventStatus::Completed | EventStatus::CompletedPending => Ok(()),
        EventStatus::Aborted => bail!("operation aborted"),
        _ => bail!("operation failed"),
    }
}
