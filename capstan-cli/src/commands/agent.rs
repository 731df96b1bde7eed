//! `capstan agent` - run a peer agent on a cluster node.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use capstan_agent::{PeerAgent, PeerConfig};
use capstan_core::{MemoryStore, Operation, OperationFlavor};
use capstan_engine::{config, handler::RegistryHandler, WorkerRegistry};

#[derive(Args)]
pub struct AgentOpts {
    /// Address to listen on
    #[arg(long)]
    listen: SocketAddr,

    /// Operation-scoped bearer token minted by the controller
    #[arg(long)]
    token: String,

    /// Operation key as account/cluster/operation-id
    #[arg(long)]
    operation: String,

    /// This node's hostname
    #[arg(long)]
    hostname: String,
}

pub async fn run(opts: AgentOpts) -> Result<()> {
    let key = super::plan_key(&opts.operation)?;
    let operation = Operation::new(key, OperationFlavor::Reconfigure);

    let mut registry = WorkerRegistry::new();
    config::register_workers(&mut registry);

    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let handler = RegistryHandler::new(
        Arc::new(registry),
        store.clone(),
        store,
        operation,
        cancel,
    );

    let agent = PeerAgent::new(
        PeerConfig {
            listen_addr: opts.listen,
            token: opts.token,
            hostname: opts.hostname,
        },
        Arc::new(handler),
    );
    tracing::info!(listen = %opts.listen, "starting peer agent");
    agent
        .serve()
        .await
        .with_context(|| format!("serving agent on {}", opts.listen))
}
