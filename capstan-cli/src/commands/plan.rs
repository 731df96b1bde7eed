//! `capstan plan` - operate on the active operation through the
//! controller socket.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};

use capstan_core::{EventStatus, PhaseState};
use capstan_engine::proto::{CompleteRequest, Empty, SetPhaseRequest};
use capstan_engine::{ExecuteParams, PhaseRef, SetPhaseParams};

use crate::client;

#[derive(Args)]
pub struct SocketOpts {
    /// Controller socket path
    #[arg(long, default_value_os_t = super::default_socket())]
    socket: PathBuf,
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Execute the whole plan, or a single phase with --phase
    Execute {
        #[command(flatten)]
        socket: SocketOpts,

        /// Phase to execute; omit to run the whole plan
        #[arg(long)]
        phase: Option<String>,

        /// Continue from the last incomplete phase
        #[arg(long)]
        resume: bool,

        /// Bypass ordering and state checks
        #[arg(long)]
        force: bool,

        /// Log the intended action without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back a phase
    Rollback {
        #[command(flatten)]
        socket: SocketOpts,

        /// Phase to roll back
        #[arg(long)]
        phase: String,

        /// Bypass ordering checks
        #[arg(long)]
        force: bool,

        /// Log the intended action without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Administratively override a phase's state
    SetPhase {
        #[command(flatten)]
        socket: SocketOpts,

        /// Phase to override
        #[arg(long)]
        phase: String,

        /// State to write (unstarted, in_progress, completed, failed,
        /// rolled_back)
        #[arg(long)]
        state: String,
    },

    /// Manually complete the operation
    Complete {
        #[command(flatten)]
        socket: SocketOpts,

        /// Operation key as account/cluster/operation-id
        #[arg(long)]
        operation: String,
    },

    /// Abort the operation
    Abort {
        #[command(flatten)]
        socket: SocketOpts,
    },

    /// Shut the controller down
    Shutdown {
        #[command(flatten)]
        socket: SocketOpts,
    },
}

fn parse_state(raw: &str) -> Result<PhaseState> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| anyhow::anyhow!("unknown phase state {raw:?}"))
}

pub async fn run(cmd: PlanCommands) -> Result<()> {
    match cmd {
        PlanCommands::Execute {
            socket,
            phase,
            resume,
            force,
            dry_run,
        } => {
            let mut client = client::connect(&socket.socket).await?;
            let params = ExecuteParams {
                phase: phase
                    .map(|id| PhaseRef {
                        id: Some(id.as_str().into()),
                        force,
                        dry_run,
                        resume,
                        ..Default::default()
                    })
                    .or_else(|| {
                        resume.then(|| PhaseRef {
                            resume: true,
                            ..Default::default()
                        })
                    }),
            };
            let status = client::execute_and_stream(&mut client, params).await?;
            if !matches!(status, EventStatus::Completed | EventStatus::CompletedPending) {
                bail!("execution finished with status {status:?}");
            }
            Ok(())
        }
        PlanCommands::Rollback {
            socket,
            phase,
            force,
            dry_run,
        } => {
            let mut client = client::connect(&socket.socket).await?;
            let params = ExecuteParams {
                phase: Some(PhaseRef {
                    id: Some(phase.as_str().into()),
                    rollback: true,
                    force,
                    dry_run,
                    ..Default::default()
                }),
            };
            let status = client::execute_and_stream(&mut client, params).await?;
            if status != EventStatus::Completed {
                bail!("rollback finished with status {status:?}");
            }
            Ok(())
        }
        PlanCommands::SetPhase {
            socket,
            phase,
            state,
        } => {
            let mut client = client::connect(&socket.socket).await?;
            let params = SetPhaseParams {
                id: phase.as_str().into(),
                state: parse_state(&state)?,
            };
            let data = serde_json::to_vec(&params)?;
            client.set_phase(SetPhaseRequest { data }).await?;
            println!("phase {phase} set to {state}");
            Ok(())
        }
        PlanCommands::Complete { socket, operation } => {
            let mut client = client::connect(&socket.socket).await?;
            let key = super::plan_key(&operation)?;
            let data = serde_json::to_vec(&key)?;
            client.complete(CompleteRequest { data }).await?;
            println!("operation {operation} marked complete");
            Ok(())
        }
        PlanCommands::Abort { socket } => {
            let mut client = client::connect(&socket.socket).await?;
            client.abort(Empty {}).await?;
            println!("abort requested");
            Ok(())
        }
        PlanCommands::Shutdown { socket } => {
            let mut client = client::connect(&socket.socket).await?;
            client.shutdown(Empty {}).await?;
            println!("shutdown requested");
            Ok(())
        }
    }
}
