//! The capstan operation engine.
//!
//! Drives a persisted plan of phases across a fleet of per-node agents:
//! the [`fsm::Fsm`] traverses the plan DAG with resume, rollback, force,
//! and dry-run semantics; the [`controller::Controller`] serializes client
//! requests arriving over a local socket and supervises teardown; flavor
//! [`initializer::Initializer`]s validate preconditions and build plans.

pub mod config;
pub mod context;
pub mod controller;
pub mod executor;
pub mod fsm;
pub mod handler;
pub mod initializer;
pub mod progress;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod updater;

/// Generated wire types for the controller service.
pub mod proto {
    tonic::include_proto!("capstan.controller");
}

pub use config::ConfigInitializer;
pub use context::{PhaseContext, PlanReader};
pub use controller::{Controller, ControllerConfig, DEFAULT_ROLLBACK_TIMEOUT};
pub use executor::{ExecutorConfig, PhaseExecutor};
pub use fsm::{Fsm, FsmConfig, PhaseParams};
pub use initializer::{init_operation_plan, DeployRequest, Initializer};
pub use registry::{PhaseWorker, WorkerFuture, WorkerRegistry};
pub use server::{
    ControllerExecutor, ControllerServer, EventBroadcaster, ExecuteParams, PhaseRef,
    SetPhaseParams,
};
pub use supervisor::Supervisor;
pub use updater::{Updater, UpdaterConfig};
