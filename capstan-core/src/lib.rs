//! Core data model for the capstan operation controller.
//!
//! An *operation* is a persisted, resumable cluster-lifecycle change; its
//! *plan* is a rooted DAG of *phases* driven to completion by the engine in
//! `capstan-engine`. This crate holds the shared vocabulary: operation and
//! plan types, the plan-store contract with revision compare-and-swap, the
//! changelog, progress events, and the error taxonomy.

pub mod error;
pub mod plan;
pub mod progress;
pub mod store;
pub mod types;

pub use error::{CoreError, Result};
pub use plan::{OperationPlan, Phase, PhaseId, PhaseState};
pub use progress::{BufferedSink, DiscardSink, EventSink};
pub use store::{MemoryStore, PhaseChange, PlanStore, Revision, VersionedPlan};
pub use types::{
    ClusterConfig, ClusterServer, ClusterState, Event, EventStatus, Operation, OperationFlavor,
    OperationKey, OperationState, ProgressEntry, ServerRole,
};
