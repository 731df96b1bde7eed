//! Flavor-specific operation initializers.
//!
//! Each operation flavor (install, reconfigure, upgrade, …) supplies an
//! initializer that validates preconditions, creates the operation record,
//! and builds the initial plan. Validation and plan construction are pure
//! functions of the existing cluster state and the requested resource.

use capstan_core::{
    ClusterServer, ClusterState, CoreError, Operation, OperationFlavor, OperationKey,
    OperationPlan, PlanStore, Result, Revision,
};

use crate::updater::{Updater, UpdaterConfig};

/// Request describing how agents get deployed to cluster nodes.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Nodes receiving an agent.
    pub servers: Vec<ClusterServer>,
    /// Node leading the operation, if distinguished.
    pub leader: Option<ClusterServer>,
    /// Port agents listen on.
    pub agent_port: u16,
}

/// The contract an operation flavor implements.
pub trait Initializer: Send + Sync {
    /// The flavor this initializer produces.
    fn flavor(&self) -> OperationFlavor;

    /// Reject impossible configurations before anything is persisted.
    fn validate_preconditions(
        &self,
        store: &dyn PlanStore,
        cluster: &ClusterState,
    ) -> Result<()>;

    /// Create the operation record.
    fn new_operation(
        &self,
        store: &dyn PlanStore,
        cluster: &ClusterState,
    ) -> Result<OperationKey>;

    /// Build the initial plan for a freshly created operation.
    fn new_operation_plan(
        &self,
        operation: &Operation,
        cluster: &ClusterState,
    ) -> Result<OperationPlan>;

    /// Return a fully wired engine handle for the operation. Flavors
    /// needing extra wiring (caches, package services) override this.
    fn new_updater(&self, config: UpdaterConfig) -> Result<Updater> {
        Ok(Updater::new(config))
    }

    /// Hook to amend the agent-deployment request. The default is the
    /// identity; flavors with special deployment needs override it.
    fn update_deploy_request(&self, request: DeployRequest) -> DeployRequest {
        request
    }
}

/// Build and persist the initial plan if none exists yet.
///
/// Returns `AlreadyExists` when a plan is present; callers treat that as
/// success since a concurrent (or previous) creator won the race.
pub fn init_operation_plan(
    store: &dyn PlanStore,
    initializer: &dyn Initializer,
    key: &OperationKey,
    cluster: &ClusterState,
) -> Result<Revision> {
    match store.load_plan(key) {
        Ok(_) => Err(CoreError::AlreadyExists {
            what: format!("plan for operation {key}"),
        }),
        Err(err) if err.is_not_found() => {
            let operation = store.get_operation(key)?;
            let plan = initializer.new_operation_plan(&operation, cluster)?;
            tracing::info!(operation = %key, phases = plan.total, "persisting initial plan");
            store.save_plan(plan)
        }
        Err(err) => Err(err),
    }
}
