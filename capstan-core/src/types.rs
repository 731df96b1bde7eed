//! Operation, cluster, and progress-event types.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an operation: `(account, cluster, operation-id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    /// Owning account.
    pub account_id: String,
    /// Cluster the operation mutates.
    pub cluster_name: String,
    /// Unique operation identifier.
    pub operation_id: String,
}

impl OperationKey {
    /// Create a new operation key.
    pub fn new(
        account_id: impl Into<String>,
        cluster_name: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            cluster_name: cluster_name.into(),
            operation_id: operation_id.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_id, self.cluster_name, self.operation_id
        )
    }
}

/// The kind of lifecycle change an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationFlavor {
    /// Initial cluster installation.
    Install,
    /// Cluster-configuration update.
    Reconfigure,
    /// Runtime upgrade.
    Upgrade,
    /// Remove nodes.
    Shrink,
    /// Add nodes.
    Expand,
}

impl fmt::Display for OperationFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationFlavor::Install => "install",
            OperationFlavor::Reconfigure => "reconfigure",
            OperationFlavor::Upgrade => "upgrade",
            OperationFlavor::Shrink => "shrink",
            OperationFlavor::Expand => "expand",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Created, no phase has run.
    Initialized,
    /// At least one phase has started.
    InProgress,
    /// Plan driven to completion.
    Completed,
    /// Terminal failure.
    Failed,
    /// Cancelled by client or signal.
    Aborted,
}

impl OperationState {
    /// True for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Aborted
        )
    }
}

/// A persisted, resumable cluster-lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identity.
    pub key: OperationKey,
    /// What kind of change this is.
    pub flavor: OperationFlavor,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Current state.
    pub state: OperationState,
}

impl Operation {
    /// Create a new operation in the `Initialized` state.
    pub fn new(key: OperationKey, flavor: OperationFlavor) -> Self {
        Self {
            key,
            flavor,
            created: Utc::now(),
            state: OperationState::Initialized,
        }
    }
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Control-plane node.
    Master,
    /// Worker node.
    Node,
}

/// A cluster node. Membership is fixed for the operation's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterServer {
    /// The node's advertised address; its identity.
    pub advertise_ip: IpAddr,
    /// Hostname, used in phase paths.
    pub hostname: String,
    /// Cluster role.
    pub role: ServerRole,
    /// Profile selector picking the agent deployment profile.
    pub profile: String,
}

impl ClusterServer {
    /// True for control-plane nodes.
    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }
}

impl fmt::Display for ClusterServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hostname, self.advertise_ip)
    }
}

/// The cluster-wide configuration document an operation reads or replaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Service network CIDR, empty to keep the current value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,
    /// Pod network CIDR, empty to keep the current value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_cidr: String,
    /// Remaining configuration, treated opaquely by the controller.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl ClusterConfig {
    /// An empty document; used to reset configuration to defaults.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Snapshot of the cluster an initializer validates against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    /// Owning account.
    pub account_id: String,
    /// Cluster name.
    pub name: String,
    /// Fixed node membership.
    pub servers: Vec<ClusterServer>,
    /// Currently active configuration.
    pub config: ClusterConfig,
    /// Opaque cluster revision the plan is built against.
    pub revision: String,
}

impl ClusterState {
    /// Masters in membership order.
    pub fn masters(&self) -> impl Iterator<Item = &ClusterServer> {
        self.servers.iter().filter(|s| s.is_master())
    }

    /// Find the member advertising `ip`.
    pub fn find_server(&self, ip: IpAddr) -> Option<&ClusterServer> {
        self.servers.iter().find(|s| s.advertise_ip == ip)
    }
}

/// A single progress report for an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Phase the entry refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Completion percentage, 0..=100.
    pub completion: u8,
}

impl ProgressEntry {
    /// A plain message with no phase attribution.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            phase_id: None,
            message: message.into(),
            completion: 0,
        }
    }

    /// A message attributed to a phase with a completion percentage.
    pub fn for_phase(
        phase_id: impl Into<String>,
        completion: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase_id: Some(phase_id.into()),
            message: message.into(),
            completion: completion.min(100),
        }
    }
}

/// Delivery status attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Plain progress, operation still running.
    Running,
    /// Operation done but the server stays up until the client acks.
    CompletedPending,
    /// Operation done; the server may exit once delivered.
    Completed,
    /// Operation failed terminally.
    Failed,
    /// Operation aborted.
    Aborted,
}

impl EventStatus {
    /// True when the event ends the stream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Aborted
        )
    }
}

/// Error payload on the event wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    /// Stable error kind tag, see [`crate::error::CoreError::kind`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// An entry in the per-operation event stream, ordered FIFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Optional progress payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEntry>,
    /// Delivery status.
    pub status: EventStatus,
    /// Error payload for failed/aborted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

impl Event {
    /// A running-progress event.
    pub fn progress(entry: ProgressEntry) -> Self {
        Self {
            progress: Some(entry),
            status: EventStatus::Running,
            error: None,
        }
    }

    /// A terminal event for `status` with an optional message.
    pub fn terminal(status: EventStatus, message: Option<String>) -> Self {
        Self {
            progress: message.map(|m| ProgressEntry {
                phase_id: None,
                message: m,
                completion: 100,
            }),
            status,
            error: None,
        }
    }

    /// A terminal failure event carrying the error's wire kind.
    pub fn failed(err: &crate::error::CoreError) -> Self {
        let status = if err.is_aborted() {
            EventStatus::Aborted
        } else {
            EventStatus::Failed
        };
        Self {
            progress: None,
            status,
            error: Some(EventError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_key_display() {
        let key = OperationKey::new("acme", "prod", "op-1");
        assert_eq!(key.to_string(), "acme/prod/op-1");
    }

    #[test]
    fn failed_event_carries_wire_kind() {
        let err = crate::error::CoreError::PreconditionFailed {
            reason: "cidr overlap".into(),
        };
        let event = Event::failed(&err);
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error.unwrap().kind, "precondition-failed");
    }

    #[test]
    fn aborted_event_status() {
        let event = Event::failed(&crate::error::CoreError::Aborted);
        assert_eq!(event.status, EventStatus::Aborted);
    }

    #[test]
    fn progress_completion_clamped() {
        let entry = ProgressEntry::for_phase("update-config/validate", 150, "done");
        assert_eq!(entry.completion, 100);
    }
}
