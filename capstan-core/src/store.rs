//! The plan store: persisted operations, plans, and the changelog.
//!
//! The backend is modeled as an opaque key-value store with atomic
//! compare-and-swap on plan revisions. Every phase-state transition goes
//! through [`PlanStore::update_phase`], which appends the matching
//! changelog entry in the same step; the changelog is the audit trail a
//! crashed controller replays from.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::plan::{OperationPlan, PhaseId, PhaseState};
use crate::types::{Operation, OperationKey, OperationState};

/// Monotonic plan revision; one per persisted transition.
pub type Revision = u64;

/// A plan together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct VersionedPlan {
    /// The plan with every phase's latest state.
    pub plan: OperationPlan,
    /// Revision of the snapshot.
    pub revision: Revision,
}

/// A single phase-state transition to persist.
#[derive(Debug, Clone)]
pub struct PhaseChange {
    /// Phase to transition.
    pub phase_id: PhaseId,
    /// Target state.
    pub new_state: PhaseState,
    /// Failure that produced the transition, if any.
    pub error: Option<String>,
    /// Revision the caller's plan snapshot was read at.
    pub expected_revision: Revision,
    /// True for administrative overrides (`SetPhase`) and forced runs.
    pub forced: bool,
}

/// Append-only audit record of one plan transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Revision this entry created.
    pub revision: Revision,
    /// Operation the entry belongs to.
    pub operation_key: OperationKey,
    /// Phase the transition applied to; `None` for operation-level notes.
    pub phase_id: Option<PhaseId>,
    /// New phase state; `None` for notes.
    pub new_state: Option<PhaseState>,
    /// Failure attached to the transition.
    pub error: Option<String>,
    /// True when the transition bypassed ordering checks.
    pub forced: bool,
    /// Free-form annotation (dry-run markers, manual completion).
    pub note: Option<String>,
    /// Entry timestamp.
    pub created: DateTime<Utc>,
}

/// Storage contract the engine drives plans through.
///
/// `update_phase` is atomic against concurrent writers: it fails with
/// [`CoreError::StaleRevision`] when the caller's revision is behind.
/// Plans are retained after completion for audit; there is no delete.
pub trait PlanStore: Send + Sync {
    /// Persist a new operation record.
    fn create_operation(&self, operation: Operation) -> Result<()>;

    /// Fetch an operation record.
    fn get_operation(&self, key: &OperationKey) -> Result<Operation>;

    /// Transition an operation record's state.
    fn update_operation_state(&self, key: &OperationKey, state: OperationState) -> Result<()>;

    /// Persist the initial plan. Fails with `AlreadyExists` when a plan is
    /// already present for the operation.
    fn save_plan(&self, plan: OperationPlan) -> Result<Revision>;

    /// Load the plan with every phase's latest state.
    fn load_plan(&self, key: &OperationKey) -> Result<VersionedPlan>;

    /// Atomically apply one phase transition and append its changelog
    /// entry. Returns the new revision.
    fn update_phase(&self, key: &OperationKey, change: PhaseChange) -> Result<Revision>;

    /// Append an operation-level note to the changelog.
    fn append_note(&self, key: &OperationKey, note: String) -> Result<Revision>;

    /// The changelog in revision order.
    fn changelog(&self, key: &OperationKey) -> Result<Vec<ChangelogEntry>>;
}

#[derive(Debug)]
struct StoredOperation {
    operation: Operation,
    plan: Option<OperationPlan>,
    revision: Revision,
    changelog: Vec<ChangelogEntry>,
}

/// In-memory [`PlanStore`].
///
/// The reference backend for tests and single-process runs; durable
/// backends implement the same contract over their own storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    operations: RwLock<HashMap<OperationKey, StoredOperation>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanStore for MemoryStore {
    fn create_operation(&self, operation: Operation) -> Result<()> {
        let mut ops = self.operations.write();
        if ops.contains_key(&operation.key) {
            return Err(CoreError::AlreadyExists {
                what: format!("operation {}", operation.key),
            });
        }
        ops.insert(
            operation.key.clone(),
            StoredOperation {
                operation,
                plan: None,
                revision: 0,
                changelog: Vec::new(),
            },
        );
        Ok(())
    }

    fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.operations
            .read()
            .get(key)
            .map(|s| s.operation.clone())
            .ok_or_else(|| CoreError::NotFound {
                what: format!("operation {key}"),
            })
    }

    fn update_operation_state(&self, key: &OperationKey, state: OperationState) -> Result<()> {
        let mut ops = self.operations.write();
        let stored = ops.get_mut(key).ok_or_else(|| CoreError::NotFound {
            what: format!("operation {key}"),
        })?;
        stored.operation.state = state;
        Ok(())
    }

    fn save_plan(&self, plan: OperationPlan) -> Result<Revision> {
        let mut ops = self.operations.write();
        let stored = ops
            .get_mut(&plan.operation_key)
            .ok_or_else(|| CoreError::NotFound {
                what: format!("operation {}", plan.operation_key),
            })?;
        if stored.plan.is_some() {
            return Err(CoreError::AlreadyExists {
                what: format!("plan for operation {}", plan.operation_key),
            });
        }
        stored.plan = Some(plan);
        stored.revision += 1;
        Ok(stored.revision)
    }

    fn load_plan(&self, key: &OperationKey) -> Result<VersionedPlan> {
        let ops = self.operations.read();
        let stored = ops.get(key).ok_or_else(|| CoreError::NotFound {
            what: format!("operation {key}"),
        })?;
        let plan = stored.plan.as_ref().ok_or_else(|| CoreError::NotFound {
            what: format!("plan for operation {key}"),
        })?;
        Ok(VersionedPlan {
            plan: plan.clone(),
            revision: stored.revision,
        })
    }

    fn update_phase(&self, key: &OperationKey, change: PhaseChange) -> Result<Revision> {
        let mut ops = self.operations.write();
        let stored = ops.get_mut(key).ok_or_else(|| CoreError::NotFound {
            what: format!("operation {key}"),
        })?;
        if stored.revision != change.expected_revision {
            return Err(CoreError::StaleRevision {
                have: change.expected_revision,
                actual: stored.revision,
            });
        }
        let plan = stored.plan.as_mut().ok_or_else(|| CoreError::NotFound {
            what: format!("plan for operation {key}"),
        })?;
        plan.update_phase(&change.phase_id, change.new_state, change.error.clone())?;
        stored.revision += 1;
        stored.changelog.push(ChangelogEntry {
            revision: stored.revision,
            operation_key: key.clone(),
            phase_id: Some(change.phase_id),
            new_state: Some(change.new_state),
            error: change.error,
            forced: change.forced,
            note: None,
            created: Utc::now(),
        });
        Ok(stored.revision)
    }

    fn append_note(&self, key: &OperationKey, note: String) -> Result<Revision> {
        let mut ops = self.operations.write();
        let stored = ops.get_mut(key).ok_or_else(|| CoreError::NotFound {
            what: format!("operation {key}"),
        })?;
        stored.revision += 1;
        stored.changelog.push(ChangelogEntry {
            revision: stored.revision,
            operation_key: key.clone(),
            phase_id: None,
            new_state: None,
            error: None,
            forced: false,
            note: Some(note),
            created: Utc::now(),
        });
        Ok(stored.revision)
    }

    fn changelog(&self, key: &OperationKey) -> Result<Vec<ChangelogEntry>> {
        let ops = self.operations.read();
        let stored = ops.get(key).ok_or_else(|| CoreError::NotFound {
            what: format!("operation {key}"),
        })?;
        Ok(stored.changelog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Phase;
    use crate::types::OperationFlavor;

    fn seeded_store() -> (MemoryStore, OperationKey) {
        let key = OperationKey::new("acme", "prod", "op-1");
        let store = MemoryStore::new();
        store
            .create_operation(Operation::new(key.clone(), OperationFlavor::Reconfigure))
            .unwrap();
        let root = PhaseId::new("update-config");
        let plan = OperationPlan::new(
            key.clone(),
            "rev-1",
            vec![Phase::composite(
                root.clone(),
                vec![Phase::leaf(root.child("validate"), "config/validate")],
            )],
        )
        .unwrap();
        store.save_plan(plan).unwrap();
        (store, key)
    }

    #[test]
    fn save_load_round_trip() {
        let (store, key) = seeded_store();
        let loaded = store.load_plan(&key).unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.plan.total, 1);
        assert_eq!(
            loaded.plan.phases[0].phases[0].id.as_str(),
            "update-config/validate"
        );
    }

    #[test]
    fn duplicate_plan_rejected() {
        let (store, key) = seeded_store();
        let plan = store.load_plan(&key).unwrap().plan;
        assert!(store.save_plan(plan).unwrap_err().is_already_exists());
    }

    #[test]
    fn update_phase_bumps_revision_and_logs() {
        let (store, key) = seeded_store();
        let rev = store
            .update_phase(
                &key,
                PhaseChange {
                    phase_id: "update-config/validate".into(),
                    new_state: PhaseState::Completed,
                    error: None,
                    expected_revision: 1,
                    forced: false,
                },
            )
            .unwrap();
        assert_eq!(rev, 2);

        let loaded = store.load_plan(&key).unwrap();
        assert!(loaded.plan.is_completed());

        let log = store.changelog(&key).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].revision, 2);
        assert_eq!(log[0].new_state, Some(PhaseState::Completed));
    }

    #[test]
    fn stale_revision_rejected() {
        let (store, key) = seeded_store();
        let change = PhaseChange {
            phase_id: "update-config/validate".into(),
            new_state: PhaseState::InProgress,
            error: None,
            expected_revision: 0,
            forced: false,
        };
        let err = store.update_phase(&key, change).unwrap_err();
        assert!(matches!(
            err,
            CoreError::StaleRevision { have: 0, actual: 1 }
        ));
    }

    #[test]
    fn changelog_revisions_are_monotonic() {
        let (store, key) = seeded_store();
        store.append_note(&key, "created in manual mode".into()).unwrap();
        store
            .update_phase(
                &key,
                PhaseChange {
                    phase_id: "update-config/validate".into(),
                    new_state: PhaseState::InProgress,
                    error: None,
                    expected_revision: 2,
                    forced: false,
                },
            )
            .unwrap();
        let log = store.changelog(&key).unwrap();
        let revisions: Vec<Revision> = log.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![2, 3]);
    }
}
