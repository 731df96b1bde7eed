//! Operation plans and the phase DAG.
//!
//! A plan is a rooted DAG of phases. Nesting (`a/b/c` paths) gives the tree
//! shape; `requires` edges between phases give the execution ordering on
//! top of it. Only leaf phases carry work; a parent's state is derived from
//! its children.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{ClusterServer, OperationKey};

/// A phase path such as `update-config/apply/node-1`.
///
/// Segments are slash-separated; nesting in the path mirrors nesting in the
/// plan tree. Ordering is lexicographic, which the engine uses to break
/// scheduling ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(String);

impl PhaseId {
    /// Create a phase id from a path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The raw path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a child segment.
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self(format!("{}/{}", self.0, segment.as_ref()))
    }

    /// The parent path, if this is not a root.
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('/').map(|(head, _)| Self(head.into()))
    }

    /// The final path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit_once('/').map_or(&self.0, |(_, tail)| tail)
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// State of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// Not yet started.
    Unstarted,
    /// Work (or rollback) is running.
    InProgress,
    /// Work finished successfully.
    Completed,
    /// Work returned an error.
    Failed,
    /// Rolled back after completion.
    RolledBack,
}

impl PhaseState {
    /// True once the phase finished successfully.
    pub fn is_completed(self) -> bool {
        self == PhaseState::Completed
    }

    /// True when the phase may be (re)started by the engine.
    pub fn is_startable(self) -> bool {
        matches!(self, PhaseState::Unstarted | PhaseState::Failed)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::Unstarted => "unstarted",
            PhaseState::InProgress => "in_progress",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
            PhaseState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// A named, re-entrant unit of work with declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase path.
    pub id: PhaseId,
    /// Selector picking the phase implementation in the worker registry.
    /// Empty for composite phases, which carry no work of their own.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub executor: String,
    /// Opaque payload passed to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Node the phase runs on; `None` runs on the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ClusterServer>,
    /// Phases that must reach `completed` before this one may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<PhaseId>,
    /// Current state.
    pub state: PhaseState,
    /// Last state-transition timestamp.
    pub updated: DateTime<Utc>,
    /// Last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Child phases.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
}

impl Phase {
    /// Create a leaf phase bound to an executor.
    pub fn leaf(id: PhaseId, executor: impl Into<String>) -> Self {
        Self {
            id,
            executor: executor.into(),
            data: None,
            server: None,
            requires: Vec::new(),
            state: PhaseState::Unstarted,
            updated: Utc::now(),
            error: None,
            phases: Vec::new(),
        }
    }

    /// Create a composite phase from its children.
    pub fn composite(id: PhaseId, phases: Vec<Phase>) -> Self {
        Self {
            id,
            executor: String::new(),
            data: None,
            server: None,
            requires: Vec::new(),
            state: PhaseState::Unstarted,
            updated: Utc::now(),
            error: None,
            phases,
        }
    }

    /// Attach an opaque payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Pin the phase to a node.
    pub fn on_server(mut self, server: ClusterServer) -> Self {
        self.server = Some(server);
        self
    }

    /// Declare dependencies.
    pub fn requiring(mut self, requires: Vec<PhaseId>) -> Self {
        self.requires = requires;
        self
    }

    /// True when the phase has no children and carries work.
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    /// Depth-first pre-order over this phase and its descendants.
    pub fn iter(&self) -> PhaseIter<'_> {
        PhaseIter { stack: vec![self] }
    }

    /// Derive a composite's state from its children: completed only when
    /// every child is, rolled back once every child is unwound.
    fn derived_state(&self) -> PhaseState {
        debug_assert!(!self.is_leaf());
        let states: Vec<PhaseState> = self.phases.iter().map(|p| p.state).collect();
        if states.iter().all(|s| *s == PhaseState::Unstarted) {
            PhaseState::Unstarted
        } else if states.iter().all(|s| s.is_completed()) {
            PhaseState::Completed
        } else if states
            .iter()
            .all(|s| matches!(s, PhaseState::RolledBack | PhaseState::Unstarted))
        {
            PhaseState::RolledBack
        } else if states.iter().any(|s| *s == PhaseState::Failed) {
            PhaseState::Failed
        } else {
            PhaseState::InProgress
        }
    }
}

/// Iterator over a phase subtree in depth-first pre-order.
pub struct PhaseIter<'a> {
    stack: Vec<&'a Phase>,
}

impl<'a> Iterator for PhaseIter<'a> {
    type Item = &'a Phase;

    fn next(&mut self) -> Option<Self::Item> {
        let phase = self.stack.pop()?;
        for child in phase.phases.iter().rev() {
            self.stack.push(child);
        }
        Some(phase)
    }
}

/// The DAG of phases realizing one operation.
///
/// Immutable once created except for per-phase state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPlan {
    /// Operation the plan belongs to.
    pub operation_key: OperationKey,
    /// Opaque cluster revision the plan was built against.
    pub cluster_revision: String,
    /// Root phases in document order.
    pub phases: Vec<Phase>,
    /// Number of leaf phases, used for completion percentages.
    pub total: usize,
}

impl OperationPlan {
    /// Build and validate a plan.
    pub fn new(
        operation_key: OperationKey,
        cluster_revision: impl Into<String>,
        phases: Vec<Phase>,
    ) -> Result<Self> {
        let mut plan = Self {
            operation_key,
            cluster_revision: cluster_revision.into(),
            phases,
            total: 0,
        };
        plan.total = plan.leaves().count();
        plan.validate()?;
        Ok(plan)
    }

    /// Depth-first pre-order over every phase in the plan.
    pub fn iter(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().flat_map(|p| p.iter())
    }

    /// Leaf phases in depth-first pre-order; the unit of execution.
    pub fn leaves(&self) -> impl Iterator<Item = &Phase> {
        self.iter().filter(|p| p.is_leaf())
    }

    /// Look up a phase by id.
    pub fn get(&self, id: &PhaseId) -> Option<&Phase> {
        self.iter().find(|p| &p.id == id)
    }

    /// Position of a phase in depth-first pre-order.
    pub fn dfs_index(&self, id: &PhaseId) -> Option<usize> {
        self.iter().position(|p| &p.id == id)
    }

    /// True once every leaf is completed.
    pub fn is_completed(&self) -> bool {
        self.leaves().all(|p| p.state.is_completed())
    }

    /// Leaves currently in the `failed` state.
    pub fn failed_phases(&self) -> Vec<&Phase> {
        self.leaves()
            .filter(|p| p.state == PhaseState::Failed)
            .collect()
    }

    /// Completion percentage over leaf phases.
    pub fn completion_percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = self.leaves().filter(|p| p.state.is_completed()).count();
        ((done * 100) / self.total) as u8
    }

    /// True when every dependency of `phase` (and of its ancestors) is
    /// satisfied. A dependency is satisfied when completed, or rolled back
    /// if `tolerate_rolled_back` accepts the dependent phase.
    pub fn requires_satisfied(
        &self,
        phase: &Phase,
        tolerate_rolled_back: &dyn Fn(&Phase) -> bool,
    ) -> bool {
        let mut ids = vec![phase.id.clone()];
        let mut cursor = phase.id.parent();
        while let Some(id) = cursor {
            cursor = id.parent();
            ids.push(id);
        }
        for id in ids {
            let Some(p) = self.get(&id) else { continue };
            for req in &p.requires {
                match self.get(req).map(|r| r.state) {
                    Some(PhaseState::Completed) => {}
                    Some(PhaseState::RolledBack) if tolerate_rolled_back(phase) => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// The frontier: startable leaves whose dependencies are satisfied, in
    /// depth-first pre-order with ties broken by lexicographic phase id.
    pub fn frontier_with(&self, tolerate_rolled_back: &dyn Fn(&Phase) -> bool) -> Vec<&Phase> {
        let mut eligible: Vec<(usize, &Phase)> = self
            .leaves()
            .enumerate()
            .filter(|(_, p)| {
                p.state.is_startable() && self.requires_satisfied(p, tolerate_rolled_back)
            })
            .collect();
        eligible.sort_by(|(ia, a), (ib, b)| ia.cmp(ib).then_with(|| a.id.cmp(&b.id)));
        eligible.into_iter().map(|(_, p)| p).collect()
    }

    /// The frontier under the default, strict dependency rule.
    pub fn frontier(&self) -> Vec<&Phase> {
        self.frontier_with(&|_| false)
    }

    /// Update a phase's state and re-derive every ancestor composite.
    pub fn update_phase(
        &mut self,
        id: &PhaseId,
        state: PhaseState,
        error: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        fn apply(
            phases: &mut [Phase],
            id: &PhaseId,
            state: PhaseState,
            error: &Option<String>,
            now: DateTime<Utc>,
        ) -> bool {
            for phase in phases {
                if &phase.id == id {
                    phase.state = state;
                    phase.error = error.clone();
                    phase.updated = now;
                    return true;
                }
                if apply(&mut phase.phases, id, state, error, now) {
                    phase.state = phase.derived_state();
                    phase.updated = now;
                    return true;
                }
            }
            false
        }
        if apply(&mut self.phases, id, state, &error, now) {
            Ok(())
        } else {
            Err(CoreError::NotFound {
                what: format!("phase {id}"),
            })
        }
    }

    /// Leaves of `root`'s subtree that are completed, in reverse
    /// depth-first pre-order; the order rollback walks them.
    pub fn rollback_order(&self, root: &PhaseId) -> Vec<&Phase> {
        let Some(root) = self.get(root) else {
            return Vec::new();
        };
        let mut leaves: Vec<&Phase> = root
            .iter()
            .filter(|p| p.is_leaf() && p.state.is_completed())
            .collect();
        leaves.reverse();
        leaves
    }

    /// Validate plan structure: unique ids, nesting consistent with paths,
    /// dependencies that exist, and an acyclic requires graph.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for phase in self.iter() {
            if !ids.insert(&phase.id) {
                return Err(CoreError::fatal(format!("duplicate phase id {}", phase.id)));
            }
            for child in &phase.phases {
                if child.id.parent().as_ref() != Some(&phase.id) {
                    return Err(CoreError::fatal(format!(
                        "phase {} nested under {} but its path disagrees",
                        child.id, phase.id
                    )));
                }
            }
            if phase.is_leaf() && phase.executor.is_empty() {
                return Err(CoreError::fatal(format!(
                    "leaf phase {} has no executor",
                    phase.id
                )));
            }
        }
        for phase in self.iter() {
            for req in &phase.requires {
                if !ids.contains(req) {
                    return Err(CoreError::fatal(format!(
                        "phase {} requires unknown phase {req}",
                        phase.id
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    /// Kahn's algorithm over the requires edges.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&PhaseId, usize> = HashMap::new();
        let mut dependents: HashMap<&PhaseId, Vec<&PhaseId>> = HashMap::new();
        for phase in self.iter() {
            in_degree.entry(&phase.id).or_insert(0);
            for req in &phase.requires {
                *in_degree.entry(&phase.id).or_insert(0) += 1;
                dependents.entry(req).or_default().push(&phase.id);
            }
        }
        let mut queue: VecDeque<&PhaseId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dep in dependents.get(id).into_iter().flatten() {
                let d = in_degree.get_mut(dep).expect("dependent was indexed");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep);
                }
            }
        }
        if visited != in_degree.len() {
            return Err(CoreError::fatal("requires graph contains a cycle"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_key() -> OperationKey {
        OperationKey::new("acme", "prod", "op-1")
    }

    /// validate -> apply/one -> apply/two -> restart, under one root.
    fn config_plan() -> OperationPlan {
        let root = PhaseId::new("update-config");
        let validate = Phase::leaf(root.child("validate"), "config/validate");
        let apply_one = Phase::leaf(root.child("apply").child("one"), "config/apply")
            .requiring(vec![validate.id.clone()]);
        let apply_two = Phase::leaf(root.child("apply").child("two"), "config/apply")
            .requiring(vec![apply_one.id.clone()]);
        let restart = Phase::leaf(root.child("restart"), "config/restart")
            .requiring(vec![apply_one.id.clone(), apply_two.id.clone()]);
        let apply = Phase::composite(
            root.child("apply"),
            vec![apply_one, apply_two],
        );
        let plan = Phase::composite(root, vec![validate, apply, restart]);
        OperationPlan::new(plan_key(), "rev-1", vec![plan]).unwrap()
    }

    #[test]
    fn phase_id_paths() {
        let id = PhaseId::new("update-config").child("apply").child("node-1");
        assert_eq!(id.as_str(), "update-config/apply/node-1");
        assert_eq!(id.name(), "node-1");
        assert_eq!(id.parent().unwrap().as_str(), "update-config/apply");
        assert_eq!(PhaseId::new("root").parent(), None);
    }

    #[test]
    fn frontier_respects_requires() {
        let plan = config_plan();
        let frontier = plan.frontier();
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].id.as_str(), "update-config/validate");
    }

    #[test]
    fn frontier_advances_as_phases_complete() {
        let mut plan = config_plan();
        plan.update_phase(&"update-config/validate".into(), PhaseState::Completed, None)
            .unwrap();
        let frontier = plan.frontier();
        assert_eq!(frontier[0].id.as_str(), "update-config/apply/one");

        plan.update_phase(
            &"update-config/apply/one".into(),
            PhaseState::Completed,
            None,
        )
        .unwrap();
        // restart still blocked on apply/two
        let ids: Vec<&str> = plan.frontier().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["update-config/apply/two"]);
    }

    #[test]
    fn parent_state_derivation() {
        let mut plan = config_plan();
        plan.update_phase(
            &"update-config/apply/one".into(),
            PhaseState::Completed,
            None,
        )
        .unwrap();
        let apply = plan.get(&"update-config/apply".into()).unwrap();
        assert_eq!(apply.state, PhaseState::InProgress);

        plan.update_phase(
            &"update-config/apply/two".into(),
            PhaseState::Completed,
            None,
        )
        .unwrap();
        let apply = plan.get(&"update-config/apply".into()).unwrap();
        assert_eq!(apply.state, PhaseState::Completed);
    }

    #[test]
    fn parent_rolls_back_with_children() {
        let mut plan = config_plan();
        for id in ["update-config/apply/one", "update-config/apply/two"] {
            plan.update_phase(&id.into(), PhaseState::Completed, None)
                .unwrap();
            plan.update_phase(&id.into(), PhaseState::RolledBack, None)
                .unwrap();
        }
        let apply = plan.get(&"update-config/apply".into()).unwrap();
        assert_eq!(apply.state, PhaseState::RolledBack);
    }

    #[test]
    fn rollback_order_is_reverse_completion() {
        let mut plan = config_plan();
        for id in [
            "update-config/validate",
            "update-config/apply/one",
            "update-config/apply/two",
        ] {
            plan.update_phase(&id.into(), PhaseState::Completed, None)
                .unwrap();
        }
        let order: Vec<&str> = plan
            .rollback_order(&"update-config".into())
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                "update-config/apply/two",
                "update-config/apply/one",
                "update-config/validate",
            ]
        );
    }

    #[test]
    fn unknown_requirement_rejected() {
        let root = PhaseId::new("root");
        let phase =
            Phase::leaf(root.child("a"), "noop").requiring(vec![PhaseId::new("root/missing")]);
        let err =
            OperationPlan::new(plan_key(), "rev", vec![Phase::composite(root, vec![phase])])
                .unwrap_err();
        assert!(err.to_string().contains("unknown phase"));
    }

    #[test]
    fn dependency_cycle_rejected() {
        let root = PhaseId::new("root");
        let a = Phase::leaf(root.child("a"), "noop").requiring(vec![root.child("b")]);
        let b = Phase::leaf(root.child("b"), "noop").requiring(vec![root.child("a")]);
        let err =
            OperationPlan::new(plan_key(), "rev", vec![Phase::composite(root, vec![a, b])])
                .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn mismatched_nesting_rejected() {
        let root = PhaseId::new("root");
        let stray = Phase::leaf(PhaseId::new("elsewhere/a"), "noop");
        let err =
            OperationPlan::new(plan_key(), "rev", vec![Phase::composite(root, vec![stray])])
                .unwrap_err();
        assert!(err.to_string().contains("path disagrees"));
    }

    #[test]
    fn empty_plan_is_complete() {
        let plan = OperationPlan::new(plan_key(), "rev", Vec::new()).unwrap();
        assert!(plan.is_completed());
        assert!(plan.frontier().is_empty());
        assert_eq!(plan.completion_percent(), 100);
    }
}
