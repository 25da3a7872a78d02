//! Condition aggregation
//!
//! Conditions are the sole user-facing convergence signal. Computing them is
//! a pure function of observed state; applying them is idempotent: writing
//! identical content never bumps a transition timestamp.

use crate::resource::DatabaseCluster;
use crate::topology::TopologyOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Named condition types reported on a cluster resource.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    /// The cluster is converged and serving
    Ready,

    /// The topology state machine has reached its stable state
    TopologyReady,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::TopologyReady => write!(f, "TopologyReady"),
        }
    }
}

/// Machine-readable condition reasons.
pub mod reason {
    pub const HEALTHY: &str = "Healthy";
    pub const DEPENDENTS_NOT_READY: &str = "DependentsNotReady";
    pub const TOPOLOGY_NOT_READY: &str = "TopologyNotReady";
    pub const CONFLICTING_OBSERVATION: &str = "ConflictingObservation";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const IMMUTABLE_TOPOLOGY: &str = "ImmutableTopologyViolation";
    pub const DATA_LOSS: &str = "DataLossDetected";
}

/// A named boolean status field with reason and message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: SystemTime,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition: SystemTime::now(),
        }
    }

    /// True when the two conditions carry the same content, ignoring the
    /// transition timestamp.
    pub fn same_content(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Merge a newly computed condition into an existing set.
///
/// If a condition of the same type with identical content already exists,
/// its transition timestamp is preserved. Any change of status, reason or
/// message replaces it and records a new transition time.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    for existing in conditions.iter_mut() {
        if existing.condition_type == new.condition_type {
            if !existing.same_content(&new) {
                *existing = new;
            }
            return;
        }
    }
    conditions.push(new);
}

/// Look up a condition by type.
pub fn find_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Compute the condition set for a cluster from its observed state.
///
/// Pure function: takes the resource, whether all dependent objects
/// converged this pass, and the topology outcome (None when the topology
/// machine could not run, with the blocking reason passed separately).
pub fn aggregate(
    cluster: &DatabaseCluster,
    dependents_ready: bool,
    outcome: Option<&TopologyOutcome>,
    blocked: Option<(&str, &str)>,
) -> Vec<Condition> {
    let mut conditions = Vec::new();

    if let Some((blocked_reason, blocked_message)) = blocked {
        conditions.push(Condition::new(
            ConditionType::TopologyReady,
            false,
            blocked_reason,
            blocked_message,
        ));
        conditions.push(Condition::new(
            ConditionType::Ready,
            false,
            blocked_reason,
            blocked_message,
        ));
        return conditions;
    }

    let (topology_ready, topology_reason, topology_message) = match outcome {
        Some(outcome) if outcome.ready => (
            true,
            reason::HEALTHY.to_string(),
            format!("Topology {} is stable", cluster.effective_topology()),
        ),
        Some(outcome) => (false, outcome.reason.clone(), outcome.message.clone()),
        None => (
            true,
            reason::HEALTHY.to_string(),
            "No managed topology".to_string(),
        ),
    };

    conditions.push(Condition::new(
        ConditionType::TopologyReady,
        topology_ready,
        topology_reason.clone(),
        topology_message.clone(),
    ));

    let ready = dependents_ready && topology_ready;
    let (ready_reason, ready_message) = if !dependents_ready {
        (
            reason::DEPENDENTS_NOT_READY.to_string(),
            "Dependent objects have not converged".to_string(),
        )
    } else if !topology_ready {
        (topology_reason, topology_message)
    } else {
        (
            reason::HEALTHY.to_string(),
            "Cluster is ready".to_string(),
        )
    };

    conditions.push(Condition::new(
        ConditionType::Ready,
        ready,
        ready_reason,
        ready_message,
    ));

    conditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ClusterKey, ClusterSpec, TopologyMode};
    use crate::topology::{TopologyOutcome, TopologyPhase};

    fn test_cluster() -> DatabaseCluster {
        DatabaseCluster::new(
            ClusterKey::new("db"),
            ClusterSpec::new(3, TopologyMode::MultiMaster),
        )
    }

    fn clustered_outcome() -> TopologyOutcome {
        TopologyOutcome {
            phase: TopologyPhase::Clustered,
            ready: true,
            reason: reason::HEALTHY.to_string(),
            message: "All instances are members of one quorum component".to_string(),
            members: vec![0, 1, 2],
            primary_ordinal: None,
        }
    }

    #[test]
    fn test_set_condition_preserves_timestamp_on_identical_content() {
        let mut conditions = Vec::new();
        let first = Condition::new(ConditionType::Ready, true, reason::HEALTHY, "ok");
        let original_time = first.last_transition;
        set_condition(&mut conditions, first);

        // Re-apply identical content with a later timestamp
        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, true, reason::HEALTHY, "ok"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition, original_time);
    }

    #[test]
    fn test_set_condition_bumps_timestamp_on_change() {
        let mut conditions = Vec::new();
        let first = Condition::new(ConditionType::Ready, true, reason::HEALTHY, "ok");
        let original_time = first.last_transition;
        set_condition(&mut conditions, first);

        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, false, reason::TOPOLOGY_NOT_READY, "recovering"),
        );

        assert_eq!(conditions.len(), 1);
        assert!(!conditions[0].status);
        assert!(conditions[0].last_transition > original_time);
    }

    #[test]
    fn test_aggregate_ready_when_everything_converged() {
        let cluster = test_cluster();
        let outcome = clustered_outcome();
        let conditions = aggregate(&cluster, true, Some(&outcome), None);

        let ready = find_condition(&conditions, ConditionType::Ready).unwrap();
        assert!(ready.status);
        assert_eq!(ready.reason, reason::HEALTHY);
    }

    #[test]
    fn test_aggregate_not_ready_while_dependents_pending() {
        let cluster = test_cluster();
        let outcome = clustered_outcome();
        let conditions = aggregate(&cluster, false, Some(&outcome), None);

        let ready = find_condition(&conditions, ConditionType::Ready).unwrap();
        assert!(!ready.status);
        assert_eq!(ready.reason, reason::DEPENDENTS_NOT_READY);
    }

    #[test]
    fn test_aggregate_blocked_overrides_everything() {
        let cluster = test_cluster();
        let conditions = aggregate(
            &cluster,
            true,
            None,
            Some((reason::CONFLICTING_OBSERVATION, "two primaries observed")),
        );

        let ready = find_condition(&conditions, ConditionType::Ready).unwrap();
        assert!(!ready.status);
        assert_eq!(ready.reason, reason::CONFLICTING_OBSERVATION);
        let topology = find_condition(&conditions, ConditionType::TopologyReady).unwrap();
        assert!(!topology.status);
    }
}
