//! Resource model for managed database clusters
//!
//! A `DatabaseCluster` is the user's declared desired state. The control
//! plane only ever writes its status sub-record; the spec belongs to the
//! user. Instances are created and destroyed by the platform's instance-set
//! controller; we read and annotate them, never create or delete them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a cluster resource (unique within the platform).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey(pub String);

impl ClusterKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared replication topology of a cluster.
///
/// The mode is immutable after the first successful bootstrap; changing it
/// requires recreating the resource.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    /// Quorum-certified multi-master clustering (every instance writable)
    MultiMaster,

    /// Asynchronous primary/replica log shipping
    PrimaryReplica,

    /// Standalone instances, no managed topology
    None,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::MultiMaster => write!(f, "multi-master"),
            TopologyMode::PrimaryReplica => write!(f, "primary-replica"),
            TopologyMode::None => write!(f, "none"),
        }
    }
}

/// Persistent volume request for each instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageSpec {
    /// Volume size in GiB
    pub size_gib: u32,

    /// Storage class name (None = platform default)
    pub class: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size_gib: 10,
            class: None,
        }
    }
}

/// How instance updates are rolled out.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    #[default]
    RollingUpdate,
    OnDelete,
}

/// User-declared desired state of a cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    /// Number of declared instances (ordinals 0..replicas-1)
    pub replicas: u32,

    /// Replication topology
    pub topology: TopologyMode,

    /// Storage request per instance
    pub storage: StorageSpec,

    /// Name of the secret holding root/replication credentials
    pub credentials_secret: String,

    /// Pin the primary to a specific ordinal (primary/replica mode only).
    /// Changing this on a running cluster requests a planned switchover.
    pub pinned_primary: Option<u32>,

    /// Update rollout strategy
    pub update_strategy: UpdateStrategy,
}

impl ClusterSpec {
    /// Minimal spec for a cluster with the given size and topology.
    pub fn new(replicas: u32, topology: TopologyMode) -> Self {
        Self {
            replicas,
            topology,
            storage: StorageSpec::default(),
            credentials_secret: "db-credentials".to_string(),
            pinned_primary: None,
            update_strategy: UpdateStrategy::default(),
        }
    }
}

/// A managed cluster resource as observed from the platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseCluster {
    pub key: ClusterKey,

    /// Spec generation, bumped by the platform on every user edit
    pub generation: i64,

    /// Set when the user has requested deletion
    pub deletion_requested: bool,

    /// Finalizers blocking deletion until cleanup completes
    pub finalizers: Vec<String>,

    pub spec: ClusterSpec,

    /// Status sub-record, exclusively written by the control plane
    pub status: ClusterStatus,
}

impl DatabaseCluster {
    pub fn new(key: ClusterKey, spec: ClusterSpec) -> Self {
        Self {
            key,
            generation: 1,
            deletion_requested: false,
            finalizers: Vec::new(),
            spec,
            status: ClusterStatus::default(),
        }
    }

    /// Topology mode in effect: the bootstrapped mode once recorded,
    /// otherwise the declared one.
    pub fn effective_topology(&self) -> TopologyMode {
        self.status.topology.unwrap_or(self.spec.topology)
    }
}

/// Derived state attached to a cluster resource.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ClusterStatus {
    /// Topology mode locked in at first successful bootstrap
    pub topology: Option<TopologyMode>,

    /// Reported phase label of the topology state machine
    pub phase: Option<String>,

    /// Current primary ordinal (primary/replica mode)
    pub primary_ordinal: Option<u32>,

    /// Current cluster membership set (quorum mode)
    pub members: Vec<u32>,

    pub conditions: Vec<crate::conditions::Condition>,

    /// Generation this status was derived from, used to detect stale
    /// reconciliations
    pub observed_generation: i64,
}

/// Configured role of an instance, recorded as an annotation.
///
/// An instance never carries two roles at once; the annotation always
/// reflects the last successfully committed topology decision.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceRole {
    Primary,
    Replica,
    #[default]
    Unassigned,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Primary => write!(f, "primary"),
            InstanceRole::Replica => write!(f, "replica"),
            InstanceRole::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// Annotation set carried by each compute instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct InstanceAnnotations {
    /// Owning cluster resource (None = unmanaged infrastructure)
    pub owner: Option<ClusterKey>,

    pub role: InstanceRole,

    /// Topology mode the role was assigned under
    pub topology: Option<TopologyMode>,

    /// Marks the instance as the active bootstrap seed (quorum mode).
    /// At most one instance per cluster carries this at any time.
    pub bootstrap_seed: bool,
}

/// One running database process, identified by its ordinal within the
/// cluster's instance set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub ordinal: u32,

    /// Address the admin command channel connects to
    pub address: String,

    /// Whether the compute unit is currently scheduled and running
    pub running: bool,

    /// Last health probe result
    pub healthy: bool,

    pub annotations: InstanceAnnotations,
}

impl Instance {
    pub fn new(ordinal: u32, address: impl Into<String>) -> Self {
        Self {
            ordinal,
            address: address.into(),
            running: true,
            healthy: true,
            annotations: InstanceAnnotations::default(),
        }
    }
}

/// Transaction-log position of a primary/replica instance.
///
/// Monotonically ordered; used to rank replica eligibility for promotion.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogPosition(pub u64);

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
