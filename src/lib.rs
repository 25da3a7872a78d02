//! Choral: topology control plane for clustered relational databases.
//!
//! Reconciles declared cluster resources against observed state on a
//! container-orchestration platform: dependent objects, instance role
//! assignment, quorum/multi-master bootstrap and recovery, primary/replica
//! election and failover, and status conditions.

pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod platform;
pub mod registry;
pub mod resource;
pub mod runtime;
pub mod topology;

pub use config::OperatorConfig;
pub use dispatch::{InstanceEvent, InstanceEventKind};
pub use error::{AdminError, PlatformError, ReconcileError};
pub use resource::{ClusterKey, ClusterSpec, DatabaseCluster, Instance, TopologyMode};
pub use runtime::{LeadershipGate, OperatorRuntime, StandaloneLeadership};
