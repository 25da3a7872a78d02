//! Platform collaborator seams
//!
//! Narrow interfaces to everything the engine does not own: the platform
//! object API, the per-kind dependent-object reconcilers, capability
//! discovery, and the administrative command channel into live database
//! instances. The engine is written entirely against these traits; tests and
//! local runs use the in-memory implementations in [`memory`].

pub mod memory;

use crate::error::{AdminError, PlatformError, ReconcileError};
use crate::resource::{ClusterKey, ClusterStatus, DatabaseCluster, Instance, InstanceAnnotations, LogPosition};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{InMemoryAdmin, InMemoryPlatform, NoopDependent, StaticDiscovery, UnresponsiveAdmin};

/// A single instance's view of quorum cluster membership, as reported over
/// the admin channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipView {
    /// Whether the instance currently considers itself a cluster member
    pub member: bool,

    /// Ordinals of the instances this one currently sees as members of its
    /// component (including itself when `member` is true)
    pub component: Vec<u32>,

    /// Whether the instance has completed state transfer and is serving
    pub synced: bool,
}

impl MembershipView {
    /// View of a fresh instance that has never joined a cluster.
    pub fn fresh() -> Self {
        Self {
            member: false,
            component: Vec::new(),
            synced: false,
        }
    }
}

/// Read/write access to platform objects.
///
/// All writes have idempotent upsert semantics: the same desired input
/// always yields the same applied object and is safe to repeat.
#[async_trait::async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch a cluster resource. `Ok(None)` means it was deleted mid-flight,
    /// which reconciliation treats as a no-op success.
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<DatabaseCluster>, PlatformError>;

    /// List all known cluster resources (startup resync).
    async fn list_clusters(&self) -> Result<Vec<ClusterKey>, PlatformError>;

    /// Write the status sub-record of a cluster resource.
    async fn update_status(&self, key: &ClusterKey, status: ClusterStatus) -> Result<(), PlatformError>;

    /// List the compute instances belonging to a cluster, ordered by ordinal.
    async fn list_instances(&self, key: &ClusterKey) -> Result<Vec<Instance>, PlatformError>;

    /// Replace the annotation set on an instance.
    async fn annotate_instance(
        &self,
        key: &ClusterKey,
        ordinal: u32,
        annotations: InstanceAnnotations,
    ) -> Result<(), PlatformError>;

    /// Ensure the given finalizer is present on the resource.
    async fn add_finalizer(&self, key: &ClusterKey, finalizer: &str) -> Result<(), PlatformError>;

    /// Remove the given finalizer, allowing deletion to proceed.
    async fn remove_finalizer(&self, key: &ClusterKey, finalizer: &str) -> Result<(), PlatformError>;
}

/// One of the generic create-if-missing/update-if-drifted reconcilers for
/// dependent objects (secrets, config, services, endpoints, compute, RBAC,
/// monitoring, jobs). Bodies live outside this crate; the engine only cares
/// about ordering and error propagation.
#[async_trait::async_trait]
pub trait DependentReconciler: Send + Sync {
    /// Object kind this reconciler converges, used for logging and ordering.
    fn name(&self) -> &str;

    /// Bring the dependent object in line with the cluster spec.
    async fn ensure(&self, cluster: &DatabaseCluster) -> Result<(), ReconcileError>;
}

/// Read-only capability probing of the orchestration platform, used to gate
/// optional dependent objects.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Whether the platform has the monitoring object kind installed.
    async fn has_monitoring(&self) -> bool;
}

/// Administrative command channel into a live database instance.
///
/// Every call is blocking with a bounded timeout; a timeout is a transient
/// failure and the whole reconciliation is retried rather than partially
/// committed.
#[async_trait::async_trait]
pub trait InstanceAdmin: Send + Sync {
    /// Initialize the instance as a fresh single-node cluster (quorum mode).
    async fn bootstrap_seed(&self, instance: &Instance) -> Result<(), AdminError>;

    /// Join the instance to the cluster reachable at `seed_address`.
    /// Returns once state transfer (full or incremental) has completed and
    /// the instance reports synchronized.
    async fn join_cluster(&self, instance: &Instance, seed_address: &str) -> Result<(), AdminError>;

    /// Query the instance's local view of cluster membership (quorum mode).
    async fn query_membership(&self, instance: &Instance) -> Result<MembershipView, AdminError>;

    /// Query the instance's committed-transaction marker (quorum mode).
    /// `Ok(None)` means the instance has no usable marker.
    async fn query_commit_seqno(&self, instance: &Instance) -> Result<Option<u64>, AdminError>;

    /// Configure the instance to accept writes and expose its transaction
    /// log, returning its current log position.
    async fn configure_primary(&self, instance: &Instance) -> Result<LogPosition, AdminError>;

    /// Configure the instance to replicate from `source_address`, starting
    /// at `start` if it is joining fresh.
    async fn configure_replica(
        &self,
        instance: &Instance,
        source_address: &str,
        start: LogPosition,
    ) -> Result<(), AdminError>;

    /// Promote a replica to primary, returning its new log position.
    async fn promote(&self, instance: &Instance) -> Result<LogPosition, AdminError>;

    /// Demote a (former) primary so it no longer accepts writes.
    async fn demote(&self, instance: &Instance) -> Result<(), AdminError>;

    /// Query the last transaction position the instance has applied.
    async fn query_applied_position(&self, instance: &Instance) -> Result<LogPosition, AdminError>;

    /// Whether the instance currently accepts writes. Used to detect a
    /// returning former primary that must be demoted before it can fork the
    /// dataset.
    async fn query_writable(&self, instance: &Instance) -> Result<bool, AdminError>;

    /// Drain and quiesce writes on a primary ahead of a planned switchover,
    /// returning the final log position.
    async fn quiesce(&self, instance: &Instance) -> Result<LogPosition, AdminError>;
}

/// Decorator enforcing the bounded-timeout contract of [`InstanceAdmin`]
/// over any inner implementation. A call that does not complete within the
/// bound surfaces as [`AdminError::Timeout`], which the engine retries as a
/// transient failure; a wedged instance can therefore cost one pass, never
/// a worker.
pub struct TimeoutAdmin {
    inner: Arc<dyn InstanceAdmin>,
    timeout: Duration,
}

impl TimeoutAdmin {
    pub fn new(inner: Arc<dyn InstanceAdmin>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        ordinal: u32,
        command: &str,
        call: impl Future<Output = Result<T, AdminError>> + Send,
    ) -> Result<T, AdminError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdminError::Timeout {
                ordinal,
                command: command.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl InstanceAdmin for TimeoutAdmin {
    async fn bootstrap_seed(&self, instance: &Instance) -> Result<(), AdminError> {
        self.bounded(instance.ordinal, "bootstrap-seed", self.inner.bootstrap_seed(instance))
            .await
    }

    async fn join_cluster(&self, instance: &Instance, seed_address: &str) -> Result<(), AdminError> {
        self.bounded(
            instance.ordinal,
            "join-cluster",
            self.inner.join_cluster(instance, seed_address),
        )
        .await
    }

    async fn query_membership(&self, instance: &Instance) -> Result<MembershipView, AdminError> {
        self.bounded(
            instance.ordinal,
            "query-membership",
            self.inner.query_membership(instance),
        )
        .await
    }

    async fn query_commit_seqno(&self, instance: &Instance) -> Result<Option<u64>, AdminError> {
        self.bounded(
            instance.ordinal,
            "query-commit-seqno",
            self.inner.query_commit_seqno(instance),
        )
        .await
    }

    async fn configure_primary(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        self.bounded(
            instance.ordinal,
            "configure-primary",
            self.inner.configure_primary(instance),
        )
        .await
    }

    async fn configure_replica(
        &self,
        instance: &Instance,
        source_address: &str,
        start: LogPosition,
    ) -> Result<(), AdminError> {
        self.bounded(
            instance.ordinal,
            "configure-replica",
            self.inner.configure_replica(instance, source_address, start),
        )
        .await
    }

    async fn promote(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        self.bounded(instance.ordinal, "promote", self.inner.promote(instance))
            .await
    }

    async fn demote(&self, instance: &Instance) -> Result<(), AdminError> {
        self.bounded(instance.ordinal, "demote", self.inner.demote(instance))
            .await
    }

    async fn query_applied_position(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        self.bounded(
            instance.ordinal,
            "query-applied-position",
            self.inner.query_applied_position(instance),
        )
        .await
    }

    async fn query_writable(&self, instance: &Instance) -> Result<bool, AdminError> {
        self.bounded(
            instance.ordinal,
            "query-writable",
            self.inner.query_writable(instance),
        )
        .await
    }

    async fn quiesce(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        self.bounded(instance.ordinal, "quiesce", self.inner.quiesce(instance))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use crate::resource::{ClusterSpec, TopologyMode};

    #[tokio::test(start_paused = true)]
    async fn test_wedged_admin_call_times_out_as_transient() {
        let admin = TimeoutAdmin::new(Arc::new(UnresponsiveAdmin), Duration::from_secs(10));
        let instance = Instance::new(0, "db-0.db.local:3306");

        let err = admin.query_membership(&instance).await.unwrap_err();
        assert!(matches!(err, AdminError::Timeout { ordinal: 0, .. }));

        let err: ReconcileError = err.into();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_admin_passes_through() {
        let platform = InMemoryPlatform::new();
        let key = ClusterKey::new("db");
        platform.add_cluster(key.clone(), ClusterSpec::new(1, TopologyMode::MultiMaster));
        let admin = TimeoutAdmin::new(Arc::new(platform.admin()), Duration::from_secs(10));

        let instances = platform.list_instances(&key).await.unwrap();
        admin.bootstrap_seed(&instances[0]).await.unwrap();
        let view = admin.query_membership(&instances[0]).await.unwrap();
        assert!(view.member);
    }
}
