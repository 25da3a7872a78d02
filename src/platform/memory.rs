//! In-memory platform and admin channel
//!
//! A self-contained simulation of the orchestration platform and the
//! database fleet, shared by integration tests and local demo runs. The
//! platform half serves resources and instances; the admin half mutates the
//! simulated per-instance database state (membership views, seqnos, log
//! positions) the way a real fleet would respond to the same commands.

use crate::error::{AdminError, PlatformError, ReconcileError};
use crate::platform::{
    DependentReconciler, Discovery, InstanceAdmin, MembershipView, PlatformClient,
};
use crate::resource::{
    ClusterKey, ClusterSpec, ClusterStatus, DatabaseCluster, Instance, InstanceAnnotations,
    LogPosition,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Simulated state of one database instance.
#[derive(Clone, Debug)]
struct SimInstance {
    instance: Instance,
    view: MembershipView,
    seqno: Option<u64>,
    applied: LogPosition,
    accepts_writes: bool,
    replicating_from: Option<String>,
    replication_start: Option<LogPosition>,
}

impl SimInstance {
    fn fresh(ordinal: u32, cluster: &ClusterKey) -> Self {
        let address = format!("{}-{}.db.local:3306", cluster, ordinal);
        Self {
            instance: Instance::new(ordinal, address),
            view: MembershipView::fresh(),
            seqno: Some(0),
            applied: LogPosition(0),
            accepts_writes: false,
            replicating_from: None,
            replication_start: None,
        }
    }
}

#[derive(Default)]
struct SimState {
    clusters: HashMap<ClusterKey, DatabaseCluster>,
    instances: HashMap<ClusterKey, BTreeMap<u32, SimInstance>>,
    /// Side-effecting commands issued against the fleet, for convergence
    /// assertions in tests
    actions: Vec<String>,
}

impl SimState {
    fn sim_instance_mut(&mut self, instance: &Instance) -> Result<&mut SimInstance, AdminError> {
        for per_cluster in self.instances.values_mut() {
            if let Some(sim) = per_cluster.get_mut(&instance.ordinal) {
                if sim.instance.address == instance.address {
                    if !sim.instance.running {
                        return Err(AdminError::Unreachable {
                            ordinal: instance.ordinal,
                            reason: "instance not running".to_string(),
                        });
                    }
                    return Ok(sim);
                }
            }
        }
        Err(AdminError::Unreachable {
            ordinal: instance.ordinal,
            reason: "unknown instance".to_string(),
        })
    }

    fn find_by_address(&self, address: &str) -> Option<(ClusterKey, u32)> {
        for (key, per_cluster) in &self.instances {
            for sim in per_cluster.values() {
                if sim.instance.address == address {
                    return Some((key.clone(), sim.instance.ordinal));
                }
            }
        }
        None
    }
}

/// In-memory platform object store.
#[derive(Clone)]
pub struct InMemoryPlatform {
    state: Arc<Mutex<SimState>>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Admin channel backed by the same simulated fleet.
    pub fn admin(&self) -> InMemoryAdmin {
        InMemoryAdmin {
            state: self.state.clone(),
        }
    }

    /// Declare a cluster resource and create its fresh instance set.
    pub fn add_cluster(&self, key: ClusterKey, spec: ClusterSpec) {
        let mut state = self.state.lock().unwrap();
        let mut instances = BTreeMap::new();
        for ordinal in 0..spec.replicas {
            instances.insert(ordinal, SimInstance::fresh(ordinal, &key));
        }
        state.instances.insert(key.clone(), instances);
        state
            .clusters
            .insert(key.clone(), DatabaseCluster::new(key, spec));
    }

    /// Mark a cluster resource as deletion-requested.
    pub fn request_deletion(&self, key: &ClusterKey) {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.clusters.get_mut(key) {
            cluster.deletion_requested = true;
        }
    }

    /// Bump the spec generation and apply an edit, as a user would.
    pub fn edit_spec(&self, key: &ClusterKey, edit: impl FnOnce(&mut ClusterSpec)) {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.clusters.get_mut(key) {
            edit(&mut cluster.spec);
            cluster.generation += 1;
        }
    }

    /// Current status of a cluster resource, for assertions.
    pub fn status(&self, key: &ClusterKey) -> Option<ClusterStatus> {
        let state = self.state.lock().unwrap();
        state.clusters.get(key).map(|c| c.status.clone())
    }

    /// Annotations currently carried by an instance, for assertions.
    pub fn instance_annotations(&self, key: &ClusterKey, ordinal: u32) -> Option<InstanceAnnotations> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(key)
            .and_then(|m| m.get(&ordinal))
            .map(|sim| sim.instance.annotations.clone())
    }

    /// Drain the recorded side-effecting fleet commands.
    pub fn take_actions(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.actions)
    }

    pub fn set_running(&self, key: &ClusterKey, ordinal: u32, running: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(sim) = state.instances.get_mut(key).and_then(|m| m.get_mut(&ordinal)) {
            sim.instance.running = running;
            if !running {
                sim.instance.healthy = false;
            }
        }
    }

    pub fn set_healthy(&self, key: &ClusterKey, ordinal: u32, healthy: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(sim) = state.instances.get_mut(key).and_then(|m| m.get_mut(&ordinal)) {
            sim.instance.healthy = healthy;
        }
    }

    pub fn set_commit_seqno(&self, key: &ClusterKey, ordinal: u32, seqno: Option<u64>) {
        let mut state = self.state.lock().unwrap();
        if let Some(sim) = state.instances.get_mut(key).and_then(|m| m.get_mut(&ordinal)) {
            sim.seqno = seqno;
        }
    }

    /// Start position the instance was last configured to replicate from,
    /// for assertions.
    pub fn replication_start(&self, key: &ClusterKey, ordinal: u32) -> Option<LogPosition> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(key)
            .and_then(|m| m.get(&ordinal))
            .and_then(|sim| sim.replication_start)
    }

    pub fn set_applied_position(&self, key: &ClusterKey, ordinal: u32, position: LogPosition) {
        let mut state = self.state.lock().unwrap();
        if let Some(sim) = state.instances.get_mut(key).and_then(|m| m.get_mut(&ordinal)) {
            sim.applied = position;
        }
    }

    /// Split the simulated quorum cluster into disjoint components, as a
    /// network partition would. Each group becomes its members' new view.
    pub fn partition(&self, key: &ClusterKey, groups: &[&[u32]]) {
        let mut state = self.state.lock().unwrap();
        if let Some(per_cluster) = state.instances.get_mut(key) {
            for group in groups {
                let mut members: Vec<u32> = group.to_vec();
                members.sort_unstable();
                for ordinal in *group {
                    if let Some(sim) = per_cluster.get_mut(ordinal) {
                        sim.view = MembershipView {
                            member: members.len() > 1,
                            component: members.clone(),
                            synced: members.len() > 1,
                        };
                    }
                }
            }
        }
    }
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<DatabaseCluster>, PlatformError> {
        let state = self.state.lock().unwrap();
        Ok(state.clusters.get(key).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterKey>, PlatformError> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<ClusterKey> = state.clusters.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn update_status(&self, key: &ClusterKey, status: ClusterStatus) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        match state.clusters.get_mut(key) {
            Some(cluster) => {
                cluster.status = status;
                Ok(())
            }
            None => Err(PlatformError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn list_instances(&self, key: &ClusterKey) -> Result<Vec<Instance>, PlatformError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .get(key)
            .map(|m| m.values().map(|sim| sim.instance.clone()).collect())
            .unwrap_or_default())
    }

    async fn annotate_instance(
        &self,
        key: &ClusterKey,
        ordinal: u32,
        annotations: InstanceAnnotations,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(key).and_then(|m| m.get_mut(&ordinal)) {
            Some(sim) => {
                sim.instance.annotations = annotations;
                Ok(())
            }
            None => Err(PlatformError::NotFound {
                key: format!("{}/{}", key, ordinal),
            }),
        }
    }

    async fn add_finalizer(&self, key: &ClusterKey, finalizer: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.clusters.get_mut(key) {
            if !cluster.finalizers.iter().any(|f| f == finalizer) {
                cluster.finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ClusterKey, finalizer: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.clusters.get_mut(key) {
            cluster.finalizers.retain(|f| f != finalizer);
            if cluster.deletion_requested && cluster.finalizers.is_empty() {
                state.clusters.remove(key);
                state.instances.remove(key);
            }
        }
        Ok(())
    }
}

/// Admin command channel into the simulated fleet.
#[derive(Clone)]
pub struct InMemoryAdmin {
    state: Arc<Mutex<SimState>>,
}

#[async_trait::async_trait]
impl InstanceAdmin for InMemoryAdmin {
    async fn bootstrap_seed(&self, instance: &Instance) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.view = MembershipView {
            member: true,
            component: vec![instance.ordinal],
            synced: true,
        };
        if sim.seqno.is_none() {
            sim.seqno = Some(0);
        }
        state
            .actions
            .push(format!("bootstrap-seed {}", instance.ordinal));
        Ok(())
    }

    async fn join_cluster(&self, instance: &Instance, seed_address: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        let (seed_key, seed_ordinal) =
            state
                .find_by_address(seed_address)
                .ok_or_else(|| AdminError::CommandFailed {
                    ordinal: instance.ordinal,
                    reason: format!("no donor at {}", seed_address),
                })?;

        let (mut component, seed_seqno) = {
            let per_cluster = state.instances.get(&seed_key).unwrap();
            let seed = per_cluster.get(&seed_ordinal).unwrap();
            if !seed.view.member {
                return Err(AdminError::CommandFailed {
                    ordinal: instance.ordinal,
                    reason: format!("donor {} is not a cluster member", seed_ordinal),
                });
            }
            (seed.view.component.clone(), seed.seqno)
        };

        if !component.contains(&instance.ordinal) {
            component.push(instance.ordinal);
            component.sort_unstable();
        }

        // State transfer: the joiner adopts the donor component's dataset,
        // and every member of the component observes the new membership.
        let per_cluster = state.instances.get_mut(&seed_key).unwrap();
        for ordinal in &component {
            if let Some(member) = per_cluster.get_mut(ordinal) {
                member.view = MembershipView {
                    member: true,
                    component: component.clone(),
                    synced: true,
                };
            }
        }
        if let Some(joiner) = per_cluster.get_mut(&instance.ordinal) {
            joiner.seqno = seed_seqno;
        }

        state.actions.push(format!(
            "join {} <- seed {}",
            instance.ordinal, seed_ordinal
        ));
        Ok(())
    }

    async fn query_membership(&self, instance: &Instance) -> Result<MembershipView, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        Ok(sim.view.clone())
    }

    async fn query_commit_seqno(&self, instance: &Instance) -> Result<Option<u64>, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        Ok(sim.seqno)
    }

    async fn configure_primary(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.accepts_writes = true;
        sim.replicating_from = None;
        let position = sim.applied;
        state
            .actions
            .push(format!("configure-primary {}", instance.ordinal));
        Ok(position)
    }

    async fn configure_replica(
        &self,
        instance: &Instance,
        source_address: &str,
        start: LogPosition,
    ) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.accepts_writes = false;
        sim.replicating_from = Some(source_address.to_string());
        sim.replication_start = Some(start);
        state.actions.push(format!(
            "configure-replica {} <- {}",
            instance.ordinal, source_address
        ));
        Ok(())
    }

    async fn promote(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.accepts_writes = true;
        sim.replicating_from = None;
        let position = sim.applied;
        state.actions.push(format!("promote {}", instance.ordinal));
        Ok(position)
    }

    async fn demote(&self, instance: &Instance) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.accepts_writes = false;
        state.actions.push(format!("demote {}", instance.ordinal));
        Ok(())
    }

    async fn query_applied_position(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        if !sim.instance.healthy {
            return Err(AdminError::Timeout {
                ordinal: instance.ordinal,
                command: "query-applied-position".to_string(),
            });
        }
        Ok(sim.applied)
    }

    async fn query_writable(&self, instance: &Instance) -> Result<bool, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        if !sim.instance.healthy {
            return Err(AdminError::Timeout {
                ordinal: instance.ordinal,
                command: "query-writable".to_string(),
            });
        }
        Ok(sim.accepts_writes)
    }

    async fn quiesce(&self, instance: &Instance) -> Result<LogPosition, AdminError> {
        let mut state = self.state.lock().unwrap();
        let sim = state.sim_instance_mut(instance)?;
        sim.accepts_writes = false;
        let position = sim.applied;
        state.actions.push(format!("quiesce {}", instance.ordinal));
        Ok(position)
    }
}

/// Dependent reconciler stub: converges instantly, optionally failing a
/// configured number of times first to exercise back-off paths.
pub struct NoopDependent {
    name: String,
    remaining_failures: Mutex<u32>,
}

impl NoopDependent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remaining_failures: Mutex::new(0),
        }
    }

    pub fn failing(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            remaining_failures: Mutex::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl DependentReconciler for NoopDependent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self, _cluster: &DatabaseCluster) -> Result<(), ReconcileError> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ReconcileError::transient(format!(
                "{} not yet ready",
                self.name
            )));
        }
        Ok(())
    }
}

/// Admin channel whose commands never complete, simulating a wedged
/// instance. Only useful behind a timeout-enforcing wrapper.
pub struct UnresponsiveAdmin;

#[async_trait::async_trait]
impl InstanceAdmin for UnresponsiveAdmin {
    async fn bootstrap_seed(&self, _instance: &Instance) -> Result<(), AdminError> {
        std::future::pending().await
    }

    async fn join_cluster(&self, _instance: &Instance, _seed_address: &str) -> Result<(), AdminError> {
        std::future::pending().await
    }

    async fn query_membership(&self, _instance: &Instance) -> Result<MembershipView, AdminError> {
        std::future::pending().await
    }

    async fn query_commit_seqno(&self, _instance: &Instance) -> Result<Option<u64>, AdminError> {
        std::future::pending().await
    }

    async fn configure_primary(&self, _instance: &Instance) -> Result<LogPosition, AdminError> {
        std::future::pending().await
    }

    async fn configure_replica(
        &self,
        _instance: &Instance,
        _source_address: &str,
        _start: LogPosition,
    ) -> Result<(), AdminError> {
        std::future::pending().await
    }

    async fn promote(&self, _instance: &Instance) -> Result<LogPosition, AdminError> {
        std::future::pending().await
    }

    async fn demote(&self, _instance: &Instance) -> Result<(), AdminError> {
        std::future::pending().await
    }

    async fn query_applied_position(&self, _instance: &Instance) -> Result<LogPosition, AdminError> {
        std::future::pending().await
    }

    async fn query_writable(&self, _instance: &Instance) -> Result<bool, AdminError> {
        std::future::pending().await
    }

    async fn quiesce(&self, _instance: &Instance) -> Result<LogPosition, AdminError> {
        std::future::pending().await
    }
}

/// Fixed-answer capability discovery.
pub struct StaticDiscovery {
    pub monitoring: bool,
}

#[async_trait::async_trait]
impl Discovery for StaticDiscovery {
    async fn has_monitoring(&self) -> bool {
        self.monitoring
    }
}
