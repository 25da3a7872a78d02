//! Instance registry
//!
//! Ordinal-indexed view of the compute instances belonging to each managed
//! cluster, built from platform observations and the ownership annotations
//! the instances carry. Answers "which instances belong to cluster X" and
//! "what is the declared role of instance Y".

use crate::resource::{ClusterKey, Instance, InstanceRole};
use std::collections::{BTreeMap, HashMap};

/// Registry of observed instances, indexed by owning cluster and ordinal.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    by_cluster: HashMap<ClusterKey, BTreeMap<u32, Instance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed instance. Instances without an owner annotation
    /// belong to unmanaged infrastructure and are ignored.
    pub fn observe(&mut self, instance: Instance) {
        let Some(owner) = instance.annotations.owner.clone() else {
            return;
        };
        self.by_cluster
            .entry(owner)
            .or_default()
            .insert(instance.ordinal, instance);
    }

    /// Replace the full instance set of a cluster with a fresh observation.
    pub fn replace(&mut self, key: &ClusterKey, instances: Vec<Instance>) {
        let entry = self.by_cluster.entry(key.clone()).or_default();
        entry.clear();
        for instance in instances {
            entry.insert(instance.ordinal, instance);
        }
    }

    /// Forget a cluster entirely (resource deleted).
    pub fn forget(&mut self, key: &ClusterKey) {
        self.by_cluster.remove(key);
    }

    /// Instances of a cluster in ordinal order.
    pub fn instances_of(&self, key: &ClusterKey) -> Vec<&Instance> {
        self.by_cluster
            .get(key)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Declared role of one instance.
    pub fn role_of(&self, key: &ClusterKey, ordinal: u32) -> Option<InstanceRole> {
        self.by_cluster
            .get(key)
            .and_then(|m| m.get(&ordinal))
            .map(|i| i.annotations.role)
    }

    /// Ordinal of the instance currently annotated primary, if any.
    pub fn primary_of(&self, key: &ClusterKey) -> Option<u32> {
        self.by_cluster.get(key).and_then(|m| {
            m.values()
                .find(|i| i.annotations.role == InstanceRole::Primary)
                .map(|i| i.ordinal)
        })
    }

    pub fn cluster_count(&self) -> usize {
        self.by_cluster.len()
    }
}
