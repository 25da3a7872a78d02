//! Per-cluster reconciliation pass
//!
//! One pass compares a cluster's declared spec against observed state and
//! converges: finalizer bookkeeping, spec validation, dependent objects in
//! a fixed order, instance annotations, topology, and finally the status
//! sub-record. Every pass re-derives its decisions from scratch; nothing is
//! carried over from the previous pass.

use crate::conditions::{self, reason, Condition, ConditionType};
use crate::config::OperatorConfig;
use crate::error::ReconcileError;
use crate::platform::{DependentReconciler, Discovery, PlatformClient};
use crate::registry::InstanceRegistry;
use crate::resource::{
    ClusterKey, ClusterSpec, ClusterStatus, DatabaseCluster, Instance, InstanceAnnotations,
    InstanceRole, TopologyMode,
};
use crate::topology::{
    QuorumStateMachine, ReplicationStateMachine, TopologyHandler, TopologyOutcome,
};
use slog::{debug, info, warn, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Name of the monitoring dependent, gated on platform capability.
pub const MONITORING_DEPENDENT: &str = "monitoring";

/// What the engine should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Re-enqueue after the given interval
    After(Duration),

    /// Do not requeue; only new events bring the key back
    None,
}

pub struct ClusterReconciler {
    platform: Arc<dyn PlatformClient>,
    dependents: Vec<Arc<dyn DependentReconciler>>,
    discovery: Arc<dyn Discovery>,
    quorum: Arc<QuorumStateMachine>,
    replica: Arc<ReplicationStateMachine>,
    registry: Arc<Mutex<InstanceRegistry>>,
    config: OperatorConfig,
    logger: Logger,
}

impl ClusterReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        dependents: Vec<Arc<dyn DependentReconciler>>,
        discovery: Arc<dyn Discovery>,
        quorum: Arc<QuorumStateMachine>,
        replica: Arc<ReplicationStateMachine>,
        registry: Arc<Mutex<InstanceRegistry>>,
        config: OperatorConfig,
        logger: Logger,
    ) -> Self {
        Self {
            platform,
            dependents,
            discovery,
            quorum,
            replica,
            registry,
            config,
            logger,
        }
    }

    /// Run one reconciliation pass for the given cluster key.
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<Requeue, ReconcileError> {
        let pass = Uuid::new_v4();
        let logger = self.logger.new(slog::o!(
            "cluster" => key.to_string(),
            "pass" => pass.to_string()
        ));

        let Some(cluster) = self.platform.get_cluster(key).await? else {
            // Deleted mid-flight: nothing to converge.
            debug!(logger, "Cluster no longer exists");
            self.registry.lock().unwrap().forget(key);
            self.replica.forget(key);
            return Ok(Requeue::None);
        };

        if cluster.deletion_requested {
            return self.finalize(&cluster, &logger).await;
        }

        self.platform
            .add_finalizer(key, &self.config.finalizer)
            .await?;

        if let Err(message) = validate_spec(&cluster.spec) {
            warn!(logger, "Spec rejected"; "error" => message.as_str());
            self.write_status(&cluster, |status| {
                let computed = conditions::aggregate(
                    &cluster,
                    true,
                    None,
                    Some((reason::INVALID_SPEC, &message)),
                );
                for condition in computed {
                    conditions::set_condition(&mut status.conditions, condition);
                }
            })
            .await?;
            // Re-evaluated on spec change, not on a timer.
            return Ok(Requeue::None);
        }

        let mode = cluster.effective_topology();
        let immutable_violation = cluster
            .status
            .topology
            .map(|locked| locked != cluster.spec.topology)
            .unwrap_or(false);
        if immutable_violation {
            warn!(logger, "Declared topology differs from the bootstrapped one";
                "declared" => %cluster.spec.topology, "effective" => %mode);
        }

        self.ensure_dependents(&cluster, &logger).await?;

        let instances = self.platform.list_instances(key).await?;
        self.registry.lock().unwrap().replace(key, instances.clone());

        let handler = TopologyHandler::for_mode(mode, &self.quorum, &self.replica);
        let result = match handler {
            TopologyHandler::MultiMaster(machine) => {
                machine.reconcile_cluster(&cluster, &instances).await.map(Some)
            }
            TopologyHandler::PrimaryReplica(machine) => {
                machine.reconcile_cluster(&cluster, &instances).await.map(Some)
            }
            TopologyHandler::None => {
                self.ensure_unmanaged_annotations(&cluster, &instances)
                    .await?;
                Ok(None)
            }
        };

        let (outcome, blocked): (Option<TopologyOutcome>, Option<(String, String)>) = match result
        {
            Ok(outcome) => (outcome, None),
            Err(ReconcileError::ConflictingObservation { reason: detail }) => {
                warn!(logger, "Topology blocked on conflicting observations";
                    "detail" => detail.as_str());
                (
                    None,
                    Some((reason::CONFLICTING_OBSERVATION.to_string(), detail)),
                )
            }
            Err(e) => return Err(e),
        };

        // The violation condition outranks convergence reporting, but a
        // conflicting observation is the more urgent signal of the two.
        let blocked = blocked.or_else(|| {
            immutable_violation.then(|| {
                (
                    reason::IMMUTABLE_TOPOLOGY.to_string(),
                    format!(
                        "Topology is immutable: bootstrapped as {}, declared {}",
                        mode, cluster.spec.topology
                    ),
                )
            })
        });

        let computed = conditions::aggregate(
            &cluster,
            true,
            outcome.as_ref(),
            blocked.as_ref().map(|(r, m)| (r.as_str(), m.as_str())),
        );

        self.write_status(&cluster, |status| {
            if let Some(outcome) = &outcome {
                status.phase = Some(outcome.phase.to_string());
                status.members = outcome.members.clone();
                status.primary_ordinal = outcome.primary_ordinal;
                // Lock the mode in at the first successful convergence.
                if outcome.ready && status.topology.is_none() {
                    status.topology = Some(mode);
                }
            }
            for condition in computed {
                conditions::set_condition(&mut status.conditions, condition);
            }
        })
        .await?;

        if let Some(outcome) = &outcome {
            debug!(logger, "Pass complete";
                "phase" => %outcome.phase, "ready" => outcome.ready);
        }

        Ok(Requeue::After(self.config.requeue_for(mode)))
    }

    /// Deletion path: release our finalizer so the platform can collect the
    /// resource, and drop all process-local state for the key.
    async fn finalize(
        &self,
        cluster: &DatabaseCluster,
        logger: &Logger,
    ) -> Result<Requeue, ReconcileError> {
        info!(logger, "Finalizing deleted cluster");
        self.registry.lock().unwrap().forget(&cluster.key);
        self.replica.forget(&cluster.key);
        self.platform
            .remove_finalizer(&cluster.key, &self.config.finalizer)
            .await?;
        Ok(Requeue::None)
    }

    /// Converge dependent objects in their fixed order. Monitoring is
    /// skipped when the platform lacks the capability.
    async fn ensure_dependents(
        &self,
        cluster: &DatabaseCluster,
        logger: &Logger,
    ) -> Result<(), ReconcileError> {
        for dependent in &self.dependents {
            if dependent.name() == MONITORING_DEPENDENT && !self.discovery.has_monitoring().await {
                debug!(logger, "Skipping dependent, capability missing";
                    "dependent" => dependent.name());
                continue;
            }
            if let Err(e) = dependent.ensure(cluster).await {
                warn!(logger, "Dependent not converged";
                    "dependent" => dependent.name(), "error" => %e);
                if e.is_transient() {
                    // Surface the blocking dependent, then let the engine
                    // retry the whole pass with back-off.
                    self.write_status(cluster, |status| {
                        conditions::set_condition(
                            &mut status.conditions,
                            Condition::new(
                                ConditionType::Ready,
                                false,
                                reason::DEPENDENTS_NOT_READY,
                                format!("Dependent '{}' has not converged", dependent.name()),
                            ),
                        );
                    })
                    .await?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// In unmanaged-topology mode we still claim the instances so the
    /// dispatcher can attribute their events.
    async fn ensure_unmanaged_annotations(
        &self,
        cluster: &DatabaseCluster,
        instances: &[Instance],
    ) -> Result<(), ReconcileError> {
        for instance in instances {
            let desired = InstanceAnnotations {
                owner: Some(cluster.key.clone()),
                role: InstanceRole::Unassigned,
                topology: Some(TopologyMode::None),
                bootstrap_seed: false,
            };
            if instance.annotations == desired {
                continue;
            }
            self.platform
                .annotate_instance(&cluster.key, instance.ordinal, desired)
                .await?;
        }
        Ok(())
    }

    /// Clone-mutate-write of the status sub-record. The observed generation
    /// always tracks the spec generation the pass was derived from.
    async fn write_status(
        &self,
        cluster: &DatabaseCluster,
        mutate: impl FnOnce(&mut ClusterStatus),
    ) -> Result<(), ReconcileError> {
        let mut status = cluster.status.clone();
        status.observed_generation = cluster.generation;
        mutate(&mut status);
        self.platform.update_status(&cluster.key, status).await?;
        Ok(())
    }
}

/// Structural spec validation. Failures here are user errors, reported as a
/// persistent condition and never retried on a timer.
fn validate_spec(spec: &ClusterSpec) -> Result<(), String> {
    if spec.replicas == 0 {
        return Err("replicas must be at least 1".to_string());
    }
    if let Some(pinned) = spec.pinned_primary {
        if spec.topology != TopologyMode::PrimaryReplica {
            return Err(format!(
                "pinned_primary requires primary-replica topology, declared {}",
                spec.topology
            ));
        }
        if pinned >= spec.replicas {
            return Err(format!(
                "pinned_primary {} is outside the declared instance set 0..{}",
                pinned, spec.replicas
            ));
        }
    }
    if spec.credentials_secret.is_empty() {
        return Err("credentials_secret must be set".to_string());
    }
    Ok(())
}
