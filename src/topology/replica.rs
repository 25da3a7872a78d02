//! Primary/replica topology state machine
//!
//! Manages asynchronous replication with a single writable primary:
//! election, steady-state convergence, debounced automatic failover, and
//! planned switchover. Like the quorum machine, the decision core is pure
//! and the executor applies its action list in order.
//!
//! Failover is debounced: the primary must fail its probe on a configured
//! number of consecutive passes before a replica is promoted. The counters
//! live in process memory only; losing them on a controller restart delays
//! a failover but never causes a spurious one.

use crate::conditions::reason;
use crate::error::ReconcileError;
use crate::platform::{InstanceAdmin, PlatformClient};
use crate::resource::{
    ClusterKey, DatabaseCluster, Instance, InstanceAnnotations, InstanceRole, LogPosition,
    TopologyMode,
};
use crate::topology::{TopologyOutcome, TopologyPhase};
use slog::{debug, info, warn, Logger};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One instance's observed replication state for this pass.
#[derive(Clone, Debug)]
pub struct ReplicaReport {
    pub ordinal: u32,
    pub running: bool,
    pub healthy: bool,

    /// Role currently annotated on the instance
    pub role: InstanceRole,

    /// Whether the admin channel answered this pass
    pub reachable: bool,

    /// Last applied transaction-log position, when queryable
    pub applied: Option<LogPosition>,

    /// Whether the instance currently accepts writes, when queryable
    pub writable: Option<bool>,
}

/// Decision output of the replication state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaAction {
    /// Enable writes and log exposure on the instance
    ConfigurePrimary { ordinal: u32 },

    /// Point the instance at `source` as its replication upstream
    ConfigureReplica { ordinal: u32, source: u32 },

    /// Record the primary role on the instance
    AnnotatePrimary { ordinal: u32 },

    /// Record the replica role on the instance
    AnnotateReplica { ordinal: u32 },

    /// Promote a caught-up replica to primary (failover)
    Promote { ordinal: u32 },

    /// Revoke writes on a returning former primary before it can fork the
    /// dataset
    Demote { ordinal: u32 },

    /// Planned primary change: quiesce `from`, wait for `to` to catch up to
    /// the fence position, promote `to`, demote and re-point `from`
    Switchover { from: u32, to: u32 },
}

/// Plan for one pass over a primary/replica cluster.
#[derive(Debug, Clone)]
pub struct ReplicaPlan {
    pub phase: TopologyPhase,
    pub actions: Vec<ReplicaAction>,
    pub ready: bool,
    pub reason: String,
    pub message: String,
    pub primary: Option<u32>,
}

impl ReplicaPlan {
    fn converging(phase: TopologyPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            actions: Vec::new(),
            ready: false,
            reason: reason::TOPOLOGY_NOT_READY.to_string(),
            message: message.into(),
            primary: None,
        }
    }
}

/// Pick the replica to promote: highest applied log position among
/// reachable replicas, exact ties broken by lowest ordinal.
pub fn select_promotion_candidate(
    reports: &[ReplicaReport],
    failed_primary: u32,
) -> Option<u32> {
    reports
        .iter()
        .filter(|r| r.ordinal != failed_primary && r.running && r.reachable)
        .filter_map(|r| r.applied.map(|pos| (pos, r.ordinal)))
        .max_by_key(|&(pos, ordinal)| (pos, Reverse(ordinal)))
        .map(|(_, ordinal)| ordinal)
}

/// Decide the phase and actions for a primary/replica cluster. Pure and
/// deterministic; the debounce counter is an input, not internal state.
pub fn plan(
    declared: u32,
    pinned: Option<u32>,
    reports: &[ReplicaReport],
    primary_probe_failures: u32,
    failover_threshold: u32,
) -> Result<ReplicaPlan, ReconcileError> {
    let annotated: Vec<&ReplicaReport> = reports
        .iter()
        .filter(|r| r.role == InstanceRole::Primary)
        .collect();
    if annotated.len() > 1 {
        let ordinals: Vec<u32> = annotated.iter().map(|r| r.ordinal).collect();
        return Err(ReconcileError::conflicting(format!(
            "instances {:?} are all annotated primary",
            ordinals
        )));
    }

    match annotated.first() {
        Some(primary) => plan_with_primary(
            primary,
            pinned,
            reports,
            primary_probe_failures,
            failover_threshold,
        ),
        None => plan_election(declared, pinned, reports),
    }
}

fn plan_with_primary(
    primary: &ReplicaReport,
    pinned: Option<u32>,
    reports: &[ReplicaReport],
    primary_probe_failures: u32,
    failover_threshold: u32,
) -> Result<ReplicaPlan, ReconcileError> {
    let p = primary.ordinal;
    let primary_up = primary.running && primary.healthy && primary.reachable;

    if !primary_up {
        if primary_probe_failures < failover_threshold {
            let mut plan = ReplicaPlan::converging(
                TopologyPhase::Replicating,
                format!(
                    "Primary {} failing probes ({}/{})",
                    p, primary_probe_failures, failover_threshold
                ),
            );
            plan.primary = Some(p);
            return Ok(plan);
        }

        // Debounce exhausted: promote the most caught-up replica. The old
        // primary is re-annotated now so its eventual return is handled as
        // an ordinary writable-replica demotion.
        let Some(candidate) = select_promotion_candidate(reports, p) else {
            let mut plan = ReplicaPlan::converging(
                TopologyPhase::FailingOver,
                "No reachable replica is eligible for promotion",
            );
            plan.primary = Some(p);
            return Ok(plan);
        };

        let mut actions = vec![
            ReplicaAction::Promote { ordinal: candidate },
            ReplicaAction::AnnotatePrimary { ordinal: candidate },
            ReplicaAction::AnnotateReplica { ordinal: p },
        ];
        for report in reports {
            if report.ordinal != p
                && report.ordinal != candidate
                && report.running
                && report.reachable
            {
                actions.push(ReplicaAction::ConfigureReplica {
                    ordinal: report.ordinal,
                    source: candidate,
                });
            }
        }
        return Ok(ReplicaPlan {
            phase: TopologyPhase::FailingOver,
            actions,
            ready: false,
            reason: reason::TOPOLOGY_NOT_READY.to_string(),
            message: format!("Failing over from {} to {}", p, candidate),
            primary: Some(candidate),
        });
    }

    // Planned switchover: the operator pinned a different healthy instance.
    if let Some(target) = pinned {
        if target != p {
            let viable = reports
                .iter()
                .any(|r| r.ordinal == target && r.running && r.reachable);
            if !viable {
                let mut plan = ReplicaPlan::converging(
                    TopologyPhase::Replicating,
                    format!("Waiting for pinned primary {} to become reachable", target),
                );
                plan.primary = Some(p);
                return Ok(plan);
            }
            let mut actions = vec![ReplicaAction::Switchover { from: p, to: target }];
            for report in reports {
                if report.ordinal != p
                    && report.ordinal != target
                    && report.running
                    && report.reachable
                {
                    actions.push(ReplicaAction::ConfigureReplica {
                        ordinal: report.ordinal,
                        source: target,
                    });
                }
            }
            return Ok(ReplicaPlan {
                phase: TopologyPhase::FailingOver,
                actions,
                ready: false,
                reason: reason::TOPOLOGY_NOT_READY.to_string(),
                message: format!("Switching primary from {} to {}", p, target),
                primary: Some(target),
            });
        }
    }

    // Steady state.
    let mut actions = Vec::new();
    for report in reports {
        if report.ordinal == p {
            continue;
        }
        // A writable non-primary is a returning former primary: revoke
        // writes before anything else can reach it.
        if report.writable == Some(true) {
            actions.push(ReplicaAction::Demote {
                ordinal: report.ordinal,
            });
            actions.push(ReplicaAction::ConfigureReplica {
                ordinal: report.ordinal,
                source: p,
            });
            continue;
        }
        if report.role == InstanceRole::Unassigned && report.running && report.reachable {
            actions.push(ReplicaAction::ConfigureReplica {
                ordinal: report.ordinal,
                source: p,
            });
            actions.push(ReplicaAction::AnnotateReplica {
                ordinal: report.ordinal,
            });
        }
    }

    let lagging: Vec<u32> = reports
        .iter()
        .filter(|r| r.ordinal != p && !(r.running && r.healthy && r.reachable))
        .map(|r| r.ordinal)
        .collect();

    if actions.is_empty() && lagging.is_empty() {
        return Ok(ReplicaPlan {
            phase: TopologyPhase::Replicating,
            actions,
            ready: true,
            reason: reason::HEALTHY.to_string(),
            message: format!("Primary {} serving, all replicas healthy", p),
            primary: Some(p),
        });
    }

    let message = if actions.is_empty() {
        format!("Replicas {:?} are not healthy", lagging)
    } else {
        format!("Converging replicas behind primary {}", p)
    };
    let mut plan = ReplicaPlan::converging(TopologyPhase::Replicating, message);
    plan.actions = actions;
    plan.primary = Some(p);
    Ok(plan)
}

fn plan_election(
    declared: u32,
    pinned: Option<u32>,
    reports: &[ReplicaReport],
) -> Result<ReplicaPlan, ReconcileError> {
    // A writable instance with no primary annotation is a primary whose
    // annotation was lost (controller crash mid-failover): adopt it rather
    // than electing a second writer.
    let writables: Vec<u32> = reports
        .iter()
        .filter(|r| r.writable == Some(true))
        .map(|r| r.ordinal)
        .collect();
    if writables.len() > 1 {
        return Err(ReconcileError::conflicting(format!(
            "instances {:?} all accept writes with no annotated primary",
            writables
        )));
    }

    // The very first election waits for the full declared instance set so
    // the default lowest-ordinal policy sees every contender.
    let fresh_cluster = writables.is_empty()
        && reports.iter().all(|r| r.role == InstanceRole::Unassigned);
    if fresh_cluster && (reports.len() as u32) < declared {
        return Ok(ReplicaPlan::converging(
            TopologyPhase::Electing,
            format!(
                "Waiting for {} declared instances ({} observed)",
                declared,
                reports.len()
            ),
        ));
    }

    let target = if let Some(&adopted) = writables.first() {
        adopted
    } else if let Some(t) = pinned {
        let viable = reports
            .iter()
            .any(|r| r.ordinal == t && r.running && r.reachable);
        if !viable {
            return Ok(ReplicaPlan::converging(
                TopologyPhase::Electing,
                format!("Waiting for pinned primary {} to become reachable", t),
            ));
        }
        t
    } else {
        let Some(lowest) = reports
            .iter()
            .filter(|r| r.running && r.reachable)
            .map(|r| r.ordinal)
            .min()
        else {
            return Ok(ReplicaPlan::converging(
                TopologyPhase::Electing,
                "No reachable instance to elect as primary",
            ));
        };
        lowest
    };

    let mut actions = Vec::new();
    if !writables.contains(&target) {
        actions.push(ReplicaAction::ConfigurePrimary { ordinal: target });
    }
    actions.push(ReplicaAction::AnnotatePrimary { ordinal: target });
    for report in reports {
        if report.ordinal != target
            && report.running
            && report.reachable
            && report.role == InstanceRole::Unassigned
        {
            actions.push(ReplicaAction::ConfigureReplica {
                ordinal: report.ordinal,
                source: target,
            });
            actions.push(ReplicaAction::AnnotateReplica {
                ordinal: report.ordinal,
            });
        }
    }

    Ok(ReplicaPlan {
        phase: TopologyPhase::Electing,
        actions,
        ready: false,
        reason: reason::TOPOLOGY_NOT_READY.to_string(),
        message: format!("Electing instance {} as primary", target),
        primary: Some(target),
    })
}

/// Executor for the primary/replica topology.
pub struct ReplicationStateMachine {
    platform: Arc<dyn PlatformClient>,
    admin: Arc<dyn InstanceAdmin>,
    failover_threshold: u32,
    /// Consecutive failed primary probes per cluster, process-local
    probe_failures: Mutex<HashMap<ClusterKey, u32>>,
    logger: Logger,
}

impl ReplicationStateMachine {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        admin: Arc<dyn InstanceAdmin>,
        failover_threshold: u32,
        logger: Logger,
    ) -> Self {
        Self {
            platform,
            admin,
            failover_threshold,
            probe_failures: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// One full topology pass over a cluster.
    pub async fn reconcile_cluster(
        &self,
        cluster: &DatabaseCluster,
        instances: &[Instance],
    ) -> Result<TopologyOutcome, ReconcileError> {
        let reports = self.collect_reports(instances).await;
        let failures = self.update_probe_failures(&cluster.key, &reports);

        let plan = plan(
            cluster.spec.replicas,
            cluster.spec.pinned_primary,
            &reports,
            failures,
            self.failover_threshold,
        )?;

        debug!(self.logger, "Replication plan computed";
            "cluster" => %cluster.key,
            "phase" => %plan.phase,
            "actions" => plan.actions.len()
        );

        self.apply(cluster, instances, &plan.actions).await?;

        if matches!(plan.phase, TopologyPhase::FailingOver | TopologyPhase::Electing)
            && !plan.actions.is_empty()
        {
            // A promotion or election happened this pass; the probe record
            // of the old primary no longer applies.
            self.probe_failures.lock().unwrap().remove(&cluster.key);
        }

        Ok(TopologyOutcome {
            phase: plan.phase,
            ready: plan.ready,
            reason: plan.reason,
            message: plan.message,
            members: Vec::new(),
            primary_ordinal: plan.primary,
        })
    }

    /// Instance-scoped handler: health transitions only log here; the
    /// decision is re-derived on the requeued resource pass.
    pub fn handle_instance_event(&self, key: &ClusterKey, ordinal: u32) {
        info!(self.logger, "Instance health changed";
            "cluster" => %key,
            "ordinal" => ordinal
        );
    }

    /// Drop the probe record of a deleted cluster.
    pub fn forget(&self, key: &ClusterKey) {
        self.probe_failures.lock().unwrap().remove(key);
    }

    async fn collect_reports(&self, instances: &[Instance]) -> Vec<ReplicaReport> {
        let mut reports = Vec::with_capacity(instances.len());
        for instance in instances {
            if !instance.running {
                reports.push(ReplicaReport {
                    ordinal: instance.ordinal,
                    running: false,
                    healthy: false,
                    role: instance.annotations.role,
                    reachable: false,
                    applied: None,
                    writable: None,
                });
                continue;
            }

            let applied = match self.admin.query_applied_position(instance).await {
                Ok(position) => Some(position),
                Err(e) => {
                    warn!(self.logger, "Failed to query applied position";
                        "ordinal" => instance.ordinal, "error" => %e);
                    None
                }
            };
            let writable = self.admin.query_writable(instance).await.ok();

            reports.push(ReplicaReport {
                ordinal: instance.ordinal,
                running: true,
                healthy: instance.healthy,
                role: instance.annotations.role,
                reachable: applied.is_some(),
                applied,
                writable,
            });
        }
        reports
    }

    /// Advance or reset the per-cluster probe counter and return the value
    /// the planner should see. Counted once per pass; instance events only
    /// requeue the resource, they never count on their own.
    fn update_probe_failures(&self, key: &ClusterKey, reports: &[ReplicaReport]) -> u32 {
        let primary_down = reports.iter().any(|r| {
            r.role == InstanceRole::Primary && !(r.running && r.healthy && r.reachable)
        });

        let mut counters = self.probe_failures.lock().unwrap();
        if primary_down {
            let count = counters.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        } else {
            counters.remove(key);
            0
        }
    }

    async fn apply(
        &self,
        cluster: &DatabaseCluster,
        instances: &[Instance],
        actions: &[ReplicaAction],
    ) -> Result<(), ReconcileError> {
        for action in actions {
            match action {
                ReplicaAction::ConfigurePrimary { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    let position = self.admin.configure_primary(instance).await?;
                    info!(self.logger, "Configured primary";
                        "cluster" => %cluster.key, "ordinal" => *ordinal, "position" => %position);
                }
                ReplicaAction::ConfigureReplica { ordinal, source } => {
                    let instance = find_instance(instances, *ordinal)?;
                    let upstream = find_instance(instances, *source)?;
                    // A fresh joiner starts from the primary's current log
                    // position, not its own.
                    let start = self.admin.query_applied_position(upstream).await?;
                    self.admin
                        .configure_replica(instance, &upstream.address, start)
                        .await?;
                }
                ReplicaAction::AnnotatePrimary { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    self.ensure_annotations(&cluster.key, instance, InstanceRole::Primary)
                        .await?;
                }
                ReplicaAction::AnnotateReplica { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    self.ensure_annotations(&cluster.key, instance, InstanceRole::Replica)
                        .await?;
                }
                ReplicaAction::Promote { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    let position = self.admin.promote(instance).await?;
                    info!(self.logger, "Promoted replica";
                        "cluster" => %cluster.key, "ordinal" => *ordinal, "position" => %position);
                }
                ReplicaAction::Demote { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    info!(self.logger, "Demoting returning former primary";
                        "cluster" => %cluster.key, "ordinal" => *ordinal);
                    self.admin.demote(instance).await?;
                }
                ReplicaAction::Switchover { from, to } => {
                    self.switchover(cluster, instances, *from, *to).await?;
                }
            }
        }
        Ok(())
    }

    /// Planned switchover: quiesce the old primary, verify the target has
    /// applied everything up to the fence position, promote, demote, and
    /// re-point the old primary as a replica.
    async fn switchover(
        &self,
        cluster: &DatabaseCluster,
        instances: &[Instance],
        from: u32,
        to: u32,
    ) -> Result<(), ReconcileError> {
        let old = find_instance(instances, from)?;
        let new = find_instance(instances, to)?;

        let fence = self.admin.quiesce(old).await?;
        let caught_up = self.admin.query_applied_position(new).await?;
        if caught_up < fence {
            // Old primary stays quiesced; the retried pass re-plans the same
            // switchover and checks again.
            return Err(ReconcileError::transient(format!(
                "switchover target {} at {} has not reached fence {}",
                to, caught_up, fence
            )));
        }

        self.admin.promote(new).await?;
        self.admin.demote(old).await?;
        self.admin
            .configure_replica(old, &new.address, fence)
            .await?;
        self.ensure_annotations(&cluster.key, new, InstanceRole::Primary)
            .await?;
        self.ensure_annotations(&cluster.key, old, InstanceRole::Replica)
            .await?;

        info!(self.logger, "Switchover complete";
            "cluster" => %cluster.key, "from" => from, "to" => to, "fence" => %fence);
        Ok(())
    }

    async fn ensure_annotations(
        &self,
        key: &ClusterKey,
        instance: &Instance,
        role: InstanceRole,
    ) -> Result<(), ReconcileError> {
        let desired = InstanceAnnotations {
            owner: Some(key.clone()),
            role,
            topology: Some(TopologyMode::PrimaryReplica),
            bootstrap_seed: false,
        };
        if instance.annotations == desired {
            return Ok(());
        }
        self.platform
            .annotate_instance(key, instance.ordinal, desired)
            .await?;
        Ok(())
    }
}

fn find_instance(instances: &[Instance], ordinal: u32) -> Result<&Instance, ReconcileError> {
    instances
        .iter()
        .find(|i| i.ordinal == ordinal)
        .ok_or_else(|| {
            ReconcileError::internal(format!("planned action for unknown instance {}", ordinal))
        })
}
