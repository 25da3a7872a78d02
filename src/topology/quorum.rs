//! Quorum/multi-master topology state machine
//!
//! Drives a quorum-certified multi-master cluster through bootstrap,
//! steady state, and recovery. The decision core is pure: it takes the
//! per-instance membership reports gathered this pass (the recovery record)
//! and returns an action list. The executor applies actions strictly in
//! order: joining instances are processed serially, waiting for each state
//! transfer to complete before admitting the next, which bounds the blast
//! radius of a bad donor and avoids saturating the seed with concurrent
//! full transfers.
//!
//! Data safety rule: a bootstrap seed is only ever re-elected when every
//! declared instance is reporting and at least one carries a usable commit
//! marker. If no usable marker exists anywhere, progress halts behind a
//! persistent condition instead of guessing a seed and committing to a
//! stale dataset.

use crate::conditions::reason;
use crate::error::ReconcileError;
use crate::platform::{InstanceAdmin, MembershipView, PlatformClient};
use crate::resource::{
    ClusterKey, DatabaseCluster, Instance, InstanceAnnotations, InstanceRole, TopologyMode,
};
use crate::topology::{TopologyOutcome, TopologyPhase};
use slog::{debug, info, warn, Logger};
use std::cmp::Reverse;
use std::sync::Arc;

/// One row of the recovery record: a single instance's reported state.
///
/// Derived fresh each pass from the admin channel; never persisted.
#[derive(Clone, Debug)]
pub struct InstanceReport {
    pub ordinal: u32,
    pub running: bool,

    /// Local membership view; None when the instance could not be queried
    pub view: Option<MembershipView>,

    /// Committed-transaction marker; None when unreachable or unusable
    pub seqno: Option<u64>,
}

impl InstanceReport {
    /// A fresh instance has never been part of any cluster: reachable, no
    /// membership, no history.
    fn is_fresh(&self) -> bool {
        self.running
            && self.seqno == Some(0)
            && self
                .view
                .as_ref()
                .map(|v| !v.member && v.component.is_empty())
                .unwrap_or(false)
    }
}

/// Decision output of the quorum state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumAction {
    /// Mark the instance as the active bootstrap seed (clearing any other)
    AnnotateSeed { ordinal: u32 },

    /// Mark the instance as a joiner (not the seed)
    AnnotateJoiner { ordinal: u32 },

    /// Initialize the instance as a fresh single-node cluster
    Bootstrap { ordinal: u32 },

    /// Join the instance to the component containing `donor`, waiting for
    /// state transfer to complete
    Join { ordinal: u32, donor: u32 },
}

/// Plan for one pass: derived phase plus the actions to reach it.
#[derive(Debug, Clone)]
pub struct QuorumPlan {
    pub phase: TopologyPhase,
    pub actions: Vec<QuorumAction>,
    pub ready: bool,
    pub reason: String,
    pub message: String,
    pub members: Vec<u32>,
}

impl QuorumPlan {
    fn converging(phase: TopologyPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            actions: Vec::new(),
            ready: false,
            reason: reason::TOPOLOGY_NOT_READY.to_string(),
            message: message.into(),
            members: Vec::new(),
        }
    }
}

/// Distinct membership components among reporting member instances.
///
/// A component is identified by the (sorted) set of ordinals its members
/// report seeing. Overlapping but unequal views are ambiguous and surface
/// as a conflicting observation rather than being resolved by guesswork.
fn components(reports: &[InstanceReport]) -> Result<Vec<Vec<u32>>, ReconcileError> {
    let mut comps: Vec<Vec<u32>> = Vec::new();

    for report in reports {
        let Some(view) = &report.view else { continue };
        if !view.member {
            continue;
        }

        let mut set = view.component.clone();
        set.sort_unstable();
        set.dedup();

        if !set.contains(&report.ordinal) {
            return Err(ReconcileError::conflicting(format!(
                "instance {} reports a component that does not contain itself",
                report.ordinal
            )));
        }

        if comps.iter().any(|c| c == &set) {
            continue;
        }
        for existing in &comps {
            if existing.iter().any(|o| set.contains(o)) {
                return Err(ReconcileError::conflicting(format!(
                    "overlapping membership views: {:?} vs {:?}",
                    existing, set
                )));
            }
        }
        comps.push(set);
    }

    Ok(comps)
}

/// Select the bootstrap seed for a full recovery: highest commit marker
/// wins, exact ties broken by lowest ordinal for determinism.
pub fn select_recovery_seed(reports: &[InstanceReport]) -> Option<u32> {
    reports
        .iter()
        .filter_map(|r| r.seqno.map(|seqno| (seqno, r.ordinal)))
        .max_by_key(|&(seqno, ordinal)| (seqno, Reverse(ordinal)))
        .map(|(_, ordinal)| ordinal)
}

/// Decide the phase and actions for a quorum cluster from this pass's
/// recovery record. Pure and deterministic.
pub fn plan(declared: u32, reports: &[InstanceReport]) -> Result<QuorumPlan, ReconcileError> {
    let comps = components(reports)?;

    let quorum_comps: Vec<&Vec<u32>> = comps
        .iter()
        .filter(|c| c.len() as u32 * 2 > declared)
        .collect();
    if quorum_comps.len() > 1 {
        return Err(ReconcileError::conflicting(
            "multiple components claim quorum",
        ));
    }

    if let Some(quorum) = quorum_comps.first() {
        let quorum: Vec<u32> = (*quorum).clone();
        let synced = reports
            .iter()
            .filter(|r| quorum.contains(&r.ordinal))
            .all(|r| r.view.as_ref().map(|v| v.synced).unwrap_or(false));

        let stragglers: Vec<u32> = (0..declared).filter(|o| !quorum.contains(o)).collect();

        if stragglers.is_empty() && synced {
            return Ok(QuorumPlan {
                phase: TopologyPhase::Clustered,
                actions: Vec::new(),
                ready: true,
                reason: reason::HEALTHY.to_string(),
                message: "All instances are members of one quorum component".to_string(),
                members: quorum,
            });
        }

        if !synced {
            let mut plan = QuorumPlan::converging(
                TopologyPhase::Recovering,
                "State transfer in progress within the quorum component",
            );
            plan.members = quorum;
            return Ok(plan);
        }

        // A quorum component survived; no seed re-election is needed. Rejoin
        // stragglers serially, lowest ordinal of the component as donor.
        let Some(donor) = quorum.iter().copied().min() else {
            return Err(ReconcileError::internal("empty quorum component"));
        };
        let mut actions = Vec::new();
        for ordinal in &stragglers {
            let reachable = reports
                .iter()
                .any(|r| r.ordinal == *ordinal && r.running && r.view.is_some());
            if reachable {
                actions.push(QuorumAction::AnnotateJoiner { ordinal: *ordinal });
                actions.push(QuorumAction::Join {
                    ordinal: *ordinal,
                    donor,
                });
            }
        }
        let message = if actions.is_empty() {
            format!("Waiting for instances {:?} to become reachable", stragglers)
        } else {
            format!("Rejoining instances {:?} to the quorum component", stragglers)
        };
        let mut plan = QuorumPlan::converging(TopologyPhase::Recovering, message);
        plan.actions = actions;
        plan.members = quorum;
        return Ok(plan);
    }

    // No quorum component anywhere.
    let all_exist = reports.len() as u32 == declared && reports.iter().all(|r| r.running);
    let all_fresh = !reports.is_empty() && reports.iter().all(|r| r.is_fresh());

    if all_fresh {
        if !all_exist {
            return Ok(QuorumPlan::converging(
                TopologyPhase::Uninitialized,
                format!(
                    "Waiting for {} declared instances ({} observed)",
                    declared,
                    reports.len()
                ),
            ));
        }

        // First bootstrap: instance 0 seeds a new cluster, the rest join it
        // one at a time.
        let mut actions = vec![
            QuorumAction::AnnotateSeed { ordinal: 0 },
            QuorumAction::Bootstrap { ordinal: 0 },
        ];
        for ordinal in 1..declared {
            actions.push(QuorumAction::AnnotateJoiner { ordinal });
            actions.push(QuorumAction::Join { ordinal, donor: 0 });
        }
        let mut plan =
            QuorumPlan::converging(TopologyPhase::Bootstrapping, "Bootstrapping a new cluster");
        plan.actions = actions;
        return Ok(plan);
    }

    if reports.is_empty() {
        return Ok(QuorumPlan::converging(
            TopologyPhase::Uninitialized,
            format!("Waiting for {} declared instances", declared),
        ));
    }

    // Prior state exists but no component has quorum: full recovery with
    // seed re-election. Only safe once every declared instance reports.
    let all_reporting = all_exist && reports.iter().all(|r| r.view.is_some());
    if !all_reporting {
        return Ok(QuorumPlan::converging(
            TopologyPhase::Recovering,
            "Waiting for all instances to report before selecting a recovery seed",
        ));
    }

    let Some(seed) = select_recovery_seed(reports) else {
        // Total data loss signal: no instance has a usable commit marker.
        // Halting is deliberate; committing to an arbitrary seed could pin
        // the cluster to a stale dataset.
        return Ok(QuorumPlan {
            phase: TopologyPhase::Halted,
            actions: Vec::new(),
            ready: false,
            reason: reason::DATA_LOSS.to_string(),
            message: "No instance reports a usable commit marker; operator action required"
                .to_string(),
            members: Vec::new(),
        });
    };

    let mut actions = vec![
        QuorumAction::AnnotateSeed { ordinal: seed },
        QuorumAction::Bootstrap { ordinal: seed },
    ];
    for ordinal in (0..declared).filter(|o| *o != seed) {
        actions.push(QuorumAction::AnnotateJoiner { ordinal });
        actions.push(QuorumAction::Join {
            ordinal,
            donor: seed,
        });
    }
    let mut plan = QuorumPlan::converging(
        TopologyPhase::Recovering,
        format!("Re-bootstrapping from instance {} (most advanced commit marker)", seed),
    );
    plan.actions = actions;
    Ok(plan)
}

/// Executor for the quorum topology: gathers reports, plans, and applies
/// actions against the platform and the fleet.
pub struct QuorumStateMachine {
    platform: Arc<dyn PlatformClient>,
    admin: Arc<dyn InstanceAdmin>,
    logger: Logger,
}

impl QuorumStateMachine {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        admin: Arc<dyn InstanceAdmin>,
        logger: Logger,
    ) -> Self {
        Self {
            platform,
            admin,
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
        let plan = plan(cluster.spec.replicas, &reports)?;

        debug!(self.logger, "Quorum plan computed";
            "cluster" => %cluster.key,
            "phase" => %plan.phase,
            "actions" => plan.actions.len()
        );

        self.apply(cluster, instances, &plan.actions).await?;

        if plan.phase == TopologyPhase::Clustered {
            // Once clustered there is no active seed; clear stale markers so
            // at most one instance ever carries the flag.
            for instance in instances {
                self.ensure_annotations(&cluster.key, instance, false).await?;
            }
        }

        Ok(TopologyOutcome {
            phase: plan.phase,
            ready: plan.ready,
            reason: plan.reason,
            message: plan.message,
            members: plan.members,
            primary_ordinal: None,
        })
    }

    /// Instance-scoped handler: membership changes only trigger logging
    /// here; the actual decision is re-derived on the requeued resource
    /// pass.
    pub fn handle_instance_event(&self, key: &ClusterKey, ordinal: u32) {
        info!(self.logger, "Instance membership changed";
            "cluster" => %key,
            "ordinal" => ordinal
        );
    }

    async fn collect_reports(&self, instances: &[Instance]) -> Vec<InstanceReport> {
        let mut reports = Vec::with_capacity(instances.len());
        for instance in instances {
            if !instance.running {
                reports.push(InstanceReport {
                    ordinal: instance.ordinal,
                    running: false,
                    view: None,
                    seqno: None,
                });
                continue;
            }

            let view = match self.admin.query_membership(instance).await {
                Ok(view) => Some(view),
                Err(e) => {
                    warn!(self.logger, "Failed to query membership";
                        "ordinal" => instance.ordinal, "error" => %e);
                    None
                }
            };
            let seqno = match self.admin.query_commit_seqno(instance).await {
                Ok(seqno) => seqno,
                Err(_) => None,
            };

            reports.push(InstanceReport {
                ordinal: instance.ordinal,
                running: true,
                view,
                seqno,
            });
        }
        reports
    }

    /// Apply planned actions strictly in order. Any failure aborts the pass;
    /// the whole reconciliation is retried rather than partially committed.
    async fn apply(
        &self,
        cluster: &DatabaseCluster,
        instances: &[Instance],
        actions: &[QuorumAction],
    ) -> Result<(), ReconcileError> {
        for action in actions {
            match action {
                QuorumAction::AnnotateSeed { ordinal } => {
                    for other in instances.iter().filter(|i| i.ordinal != *ordinal) {
                        if other.annotations.bootstrap_seed {
                            self.ensure_annotations(&cluster.key, other, false).await?;
                        }
                    }
                    let instance = find_instance(instances, *ordinal)?;
                    self.ensure_annotations(&cluster.key, instance, true).await?;
                }
                QuorumAction::AnnotateJoiner { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    self.ensure_annotations(&cluster.key, instance, false).await?;
                }
                QuorumAction::Bootstrap { ordinal } => {
                    let instance = find_instance(instances, *ordinal)?;
                    info!(self.logger, "Bootstrapping seed";
                        "cluster" => %cluster.key, "ordinal" => *ordinal);
                    self.admin.bootstrap_seed(instance).await?;
                }
                QuorumAction::Join { ordinal, donor } => {
                    let instance = find_instance(instances, *ordinal)?;
                    let donor_instance = find_instance(instances, *donor)?;
                    info!(self.logger, "Joining instance";
                        "cluster" => %cluster.key, "ordinal" => *ordinal, "donor" => *donor);
                    self.admin
                        .join_cluster(instance, &donor_instance.address)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Write the quorum annotation set, skipping the write when the content
    /// is already identical.
    async fn ensure_annotations(
        &self,
        key: &ClusterKey,
        instance: &Instance,
        bootstrap_seed: bool,
    ) -> Result<(), ReconcileError> {
        let desired = InstanceAnnotations {
            owner: Some(key.clone()),
            role: InstanceRole::Unassigned,
            topology: Some(TopologyMode::MultiMaster),
            bootstrap_seed,
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
        .ok_or_else(|| ReconcileError::internal(format!("planned action for unknown instance {}", ordinal)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_report(ordinal: u32) -> InstanceReport {
        InstanceReport {
            ordinal,
            running: true,
            view: Some(MembershipView::fresh()),
            seqno: Some(0),
        }
    }

    fn member_report(ordinal: u32, component: Vec<u32>, seqno: u64) -> InstanceReport {
        InstanceReport {
            ordinal,
            running: true,
            view: Some(MembershipView {
                member: true,
                component,
                synced: true,
            }),
            seqno: Some(seqno),
        }
    }

    fn solo_report(ordinal: u32, seqno: Option<u64>) -> InstanceReport {
        InstanceReport {
            ordinal,
            running: true,
            view: Some(MembershipView {
                member: false,
                component: vec![ordinal],
                synced: false,
            }),
            seqno,
        }
    }

    // === Bootstrap ===

    #[test]
    fn test_fresh_cluster_bootstraps_from_instance_zero() {
        let reports = vec![fresh_report(0), fresh_report(1), fresh_report(2)];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Bootstrapping);
        assert_eq!(
            plan.actions,
            vec![
                QuorumAction::AnnotateSeed { ordinal: 0 },
                QuorumAction::Bootstrap { ordinal: 0 },
                QuorumAction::AnnotateJoiner { ordinal: 1 },
                QuorumAction::Join { ordinal: 1, donor: 0 },
                QuorumAction::AnnotateJoiner { ordinal: 2 },
                QuorumAction::Join { ordinal: 2, donor: 0 },
            ]
        );
    }

    #[test]
    fn test_waits_while_declared_instances_missing() {
        let reports = vec![fresh_report(0), fresh_report(1)];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Uninitialized);
        assert!(plan.actions.is_empty());
    }

    // === Steady state ===

    #[test]
    fn test_single_quorum_component_is_clustered() {
        let reports = vec![
            member_report(0, vec![0, 1, 2], 50),
            member_report(1, vec![0, 1, 2], 50),
            member_report(2, vec![0, 1, 2], 50),
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Clustered);
        assert!(plan.ready);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.members, vec![0, 1, 2]);
    }

    #[test]
    fn test_clustered_plan_is_a_fixed_point() {
        let reports = vec![
            member_report(0, vec![0, 1, 2], 50),
            member_report(1, vec![0, 1, 2], 50),
            member_report(2, vec![0, 1, 2], 50),
        ];
        // Re-planning with no intervening event yields no new actions.
        for _ in 0..3 {
            let plan = plan(3, &reports).unwrap();
            assert!(plan.actions.is_empty());
        }
    }

    // === Partition with surviving quorum ===

    #[test]
    fn test_partition_with_quorum_rejoins_straggler_without_reelection() {
        let reports = vec![
            member_report(0, vec![0, 1], 80),
            member_report(1, vec![0, 1], 80),
            solo_report(2, Some(75)),
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Recovering);
        // Seed chosen from the quorum component: no Bootstrap action at all.
        assert_eq!(
            plan.actions,
            vec![
                QuorumAction::AnnotateJoiner { ordinal: 2 },
                QuorumAction::Join { ordinal: 2, donor: 0 },
            ]
        );
        assert_eq!(plan.members, vec![0, 1]);
    }

    #[test]
    fn test_unreachable_straggler_waits() {
        let reports = vec![
            member_report(0, vec![0, 1], 80),
            member_report(1, vec![0, 1], 80),
            InstanceReport {
                ordinal: 2,
                running: false,
                view: None,
                seqno: None,
            },
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Recovering);
        assert!(plan.actions.is_empty());
    }

    // === Full recovery ===

    #[test]
    fn test_quorumless_fragmentation_reelects_most_advanced_seed() {
        let reports = vec![
            solo_report(0, Some(90)),
            solo_report(1, Some(120)),
            solo_report(2, Some(80)),
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Recovering);
        assert_eq!(plan.actions[0], QuorumAction::AnnotateSeed { ordinal: 1 });
        assert_eq!(plan.actions[1], QuorumAction::Bootstrap { ordinal: 1 });
        // Remaining instances rejoin serially, in ordinal order.
        assert_eq!(
            &plan.actions[2..],
            &[
                QuorumAction::AnnotateJoiner { ordinal: 0 },
                QuorumAction::Join { ordinal: 0, donor: 1 },
                QuorumAction::AnnotateJoiner { ordinal: 2 },
                QuorumAction::Join { ordinal: 2, donor: 1 },
            ]
        );
    }

    #[test]
    fn test_seed_tie_breaks_to_lowest_ordinal() {
        let reports = vec![
            solo_report(2, Some(100)),
            solo_report(0, Some(100)),
            solo_report(1, Some(95)),
        ];
        assert_eq!(select_recovery_seed(&reports), Some(0));
    }

    #[test]
    fn test_seed_selection_is_order_independent() {
        let base = vec![
            solo_report(0, Some(100)),
            solo_report(1, Some(100)),
            solo_report(2, Some(80)),
        ];
        // Every input ordering must produce the same seed.
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![0, 2, 1],
            vec![1, 0, 2],
            vec![1, 2, 0],
            vec![2, 0, 1],
            vec![2, 1, 0],
        ];
        for order in orders {
            let shuffled: Vec<InstanceReport> =
                order.iter().map(|&i| base[i].clone()).collect();
            assert_eq!(select_recovery_seed(&shuffled), Some(0));
        }
    }

    #[test]
    fn test_recovery_waits_for_all_instances_to_report() {
        let reports = vec![
            solo_report(0, Some(90)),
            solo_report(1, Some(120)),
            InstanceReport {
                ordinal: 2,
                running: true,
                view: None,
                seqno: None,
            },
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Recovering);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn test_total_data_loss_halts_without_guessing() {
        let reports = vec![
            solo_report(0, None),
            solo_report(1, None),
            solo_report(2, None),
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Halted);
        assert_eq!(plan.reason, reason::DATA_LOSS);
        assert!(plan.actions.is_empty());
    }

    // === Conflicting observations ===

    #[test]
    fn test_overlapping_views_are_a_conflict() {
        let reports = vec![
            member_report(0, vec![0, 1], 50),
            member_report(1, vec![1, 2], 50),
            member_report(2, vec![1, 2], 50),
        ];
        let err = plan(3, &reports).unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictingObservation { .. }));
    }

    #[test]
    fn test_view_excluding_self_is_a_conflict() {
        let reports = vec![member_report(0, vec![1, 2], 50)];
        let err = plan(3, &reports).unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictingObservation { .. }));
    }

    // === Sync gating ===

    #[test]
    fn test_unsynced_member_keeps_cluster_recovering() {
        let unsynced = InstanceReport {
            ordinal: 2,
            running: true,
            view: Some(MembershipView {
                member: true,
                component: vec![0, 1, 2],
                synced: false,
            }),
            seqno: Some(50),
        };
        let reports = vec![
            member_report(0, vec![0, 1, 2], 50),
            member_report(1, vec![0, 1, 2], 50),
            unsynced,
        ];
        let plan = plan(3, &reports).unwrap();

        assert_eq!(plan.phase, TopologyPhase::Recovering);
        assert!(plan.actions.is_empty());
    }
}
