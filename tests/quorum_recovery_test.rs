//! End-to-end quorum topology scenarios: bootstrap, partition recovery,
//! seed re-election, and the data-loss halt.

use choral::conditions::{find_condition, ConditionType};
use choral::engine::ClusterReconciler;
use choral::platform::{
    DependentReconciler, InMemoryPlatform, InstanceAdmin, NoopDependent, PlatformClient,
    StaticDiscovery,
};
use choral::registry::InstanceRegistry;
use choral::topology::{QuorumStateMachine, ReplicationStateMachine};
use choral::{ClusterKey, ClusterSpec, OperatorConfig, TopologyMode};
use slog::{o, Logger};
use std::sync::{Arc, Mutex};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn reconciler_for(platform: &InMemoryPlatform) -> ClusterReconciler {
    let client: Arc<dyn PlatformClient> = Arc::new(platform.clone());
    let admin: Arc<dyn InstanceAdmin> = Arc::new(platform.admin());
    let quorum = Arc::new(QuorumStateMachine::new(
        client.clone(),
        admin.clone(),
        test_logger(),
    ));
    let replica = Arc::new(ReplicationStateMachine::new(
        client.clone(),
        admin,
        3,
        test_logger(),
    ));
    let dependents: Vec<Arc<dyn DependentReconciler>> =
        vec![Arc::new(NoopDependent::new("compute"))];
    ClusterReconciler::new(
        client,
        dependents,
        Arc::new(StaticDiscovery { monitoring: false }),
        quorum,
        replica,
        Arc::new(Mutex::new(InstanceRegistry::new())),
        OperatorConfig::default(),
        test_logger(),
    )
}

fn quorum_cluster(platform: &InMemoryPlatform, name: &str) -> ClusterKey {
    let key = ClusterKey::new(name);
    platform.add_cluster(key.clone(), ClusterSpec::new(3, TopologyMode::MultiMaster));
    key
}

async fn converge(reconciler: &ClusterReconciler, key: &ClusterKey, passes: usize) {
    for _ in 0..passes {
        reconciler.reconcile(key).await.unwrap();
    }
}

#[tokio::test]
async fn test_three_node_bootstrap() {
    let platform = InMemoryPlatform::new();
    let key = quorum_cluster(&platform, "db");
    let reconciler = reconciler_for(&platform);

    println!("Pass 1: bootstrap seed and serial joins");
    reconciler.reconcile(&key).await.unwrap();
    let actions = platform.take_actions();
    assert_eq!(
        actions,
        vec![
            "bootstrap-seed 0".to_string(),
            "join 1 <- seed 0".to_string(),
            "join 2 <- seed 0".to_string(),
        ]
    );

    println!("Pass 2: observe the clustered state");
    reconciler.reconcile(&key).await.unwrap();
    let status = platform.status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Clustered"));
    assert_eq!(status.members, vec![0, 1, 2]);
    assert_eq!(status.topology, Some(TopologyMode::MultiMaster));
    let ready = find_condition(&status.conditions, ConditionType::Ready).unwrap();
    assert!(ready.status);

    // Once clustered the bootstrap seed flag is cleared everywhere.
    for ordinal in 0..3 {
        let annotations = platform.instance_annotations(&key, ordinal).unwrap();
        assert!(!annotations.bootstrap_seed);
        assert_eq!(annotations.owner, Some(key.clone()));
    }
}

#[tokio::test]
async fn test_converged_cluster_is_a_fixed_point() {
    let platform = InMemoryPlatform::new();
    let key = quorum_cluster(&platform, "db");
    let reconciler = reconciler_for(&platform);

    converge(&reconciler, &key, 2).await;
    platform.take_actions();

    println!("Repeated passes against a converged cluster issue no commands");
    converge(&reconciler, &key, 3).await;
    assert!(platform.take_actions().is_empty());
}

#[tokio::test]
async fn test_partition_with_quorum_recovers_without_reelection() {
    let platform = InMemoryPlatform::new();
    let key = quorum_cluster(&platform, "db");
    let reconciler = reconciler_for(&platform);

    converge(&reconciler, &key, 2).await;
    platform.take_actions();

    println!("Partition: {{0,1}} keeps quorum, {{2}} is isolated");
    platform.partition(&key, &[&[0, 1], &[2]]);

    reconciler.reconcile(&key).await.unwrap();
    let actions = platform.take_actions();
    // The surviving component never re-elects a seed; the straggler is
    // simply rejoined with the lowest component member as donor.
    assert_eq!(actions, vec!["join 2 <- seed 0".to_string()]);

    reconciler.reconcile(&key).await.unwrap();
    let status = platform.status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Clustered"));
    assert_eq!(status.members, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_quorumless_fragmentation_reelects_most_advanced_seed() {
    let platform = InMemoryPlatform::new();
    let key = quorum_cluster(&platform, "db");
    let reconciler = reconciler_for(&platform);

    converge(&reconciler, &key, 2).await;
    platform.take_actions();

    println!("Full fragmentation with instance 1 holding the newest data");
    platform.partition(&key, &[&[0], &[1], &[2]]);
    platform.set_commit_seqno(&key, 0, Some(90));
    platform.set_commit_seqno(&key, 1, Some(120));
    platform.set_commit_seqno(&key, 2, Some(80));

    reconciler.reconcile(&key).await.unwrap();
    let actions = platform.take_actions();
    assert_eq!(
        actions,
        vec![
            "bootstrap-seed 1".to_string(),
            "join 0 <- seed 1".to_string(),
            "join 2 <- seed 1".to_string(),
        ]
    );

    reconciler.reconcile(&key).await.unwrap();
    let status = platform.status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Clustered"));
    assert_eq!(status.members, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_total_data_loss_halts_the_cluster() {
    let platform = InMemoryPlatform::new();
    let key = quorum_cluster(&platform, "db");
    let reconciler = reconciler_for(&platform);

    converge(&reconciler, &key, 2).await;
    platform.take_actions();

    println!("No instance retains a usable commit marker");
    platform.partition(&key, &[&[0], &[1], &[2]]);
    for ordinal in 0..3 {
        platform.set_commit_seqno(&key, ordinal, None);
    }

    reconciler.reconcile(&key).await.unwrap();
    // No seed is guessed, no command is issued.
    assert!(platform.take_actions().is_empty());

    let status = platform.status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Halted"));
    let ready = find_condition(&status.conditions, ConditionType::Ready).unwrap();
    assert!(!ready.status);
    assert_eq!(ready.reason, "DataLossDetected");
}
