//! Reconciliation engine
//!
//! A fixed pool of workers drains the keyed work queue and runs one
//! reconciliation pass per dequeued cluster. Passes for distinct clusters
//! run concurrently; passes for the same cluster are serialized by the
//! queue. Transient failures re-enqueue the key with exponential back-off,
//! reset on the first successful pass.

pub mod queue;
pub mod reconciler;

pub use queue::WorkQueue;
pub use reconciler::{ClusterReconciler, Requeue, MONITORING_DEPENDENT};

use crate::config::OperatorConfig;
use crate::resource::ClusterKey;
use slog::{debug, error, warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub struct ReconcileEngine {
    queue: Arc<WorkQueue>,
    reconciler: Arc<ClusterReconciler>,
    config: OperatorConfig,
    /// Consecutive transient failures per key, for the back-off schedule
    attempts: Mutex<HashMap<ClusterKey, u32>>,
    logger: Logger,
}

impl ReconcileEngine {
    pub fn new(
        queue: Arc<WorkQueue>,
        reconciler: Arc<ClusterReconciler>,
        config: OperatorConfig,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            reconciler,
            config,
            attempts: Mutex::new(HashMap::new()),
            logger,
        })
    }

    /// Spawn the worker pool. The handles complete once the queue shuts
    /// down and drains.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.worker_loop(worker).await })
            })
            .collect()
    }

    pub fn enqueue(&self, key: ClusterKey) {
        self.queue.add(key);
    }

    pub fn shutdown(&self) {
        self.queue.shut_down();
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(self.logger, "Worker started"; "worker" => worker);
        while let Some(key) = self.queue.next().await {
            let result = self.reconciler.reconcile(&key).await;
            self.queue.done(&key);

            match result {
                Ok(Requeue::After(delay)) => {
                    self.attempts.lock().unwrap().remove(&key);
                    self.queue.add_after(key, delay);
                }
                Ok(Requeue::None) => {
                    self.attempts.lock().unwrap().remove(&key);
                }
                Err(e) if e.is_transient() => {
                    let attempt = {
                        let mut attempts = self.attempts.lock().unwrap();
                        let count = attempts.entry(key.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let delay = self.config.backoff_for(attempt - 1);
                    warn!(self.logger, "Pass failed, backing off";
                        "cluster" => %key, "attempt" => attempt,
                        "delay_ms" => delay.as_millis() as u64, "error" => %e);
                    self.queue.add_after(key, delay);
                }
                Err(e) => {
                    // Non-transient, non-condition errors abort the pass
                    // only; the resource stays on the slow fallback schedule
                    // and the process keeps serving other clusters.
                    error!(self.logger, "Pass aborted";
                        "cluster" => %key, "error" => %e);
                    self.attempts.lock().unwrap().remove(&key);
                    self.queue.add_after(key, self.config.backoff_cap);
                }
            }
        }
        debug!(self.logger, "Worker stopped"; "worker" => worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{find_condition, ConditionType};
    use crate::platform::{
        DependentReconciler, InMemoryPlatform, InstanceAdmin, NoopDependent, PlatformClient,
        StaticDiscovery,
    };
    use crate::error::ReconcileError;
    use crate::registry::InstanceRegistry;
    use crate::resource::{ClusterSpec, DatabaseCluster, TopologyMode};
    use crate::topology::{QuorumStateMachine, ReplicationStateMachine};
    use std::time::Duration;

    /// Fails with an internal error a fixed number of times, then converges.
    struct GlitchingDependent {
        remaining: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl DependentReconciler for GlitchingDependent {
        fn name(&self) -> &str {
            "compute"
        }

        async fn ensure(&self, _cluster: &DatabaseCluster) -> Result<(), ReconcileError> {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReconcileError::internal("compute state corrupted"));
            }
            Ok(())
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn engine_for(
        platform: &InMemoryPlatform,
        dependents: Vec<Arc<dyn DependentReconciler>>,
    ) -> Arc<ReconcileEngine> {
        let config = OperatorConfig::default()
            .with_workers(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
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
            config.failover_probe_threshold,
            test_logger(),
        ));
        let reconciler = Arc::new(ClusterReconciler::new(
            client,
            dependents,
            Arc::new(StaticDiscovery { monitoring: false }),
            quorum,
            replica,
            Arc::new(Mutex::new(InstanceRegistry::new())),
            config.clone(),
            test_logger(),
        ));
        ReconcileEngine::new(WorkQueue::new(), reconciler, config, test_logger())
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_converges_a_cluster() {
        let platform = InMemoryPlatform::new();
        let key = ClusterKey::new("db");
        platform.add_cluster(key.clone(), ClusterSpec::new(3, TopologyMode::MultiMaster));

        let engine = engine_for(&platform, vec![Arc::new(NoopDependent::new("compute"))]);
        let handles = engine.start();
        engine.enqueue(key.clone());

        // Two requeue intervals cover bootstrap plus observation.
        tokio::time::sleep(Duration::from_secs(90)).await;

        let status = platform.status(&key).unwrap();
        assert_eq!(status.phase.as_deref(), Some("Clustered"));
        let ready = find_condition(&status.conditions, ConditionType::Ready).unwrap();
        assert!(ready.status);

        engine.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_and_recover() {
        let platform = InMemoryPlatform::new();
        let key = ClusterKey::new("db");
        platform.add_cluster(key.clone(), ClusterSpec::new(1, TopologyMode::None));

        let engine = engine_for(
            &platform,
            vec![Arc::new(NoopDependent::failing("compute", 3))],
        );
        let handles = engine.start();
        engine.enqueue(key.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = platform.status(&key).unwrap();
        let ready = find_condition(&status.conditions, ConditionType::Ready).unwrap();
        assert!(ready.status);

        engine.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_pass_keeps_the_resource_scheduled() {
        let platform = InMemoryPlatform::new();
        let key = ClusterKey::new("db");
        platform.add_cluster(key.clone(), ClusterSpec::new(1, TopologyMode::None));

        // Internal errors abort the pass without back-off accounting; the
        // key must still come back on the fallback schedule.
        let engine = engine_for(
            &platform,
            vec![Arc::new(GlitchingDependent {
                remaining: Mutex::new(2),
            })],
        );
        let handles = engine.start();
        engine.enqueue(key.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = platform.status(&key).unwrap();
        let ready = find_condition(&status.conditions, ConditionType::Ready).unwrap();
        assert!(ready.status);

        engine.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
