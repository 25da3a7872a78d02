//! Operator runtime
//!
//! Wires the platform seams, the topology state machines, the reconciler,
//! the worker pool, and the instance event dispatcher into one startable
//! unit. Startup is gated on leadership so at most one active control plane
//! writes to the platform at a time; the standalone gate acquires
//! immediately for single-process deployments.

use crate::config::OperatorConfig;
use crate::dispatch::{InstanceDispatcher, InstanceEvent};
use crate::engine::{ClusterReconciler, ReconcileEngine, WorkQueue};
use crate::error::ReconcileError;
use crate::platform::{DependentReconciler, Discovery, InstanceAdmin, PlatformClient, TimeoutAdmin};
use crate::registry::InstanceRegistry;
use crate::topology::{QuorumStateMachine, ReplicationStateMachine};
use slog::{info, o, Drain, Logger};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Gate acquired before the runtime starts reconciling.
#[async_trait::async_trait]
pub trait LeadershipGate: Send + Sync {
    /// Resolves once this process holds leadership.
    async fn acquire(&self);
}

/// Leadership gate for single-process deployments: always the leader.
pub struct StandaloneLeadership;

#[async_trait::async_trait]
impl LeadershipGate for StandaloneLeadership {
    async fn acquire(&self) {}
}

/// Terminal logger with an async drain, for binary entry points.
pub fn default_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

pub struct OperatorRuntime {
    platform: Arc<dyn PlatformClient>,
    queue: Arc<WorkQueue>,
    engine: Arc<ReconcileEngine>,
    dispatcher: Arc<InstanceDispatcher>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

impl OperatorRuntime {
    /// Build a runtime over the given platform seams. Fails on invalid
    /// policy configuration.
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        admin: Arc<dyn InstanceAdmin>,
        dependents: Vec<Arc<dyn DependentReconciler>>,
        discovery: Arc<dyn Discovery>,
        config: OperatorConfig,
        logger: Logger,
    ) -> Result<Self, String> {
        config.validate()?;

        // All admin traffic goes through the bounded-timeout wrapper; a
        // wedged instance costs one pass, not a worker.
        let admin: Arc<dyn InstanceAdmin> = Arc::new(TimeoutAdmin::new(admin, config.admin_timeout));

        let queue = WorkQueue::new();
        let registry = Arc::new(Mutex::new(InstanceRegistry::new()));
        let quorum = Arc::new(QuorumStateMachine::new(
            platform.clone(),
            admin.clone(),
            logger.new(o!("component" => "quorum")),
        ));
        let replica = Arc::new(ReplicationStateMachine::new(
            platform.clone(),
            admin,
            config.failover_probe_threshold,
            logger.new(o!("component" => "replication")),
        ));
        let reconciler = Arc::new(ClusterReconciler::new(
            platform.clone(),
            dependents,
            discovery,
            quorum.clone(),
            replica.clone(),
            registry.clone(),
            config.clone(),
            logger.new(o!("component" => "reconciler")),
        ));
        let engine = ReconcileEngine::new(
            queue.clone(),
            reconciler,
            config,
            logger.new(o!("component" => "engine")),
        );
        let dispatcher = InstanceDispatcher::new(
            queue.clone(),
            registry,
            quorum,
            replica,
            logger.new(o!("component" => "dispatch")),
        );

        Ok(Self {
            platform,
            queue,
            engine,
            dispatcher,
            handles: Mutex::new(Vec::new()),
            logger,
        })
    }

    /// Acquire leadership, seed the queue with all known clusters, and
    /// start the workers and the event dispatcher.
    pub async fn start(
        &self,
        events: mpsc::Receiver<InstanceEvent>,
        leadership: Arc<dyn LeadershipGate>,
    ) -> Result<(), ReconcileError> {
        leadership.acquire().await;
        info!(self.logger, "Leadership acquired, starting reconciliation");

        let keys = self.platform.list_clusters().await?;
        info!(self.logger, "Seeding work queue"; "clusters" => keys.len());
        for key in keys {
            self.queue.add(key);
        }

        let mut handles = self.engine.start();
        handles.push(self.dispatcher.clone().start(events));
        self.handles.lock().unwrap().extend(handles);
        Ok(())
    }

    /// Enqueue one cluster for reconciliation.
    pub fn enqueue(&self, key: crate::resource::ClusterKey) {
        self.queue.add(key);
    }

    /// Stop accepting work, drain in-flight passes, and wait for all tasks.
    /// The caller must close the event channel first or the dispatcher task
    /// never completes.
    pub async fn shutdown(&self) {
        info!(self.logger, "Shutting down");
        self.engine.shutdown();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!(self.logger, "Shutdown complete");
    }
}
