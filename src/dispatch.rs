//! Per-instance event dispatch
//!
//! Instance lifecycle events (restarts, health probe transitions, membership
//! changes) arrive on a channel from the platform watch layer. The
//! dispatcher attributes each event to its owning cluster via the ownership
//! annotation, hands it to the topology handler's instance-scoped hook, and
//! enqueues the owner for a full pass. Events for unmanaged instances are
//! dropped. Decisions are never made here; the requeued pass re-derives
//! everything from observed state.

use crate::engine::WorkQueue;
use crate::registry::InstanceRegistry;
use crate::resource::{ClusterKey, TopologyMode};
use crate::topology::{QuorumStateMachine, ReplicationStateMachine};
use slog::{debug, Logger};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceEventKind {
    /// The compute unit restarted
    Restarted,

    /// The health probe result flipped
    HealthChanged,

    /// The instance reported a cluster membership change
    MembershipChanged,
}

/// A lifecycle event observed on one compute instance.
#[derive(Clone, Debug)]
pub struct InstanceEvent {
    /// Owning cluster per the ownership annotation; None for unmanaged
    /// infrastructure
    pub owner: Option<ClusterKey>,

    pub ordinal: u32,

    pub kind: InstanceEventKind,
}

pub struct InstanceDispatcher {
    queue: Arc<WorkQueue>,
    registry: Arc<Mutex<InstanceRegistry>>,
    quorum: Arc<QuorumStateMachine>,
    replica: Arc<ReplicationStateMachine>,
    logger: Logger,
}

impl InstanceDispatcher {
    pub fn new(
        queue: Arc<WorkQueue>,
        registry: Arc<Mutex<InstanceRegistry>>,
        quorum: Arc<QuorumStateMachine>,
        replica: Arc<ReplicationStateMachine>,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            quorum,
            replica,
            logger,
        })
    }

    /// Consume the event channel until it closes.
    pub fn start(self: Arc<Self>, mut events: mpsc::Receiver<InstanceEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.dispatch(event);
            }
            debug!(self.logger, "Instance event channel closed");
        })
    }

    pub fn dispatch(&self, event: InstanceEvent) {
        let Some(owner) = event.owner else {
            debug!(self.logger, "Dropping event for unmanaged instance";
                "ordinal" => event.ordinal, "kind" => ?event.kind);
            return;
        };

        let topology = {
            let registry = self.registry.lock().unwrap();
            registry
                .instances_of(&owner)
                .iter()
                .find(|i| i.ordinal == event.ordinal)
                .and_then(|i| i.annotations.topology)
        };

        debug!(self.logger, "Instance event";
            "cluster" => %owner, "ordinal" => event.ordinal, "kind" => ?event.kind);

        match topology {
            Some(TopologyMode::MultiMaster) => {
                self.quorum.handle_instance_event(&owner, event.ordinal)
            }
            Some(TopologyMode::PrimaryReplica) => {
                self.replica.handle_instance_event(&owner, event.ordinal)
            }
            _ => {}
        }

        // The dispatcher only triggers; the pass derives the decision.
        self.queue.add(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InMemoryPlatform, InstanceAdmin, PlatformClient};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn dispatcher() -> (Arc<InstanceDispatcher>, Arc<WorkQueue>) {
        let platform = InMemoryPlatform::new();
        let client: Arc<dyn PlatformClient> = Arc::new(platform.clone());
        let admin: Arc<dyn InstanceAdmin> = Arc::new(platform.admin());
        let queue = WorkQueue::new();
        let quorum = Arc::new(QuorumStateMachine::new(
            client.clone(),
            admin.clone(),
            test_logger(),
        ));
        let replica = Arc::new(ReplicationStateMachine::new(client, admin, 3, test_logger()));
        let dispatcher = InstanceDispatcher::new(
            queue.clone(),
            Arc::new(Mutex::new(InstanceRegistry::new())),
            quorum,
            replica,
            test_logger(),
        );
        (dispatcher, queue)
    }

    #[tokio::test]
    async fn test_unowned_events_are_dropped() {
        let (dispatcher, queue) = dispatcher();
        dispatcher.dispatch(InstanceEvent {
            owner: None,
            ordinal: 0,
            kind: InstanceEventKind::Restarted,
        });
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_owned_event_enqueues_the_owner() {
        let (dispatcher, queue) = dispatcher();
        dispatcher.dispatch(InstanceEvent {
            owner: Some(ClusterKey::new("db")),
            ordinal: 1,
            kind: InstanceEventKind::HealthChanged,
        });
        assert_eq!(queue.next().await, Some(ClusterKey::new("db")));
    }

    #[tokio::test]
    async fn test_event_burst_collapses_to_one_pass() {
        let (dispatcher, queue) = dispatcher();
        for ordinal in 0..3 {
            dispatcher.dispatch(InstanceEvent {
                owner: Some(ClusterKey::new("db")),
                ordinal,
                kind: InstanceEventKind::MembershipChanged,
            });
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_feed_drains_until_close() {
        let (dispatcher, queue) = dispatcher();
        let (tx, rx) = mpsc::channel(8);
        let handle = dispatcher.start(rx);

        tx.send(InstanceEvent {
            owner: Some(ClusterKey::new("db")),
            ordinal: 0,
            kind: InstanceEventKind::Restarted,
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(queue.len(), 1);
    }
}
