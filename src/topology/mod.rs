//! Topology state machines
//!
//! Two state machines decide bootstrap, steady-state, and recovery actions:
//! quorum/multi-master clustering and asynchronous primary/replica
//! replication. Both are split into a pure decision core (state snapshot in,
//! action list out) and an async executor that applies the actions against
//! the fleet. No topology state survives a pass: every decision is re-derived
//! from observed platform and instance data, which keeps the controller
//! stateless and restart-safe.

pub mod quorum;
pub mod replica;

use crate::resource::TopologyMode;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use quorum::QuorumStateMachine;
pub use replica::ReplicationStateMachine;

/// Phase labels reported by the topology state machines.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TopologyPhase {
    // Quorum/multi-master
    Uninitialized,
    Bootstrapping,
    Clustered,
    Recovering,
    /// Recovery cannot proceed without operator action (total data loss
    /// signal); no seed is guessed.
    Halted,

    // Primary/replica
    Electing,
    Replicating,
    FailingOver,
}

impl fmt::Display for TopologyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TopologyPhase::Uninitialized => "Uninitialized",
            TopologyPhase::Bootstrapping => "Bootstrapping",
            TopologyPhase::Clustered => "Clustered",
            TopologyPhase::Recovering => "Recovering",
            TopologyPhase::Halted => "Halted",
            TopologyPhase::Electing => "Electing",
            TopologyPhase::Replicating => "Replicating",
            TopologyPhase::FailingOver => "FailingOver",
        };
        write!(f, "{}", label)
    }
}

/// Result of one topology pass over a cluster.
#[derive(Clone, Debug)]
pub struct TopologyOutcome {
    pub phase: TopologyPhase,

    /// Whether the topology has reached its stable state
    pub ready: bool,

    /// Machine-readable reason when not ready
    pub reason: String,

    pub message: String,

    /// Current membership set (quorum mode)
    pub members: Vec<u32>,

    /// Current primary ordinal (primary/replica mode)
    pub primary_ordinal: Option<u32>,
}

/// Tagged dispatch over the declared topology mode, selected once per
/// reconciliation. Each variant exposes the same two-operation capability
/// set: a full resource pass and an instance-scoped event handler.
pub enum TopologyHandler<'a> {
    MultiMaster(&'a QuorumStateMachine),
    PrimaryReplica(&'a ReplicationStateMachine),
    None,
}

impl<'a> TopologyHandler<'a> {
    pub fn for_mode(
        mode: TopologyMode,
        quorum: &'a QuorumStateMachine,
        replica: &'a ReplicationStateMachine,
    ) -> Self {
        match mode {
            TopologyMode::MultiMaster => TopologyHandler::MultiMaster(quorum),
            TopologyMode::PrimaryReplica => TopologyHandler::PrimaryReplica(replica),
            TopologyMode::None => TopologyHandler::None,
        }
    }
}
