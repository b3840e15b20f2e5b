//! Event types emitted while a deployment runs

use chrono::{DateTime, Utc};
use cluster_core::{DeploymentPhase, NodeRole};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the emitter's stream, starting at 0
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(sequence: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Everything observable about a deployment run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: Uuid,
        cluster: String,
        node_count: usize,
    },

    #[serde(rename = "run.phase_changed")]
    PhaseChanged {
        run_id: Uuid,
        from: DeploymentPhase,
        to: DeploymentPhase,
    },

    #[serde(rename = "run.finished")]
    RunFinished {
        run_id: Uuid,
        phase: DeploymentPhase,
    },

    #[serde(rename = "node.staged")]
    NodeStaged { run_id: Uuid, address: String },

    #[serde(rename = "node.preflight_passed")]
    PreflightPassed { run_id: Uuid, address: String },

    #[serde(rename = "node.preflight_failed")]
    PreflightFailed {
        run_id: Uuid,
        address: String,
        reason: String,
    },

    #[serde(rename = "node.install_started")]
    NodeInstallStarted {
        run_id: Uuid,
        address: String,
        role: NodeRole,
    },

    #[serde(rename = "node.installed")]
    NodeInstalled {
        run_id: Uuid,
        address: String,
        role: NodeRole,
    },

    #[serde(rename = "node.install_failed")]
    NodeInstallFailed {
        run_id: Uuid,
        address: String,
        role: NodeRole,
        reason: String,
    },

    #[serde(rename = "node.replica_cloned")]
    ReplicaCloned { run_id: Uuid, address: String },

    #[serde(rename = "cluster.verified")]
    ReplicasVerified {
        run_id: Uuid,
        replicas: Vec<String>,
    },

    #[serde(rename = "node.rollback_attempted")]
    RollbackAttempted {
        run_id: Uuid,
        address: String,
        success: bool,
    },

    #[serde(rename = "node.staging_cleaned")]
    StagingCleaned {
        run_id: Uuid,
        address: String,
        success: bool,
    },
}

impl Event {
    /// Address of the node this event is about, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            Event::NodeStaged { address, .. }
            | Event::PreflightPassed { address, .. }
            | Event::PreflightFailed { address, .. }
            | Event::NodeInstallStarted { address, .. }
            | Event::NodeInstalled { address, .. }
            | Event::NodeInstallFailed { address, .. }
            | Event::ReplicaCloned { address, .. }
            | Event::RollbackAttempted { address, .. }
            | Event::StagingCleaned { address, .. } => Some(address),
            Event::RunStarted { .. }
            | Event::PhaseChanged { .. }
            | Event::RunFinished { .. }
            | Event::ReplicasVerified { .. } => None,
        }
    }
}
