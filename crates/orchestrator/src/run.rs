//! Working state of a single deployment run.

use cluster_core::{DeploymentPhase, Node};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::Result;
use crate::state_machine::PhaseStateMachine;

const PASSWORD_LENGTH: usize = 24;

/// One-time replication login generated for a run.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationCredential {
    pub user: String,
    password: String,
}

impl ReplicationCredential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn generate(user: impl Into<String>) -> Self {
        let password: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        Self::new(user, password)
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ReplicationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCredential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default)]
struct RunState {
    phase: DeploymentPhase,
    installed: Vec<Node>,
    failed: Vec<Node>,
    rolled_back: HashSet<String>,
    staged: Vec<String>,
    credential: Option<ReplicationCredential>,
}

/// The orchestrator's mutable view of a run.
///
/// Per-node workers report into it concurrently, so all state sits behind
/// one mutex. `installed` only grows while the run is Installing, and a
/// node handed to rollback can never be added back.
#[derive(Debug)]
pub struct DeploymentRun {
    id: Uuid,
    state: Mutex<RunState>,
}

impl Default for DeploymentRun {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentRun {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        // Poisoning only follows a panic in another worker; the data is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.state().phase
    }

    /// Move to `to`, returning the phase that was left.
    pub fn transition(&self, to: DeploymentPhase) -> Result<DeploymentPhase> {
        let mut state = self.state();
        PhaseStateMachine::validate_transition(&state.phase, &to)?;
        let from = state.phase;
        state.phase = to;
        Ok(from)
    }

    /// Record a successful install. Ignored outside Installing and for
    /// nodes already handed to rollback.
    pub fn mark_installed(&self, node: &Node) -> bool {
        let mut state = self.state();
        if state.phase != DeploymentPhase::Installing
            || state.rolled_back.contains(node.address())
            || state.installed.iter().any(|n| n.address() == node.address())
        {
            return false;
        }
        state.installed.push(node.clone());
        true
    }

    /// Record a node whose install failed and may have left partial state.
    pub fn mark_install_failed(&self, node: &Node) {
        let mut state = self.state();
        if !state.failed.iter().any(|n| n.address() == node.address()) {
            state.failed.push(node.clone());
        }
    }

    pub fn installed_nodes(&self) -> Vec<Node> {
        self.state().installed.clone()
    }

    /// Nodes that need an uninstall: everything installed, then every
    /// node whose install failed. Each returned node is marked rolled back.
    pub fn take_rollback_scope(&self) -> Vec<Node> {
        let mut state = self.state();
        let scope: Vec<Node> = state
            .installed
            .iter()
            .chain(state.failed.iter())
            .filter(|n| !state.rolled_back.contains(n.address()))
            .cloned()
            .collect();
        for node in &scope {
            state.rolled_back.insert(node.address().to_string());
        }
        scope
    }

    /// Remember that this run owns the staging directory on `address`.
    pub fn mark_staged(&self, address: &str) {
        let mut state = self.state();
        if !state.staged.iter().any(|a| a == address) {
            state.staged.push(address.to_string());
        }
    }

    pub fn staged_addresses(&self) -> Vec<String> {
        self.state().staged.clone()
    }

    pub fn set_credential(&self, credential: ReplicationCredential) {
        self.state().credential = Some(credential);
    }

    pub fn credential(&self) -> Option<ReplicationCredential> {
        self.state().credential.clone()
    }
}
