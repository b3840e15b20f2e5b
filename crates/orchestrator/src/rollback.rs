//! Best-effort compensating uninstalls.

use cluster_core::{Node, NodeRole};
use events::{Event, EventBus};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::installer::NodeInstaller;
use crate::pool::NodeTaskSet;
use crate::sessions::SessionSet;

/// Outcome of uninstalling one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackEntry {
    pub address: String,
    pub role: NodeRole,
    pub attempted: bool,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub reason: String,
    pub entries: Vec<RollbackEntry>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RollbackEntry> {
        self.entries.iter().filter(|e| !e.succeeded)
    }

    pub fn failed_addresses(&self) -> Vec<String> {
        self.failed().map(|e| e.address.clone()).collect()
    }

    pub fn entry(&self, address: &str) -> Option<&RollbackEntry> {
        self.entries.iter().find(|e| e.address == address)
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "rollback: nothing was installed");
        }

        write!(f, "rollback ({} nodes):", self.entries.len())?;
        for entry in &self.entries {
            match (&entry.error, entry.attempted) {
                (None, _) => write!(f, "\n  {} ({}): uninstalled", entry.address, entry.role)?,
                (Some(err), true) => write!(
                    f,
                    "\n  {} ({}): FAILED, manual cleanup required: {}",
                    entry.address, entry.role, err
                )?,
                (Some(err), false) => write!(
                    f,
                    "\n  {} ({}): NOT ATTEMPTED, manual cleanup required: {}",
                    entry.address, entry.role, err
                )?,
            }
        }
        Ok(())
    }
}

/// Uninstalls every node in a scope, each independently.
///
/// One node failing (or being unreachable) never stops the others. Failed
/// uninstalls are reported, logged at error level, and never retried.
pub struct RollbackManager {
    installer: Arc<dyn NodeInstaller>,
    events: EventBus,
    parallelism: usize,
}

impl RollbackManager {
    pub fn new(installer: Arc<dyn NodeInstaller>, events: EventBus, parallelism: usize) -> Self {
        Self {
            installer,
            events,
            parallelism,
        }
    }

    pub async fn rollback(
        &self,
        run_id: Uuid,
        scope: &[Node],
        sessions: &Arc<SessionSet>,
        reason: &str,
    ) -> RollbackReport {
        info!(run_id = %run_id, nodes = scope.len(), reason = %reason, "Rolling back");

        let mut tasks = NodeTaskSet::new(self.parallelism);
        for node in scope {
            let node = node.clone();
            let installer = Arc::clone(&self.installer);
            let sessions = Arc::clone(sessions);
            tasks.spawn(async move { uninstall_node(installer.as_ref(), &sessions, node).await });
        }

        let entries = tasks.join_all().await;
        for entry in &entries {
            self.events.publish(Event::RollbackAttempted {
                run_id,
                address: entry.address.clone(),
                success: entry.succeeded,
            });
        }

        let report = RollbackReport {
            reason: reason.to_string(),
            entries,
        };
        if report.is_clean() {
            info!(run_id = %run_id, "Rollback completed cleanly");
        } else {
            error!(
                run_id = %run_id,
                failed = ?report.failed_addresses(),
                "Rollback incomplete, manual remediation required"
            );
        }
        report
    }
}

async fn uninstall_node(
    installer: &dyn NodeInstaller,
    sessions: &SessionSet,
    node: Node,
) -> RollbackEntry {
    let mut entry = RollbackEntry {
        address: node.address().to_string(),
        role: node.role,
        attempted: false,
        succeeded: false,
        error: None,
    };

    let session = match sessions.get_or_open(&node).await {
        Ok(session) => session,
        Err(e) => {
            error!(address = %node.address(), error = %e, "Cannot reach node to uninstall");
            entry.error = Some(e.to_string());
            return entry;
        }
    };

    entry.attempted = true;
    match installer
        .uninstall(session.as_ref(), node.service_port(), node.data_dir())
        .await
    {
        Ok(()) => {
            info!(address = %node.address(), "Node uninstalled");
            entry.succeeded = true;
        }
        Err(e) => {
            warn!(address = %node.address(), error = %e, "Uninstall failed");
            entry.error = Some(e.to_string());
        }
    }
    entry
}
