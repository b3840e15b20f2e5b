use cluster_core::{Node, NodeRole, Topology};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::run::ReplicationCredential;

/// Outcome of removing the staging directory on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    pub address: String,
    pub removed: bool,
    /// The held session failed and a new one was opened for the retry
    pub reopened: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.removed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupEntry> {
        self.entries.iter().filter(|e| !e.removed)
    }

    pub fn entry(&self, address: &str) -> Option<&CleanupEntry> {
        self.entries.iter().find(|e| e.address == address)
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "staging cleanup:")?;
        for entry in &self.entries {
            match &entry.error {
                None => write!(f, "\n  {}: removed", entry.address)?,
                Some(err) => write!(f, "\n  {}: NOT REMOVED: {}", entry.address, err)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub address: String,
    pub role: NodeRole,
    pub service_port: u16,
    pub data_dir: String,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            address: node.address().to_string(),
            role: node.role,
            service_port: node.service_port(),
            data_dir: node.data_dir().to_string(),
        }
    }
}

/// Connection information reported after a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    pub run_id: Uuid,
    pub cluster_name: String,
    pub engine: String,
    pub check_only: bool,
    pub seed: NodeSummary,
    pub secondaries: Vec<NodeSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auxiliaries: Vec<NodeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationCredential>,
    pub connected_replicas: Vec<String>,
    pub cleanup: CleanupReport,
}

impl DeploymentSummary {
    pub fn new(run_id: Uuid, topology: &Topology) -> Self {
        Self {
            run_id,
            cluster_name: topology.cluster_name.clone(),
            engine: topology.engine.clone(),
            check_only: false,
            seed: NodeSummary::from(&topology.seed_node()),
            secondaries: topology.secondary_nodes().iter().map(NodeSummary::from).collect(),
            auxiliaries: topology.auxiliary_nodes().iter().map(NodeSummary::from).collect(),
            replication: None,
            connected_replicas: Vec::new(),
            cleanup: CleanupReport::default(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSummary> {
        std::iter::once(&self.seed)
            .chain(self.secondaries.iter())
            .chain(self.auxiliaries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::{AuxiliaryRole, NodeSpec};

    #[test]
    fn test_summary_lists_nodes_in_order() {
        let topology = Topology::new("orders", "postgres", NodeSpec::new("10.0.0.1", 5432, "/data"))
            .with_secondary(NodeSpec::new("10.0.0.2", 5432, "/data"))
            .with_auxiliary(AuxiliaryRole::Proxy, NodeSpec::new("10.0.0.9", 6432, "/pool"));

        let summary = DeploymentSummary::new(Uuid::new_v4(), &topology);
        let roles: Vec<_> = summary.nodes().map(|n| n.role).collect();

        assert_eq!(roles, vec![NodeRole::Seed, NodeRole::Secondary, NodeRole::Proxy]);
    }

    #[test]
    fn test_summary_json_includes_credential() {
        let topology = Topology::new("orders", "postgres", NodeSpec::new("10.0.0.1", 5432, "/data"));
        let mut summary = DeploymentSummary::new(Uuid::new_v4(), &topology);
        summary.replication = Some(ReplicationCredential::new("replicator", "s3cret"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["replication"]["user"], "replicator");
        assert_eq!(json["replication"]["password"], "s3cret");
        assert_eq!(json["seed"]["role"], "seed");
        assert!(json.get("auxiliaries").is_none());
    }

    #[test]
    fn test_cleanup_report() {
        let report = CleanupReport {
            entries: vec![
                CleanupEntry {
                    address: "10.0.0.1".to_string(),
                    removed: true,
                    reopened: false,
                    error: None,
                },
                CleanupEntry {
                    address: "10.0.0.2".to_string(),
                    removed: false,
                    reopened: true,
                    error: Some("connection refused".to_string()),
                },
            ],
        };

        assert!(!report.is_clean());
        assert_eq!(report.failures().count(), 1);
        assert!(report.to_string().contains("10.0.0.2: NOT REMOVED: connection refused"));
    }
}
