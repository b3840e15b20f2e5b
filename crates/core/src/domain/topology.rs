use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::node::{AuxiliaryRole, Node, NodeRole, NodeSpec};

pub const DEFAULT_STAGING_DIR: &str = "/tmp/clusterforge-staging";

fn default_staging_dir() -> String {
    DEFAULT_STAGING_DIR.to_string()
}

/// An auxiliary member (arbiter, witness, proxy) of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuxiliaryNode {
    pub role: AuxiliaryRole,
    #[serde(flatten)]
    pub spec: NodeSpec,
}

/// Declarative description of a cluster.
///
/// Built once per run from configuration and command-line overrides, then
/// validated and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topology {
    pub cluster_name: String,
    pub engine: String,
    pub seed: NodeSpec,
    #[serde(default)]
    pub secondaries: Vec<NodeSpec>,
    #[serde(default)]
    pub auxiliaries: Vec<AuxiliaryNode>,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// Passed through to the installer untouched.
    #[serde(default)]
    pub engine_parameters: Map<String, Value>,
}

impl Topology {
    pub fn new(cluster_name: impl Into<String>, engine: impl Into<String>, seed: NodeSpec) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            engine: engine.into(),
            seed,
            secondaries: Vec::new(),
            auxiliaries: Vec::new(),
            staging_dir: default_staging_dir(),
            engine_parameters: Map::new(),
        }
    }

    pub fn with_secondary(mut self, spec: NodeSpec) -> Self {
        self.secondaries.push(spec);
        self
    }

    pub fn with_auxiliary(mut self, role: AuxiliaryRole, spec: NodeSpec) -> Self {
        self.auxiliaries.push(AuxiliaryNode { role, spec });
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<String>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_engine_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.engine_parameters.insert(key.into(), value);
        self
    }

    pub fn seed_node(&self) -> Node {
        Node::new(NodeRole::Seed, self.seed.clone())
    }

    pub fn secondary_nodes(&self) -> Vec<Node> {
        self.secondaries
            .iter()
            .map(|spec| Node::new(NodeRole::Secondary, spec.clone()))
            .collect()
    }

    pub fn auxiliary_nodes(&self) -> Vec<Node> {
        self.auxiliaries
            .iter()
            .map(|aux| Node::new(aux.role.into(), aux.spec.clone()))
            .collect()
    }

    /// Every member in install order: seed, secondaries, auxiliaries.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(1 + self.secondaries.len() + self.auxiliaries.len());
        nodes.push(self.seed_node());
        nodes.extend(self.secondary_nodes());
        nodes.extend(self.auxiliary_nodes());
        nodes
    }

    pub fn secondary_addresses(&self) -> Vec<String> {
        self.secondaries.iter().map(|s| s.address.clone()).collect()
    }
}
