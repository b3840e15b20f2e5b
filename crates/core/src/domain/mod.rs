mod node;
mod phase;
mod topology;

pub use node::{AuxiliaryRole, Credentials, HostIdentity, InstallParams, Node, NodeRole, NodeSpec};
pub use phase::DeploymentPhase;
pub use topology::{AuxiliaryNode, Topology, DEFAULT_STAGING_DIR};
