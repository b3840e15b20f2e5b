//! Core data model for cluster deployments.
//!
//! - [`Topology`] - declarative description of a cluster
//! - [`Node`] / [`NodeRole`] - a topology member in install order
//! - [`DeploymentPhase`] - phases of a deployment run
//! - [`TopologyValidator`] - aggregated topology validation

pub mod domain;
pub mod error;
pub mod validation;

pub use domain::*;
pub use error::{ValidationError, Violation};
pub use validation::{
    HostResolver, SyntaxOnlyResolver, SystemResolver, TopologyValidator, DEFAULT_MAX_SECONDARIES,
};
