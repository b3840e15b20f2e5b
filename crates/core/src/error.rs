use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single problem found in a topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("topology has no secondary nodes")]
    NoSecondaries,

    #[error("topology has {count} secondary nodes, at most {max} are supported")]
    TooManySecondaries { count: usize, max: usize },

    #[error("address {0} is used by more than one node")]
    DuplicateAddress(String),

    #[error("node address {address:?} is invalid: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("node {address}: ssh port {port} is outside 1-65535")]
    SshPortOutOfRange { address: String, port: u32 },

    #[error("node {address}: neither a password nor a private key is configured")]
    MissingCredentials { address: String },

    #[error("node {address}: both a password and a private key are configured")]
    ConflictingCredentials { address: String },

    #[error("node {address}: private key {} does not exist", path.display())]
    KeyFileNotFound { address: String, path: PathBuf },

    #[error("node {address}: service port must not be 0")]
    InvalidServicePort { address: String },

    #[error("node {address}: data directory {data_dir:?} must be an absolute path")]
    InvalidDataDir { address: String, data_dir: String },

    #[error("staging directory {0:?} must be an absolute path below /")]
    InvalidStagingDir(String),

    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("engine must not be empty")]
    EmptyEngine,
}

/// Every violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn contains(&self, violation: &Violation) -> bool {
        self.violations.contains(violation)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid topology ({} problem{})",
            self.violations.len(),
            if self.violations.len() == 1 { "" } else { "s" }
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}
