use cluster_core::{DeploymentPhase, NodeRole, ValidationError};
use remote::{RemoteError, StageError};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::report::CleanupReport;
use crate::rollback::RollbackReport;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidTopology(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot open session to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: RemoteError,
    },

    #[error("Staging failed on {address}: {source}")]
    Stage {
        address: String,
        #[source]
        source: StageError,
    },

    #[error("Preflight check failed on {address}: {reason}")]
    Preflight { address: String, reason: String },

    #[error("Install failed on {address} ({role}): {source}")]
    Install {
        address: String,
        role: NodeRole,
        #[source]
        source: InstallerError,
    },

    #[error("Replication bootstrap failed on {address}: {source}")]
    Bootstrap {
        address: String,
        #[source]
        source: InstallerError,
    },

    #[error("Cluster verification failed: {0}")]
    Verify(String),

    #[error("Cancelled during {phase}")]
    Cancelled { phase: DeploymentPhase },

    #[error("aborted by user")]
    AbortedByUser,

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Removal incomplete, manual cleanup required on: {}", .failed.join(", "))]
    RemovalIncomplete {
        failed: Vec<String>,
        report: RollbackReport,
    },
}

impl OrchestratorError {
    pub fn connect(address: impl Into<String>, source: RemoteError) -> Self {
        Self::Connect {
            address: address.into(),
            source,
        }
    }

    pub fn bootstrap(address: impl Into<String>, source: InstallerError) -> Self {
        Self::Bootstrap {
            address: address.into(),
            source,
        }
    }

    pub fn is_aborted_by_user(&self) -> bool {
        matches!(self, Self::AbortedByUser)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure reported by a [`NodeInstaller`](crate::installer::NodeInstaller).
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Environment not ready: {0}")]
    Environment(String),

    #[error("{0}")]
    Failed(String),

    #[error("Unknown placeholder {{{placeholder}}} in `{hook}` hook")]
    UnknownPlaceholder { hook: String, placeholder: String },

    #[error("Invalid installer parameters: {0}")]
    InvalidParameters(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Terminal error of a deployment run.
///
/// Carries the phase that failed, the original cause, the outcome of any
/// compensating uninstalls, and the staging cleanup outcome.
#[derive(Debug)]
pub struct DeployFailure {
    pub run_id: Uuid,
    pub phase: DeploymentPhase,
    pub cause: OrchestratorError,
    pub rollback: Option<RollbackReport>,
    pub cleanup: CleanupReport,
}

impl DeployFailure {
    pub fn is_aborted_by_user(&self) -> bool {
        self.cause.is_aborted_by_user()
    }

    /// True when some node could not be uninstalled or cleaned up.
    pub fn requires_manual_remediation(&self) -> bool {
        self.rollback.as_ref().is_some_and(|r| !r.is_clean()) || !self.cleanup.is_clean()
    }
}

impl fmt::Display for DeployFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_aborted_by_user() {
            return write!(f, "{}", self.cause);
        }

        write!(f, "deployment failed during {}: {}", self.phase, self.cause)?;
        if let Some(rollback) = &self.rollback {
            write!(f, "\n{rollback}")?;
        }
        if !self.cleanup.is_clean() {
            write!(f, "\n{}", self.cleanup)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeployFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
