use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a deployment run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    #[default]
    Validating,
    Staging,
    PreflightChecking,
    Installing,
    BootstrappingReplication,
    Verifying,
    Completed,
    RollingBack,
    Failed,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Staging => "staging",
            Self::PreflightChecking => "preflight_checking",
            Self::Installing => "installing",
            Self::BootstrappingReplication => "bootstrapping_replication",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::RollingBack => "rolling_back",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validating" => Some(Self::Validating),
            "staging" => Some(Self::Staging),
            "preflight_checking" => Some(Self::PreflightChecking),
            "installing" => Some(Self::Installing),
            "bootstrapping_replication" => Some(Self::BootstrappingReplication),
            "verifying" => Some(Self::Verifying),
            "completed" => Some(Self::Completed),
            "rolling_back" => Some(Self::RollingBack),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
