use cluster_core::DeploymentPhase;

use crate::error::{OrchestratorError, Result};

pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: &DeploymentPhase, to: &DeploymentPhase) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &DeploymentPhase) -> Vec<DeploymentPhase> {
        use DeploymentPhase::*;

        match from {
            Validating => vec![Staging, Failed],
            Staging => vec![PreflightChecking, RollingBack],
            // Completed is reachable here only for check-only runs
            PreflightChecking => vec![Installing, Completed, Failed],
            Installing => vec![BootstrappingReplication, RollingBack],
            BootstrappingReplication => vec![Verifying, RollingBack],
            Verifying => vec![Completed, RollingBack],
            RollingBack => vec![Failed],
            Completed | Failed => vec![],
        }
    }

    pub fn can_transition(from: &DeploymentPhase, to: &DeploymentPhase) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Phase a run moves to when work in `from` fails.
    pub fn failure_target(from: &DeploymentPhase) -> DeploymentPhase {
        match from {
            DeploymentPhase::Staging
            | DeploymentPhase::Installing
            | DeploymentPhase::BootstrappingReplication
            | DeploymentPhase::Verifying => DeploymentPhase::RollingBack,
            _ => DeploymentPhase::Failed,
        }
    }

    pub fn next_phase(current: &DeploymentPhase) -> Option<DeploymentPhase> {
        use DeploymentPhase::*;

        match current {
            Validating => Some(Staging),
            Staging => Some(PreflightChecking),
            PreflightChecking => Some(Installing),
            Installing => Some(BootstrappingReplication),
            BootstrappingReplication => Some(Verifying),
            Verifying => Some(Completed),
            RollingBack => Some(Failed),
            Completed | Failed => None,
        }
    }
}
