pub mod confirm;
pub mod error;
pub mod installer;
pub mod installers;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod rollback;
pub mod run;
pub mod sessions;
pub mod state_machine;
pub mod verify;

pub use confirm::{
    is_affirmative, AssumeYes, ConfirmationGate, ConfirmationKind, ConfirmationPrompt,
    FixedAnswer, TerminalGate,
};
pub use error::{DeployFailure, InstallerError, OrchestratorError, Result};
pub use installer::{InstallContext, InstallResult, NodeInstaller};
pub use installers::{ScriptHooks, ScriptInstaller};
pub use orchestrator::{
    DeployMode, DeploymentOrchestrator, OrchestratorConfig, DEFAULT_REPLICATION_USER,
};
pub use pool::DEFAULT_PARALLELISM;
pub use report::{CleanupEntry, CleanupReport, DeploymentSummary, NodeSummary};
pub use rollback::{RollbackEntry, RollbackManager, RollbackReport};
pub use run::{DeploymentRun, ReplicationCredential};
pub use sessions::SessionSet;
pub use state_machine::PhaseStateMachine;
pub use tokio_util::sync::CancellationToken;
pub use verify::ReplicaVerifier;
