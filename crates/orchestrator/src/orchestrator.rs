//! Phase sequencing for cluster deployment and removal.

use cluster_core::{DeploymentPhase, Node, Topology, TopologyValidator};
use events::{Event, EventBus};
use remote::{Artifact, Connector, RemoteError, RemoteSession, StagingCoordinator};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::confirm::{AssumeYes, ConfirmationGate, ConfirmationKind, ConfirmationPrompt};
use crate::error::{DeployFailure, OrchestratorError, Result};
use crate::installer::{InstallContext, NodeInstaller};
use crate::pool::{NodeTaskSet, DEFAULT_PARALLELISM};
use crate::report::{CleanupEntry, CleanupReport, DeploymentSummary};
use crate::rollback::{RollbackManager, RollbackReport};
use crate::run::{DeploymentRun, ReplicationCredential};
use crate::sessions::SessionSet;
use crate::state_machine::PhaseStateMachine;
use crate::verify::ReplicaVerifier;

pub const DEFAULT_REPLICATION_USER: &str = "replicator";

/// Explicit settings for one orchestrator; nothing is read from the process environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent per-node operations within a phase
    pub parallelism: usize,
    pub verify_poll_interval: Duration,
    pub verify_timeout: Duration,
    pub replication_user: String,
    pub artifacts: Vec<Artifact>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            verify_poll_interval: Duration::from_secs(2),
            verify_timeout: Duration::from_secs(60),
            replication_user: DEFAULT_REPLICATION_USER.to_string(),
            artifacts: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_verify_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.verify_poll_interval = poll_interval;
        self.verify_timeout = timeout;
        self
    }

    pub fn with_replication_user(mut self, user: impl Into<String>) -> Self {
        self.replication_user = user.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    Full,
    /// Stage and run every check, but never install
    CheckOnly,
}

enum NodeOutcome {
    Done,
    Skipped,
    Failed(OrchestratorError),
}

/// Shared handles of one run, cloned into per-node tasks.
#[derive(Clone)]
struct RunScope {
    run: Arc<DeploymentRun>,
    sessions: Arc<SessionSet>,
    installer: Arc<dyn NodeInstaller>,
    staging: Arc<StagingCoordinator>,
    events: EventBus,
    engine_parameters: Arc<Map<String, Value>>,
    cancel: CancellationToken,
}

impl RunScope {
    fn run_id(&self) -> Uuid {
        self.run.id()
    }

    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    fn advance(&self, to: DeploymentPhase) -> Result<()> {
        let from = self.run.transition(to)?;
        info!(run_id = %self.run_id(), from = %from, to = %to, "Phase changed");
        self.publish(Event::PhaseChanged {
            run_id: self.run_id(),
            from,
            to,
        });
        Ok(())
    }

    /// Cancellation is honored between steps, never in the middle of a remote command.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled {
                phase: self.run.phase(),
            });
        }
        Ok(())
    }

    fn session(&self, node: &Node) -> Result<Arc<dyn RemoteSession>> {
        self.sessions.get(node.address()).ok_or_else(|| {
            OrchestratorError::connect(
                node.address(),
                RemoteError::connect(node.address(), "no open session"),
            )
        })
    }

    fn context(&self, node: &Node) -> Result<InstallContext> {
        Ok(InstallContext {
            session: self.session(node)?,
            node: node.clone(),
            staging_dir: self.staging.dir().to_string(),
            engine_parameters: Arc::clone(&self.engine_parameters),
        })
    }
}

/// First failure in topology order wins; skipped work means the phase was cut short.
fn settle(outcomes: Vec<NodeOutcome>, phase: DeploymentPhase) -> Result<()> {
    let mut skipped = false;
    for outcome in outcomes {
        match outcome {
            NodeOutcome::Done => {}
            NodeOutcome::Skipped => skipped = true,
            NodeOutcome::Failed(e) => return Err(e),
        }
    }
    if skipped {
        return Err(OrchestratorError::Cancelled { phase });
    }
    Ok(())
}

/// Turns a topology and a [`NodeInstaller`] into a running cluster, or
/// unwinds everything it installed.
pub struct DeploymentOrchestrator {
    connector: Arc<dyn Connector>,
    installer: Arc<dyn NodeInstaller>,
    gate: Arc<dyn ConfirmationGate>,
    validator: TopologyValidator,
    events: EventBus,
    config: OrchestratorConfig,
}

impl DeploymentOrchestrator {
    pub fn new(connector: Arc<dyn Connector>, installer: Arc<dyn NodeInstaller>) -> Self {
        Self {
            connector,
            installer,
            gate: Arc::new(AssumeYes),
            validator: TopologyValidator::default(),
            events: EventBus::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_validator(mut self, validator: TopologyValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn deploy(
        &self,
        topology: &Topology,
        cancel: CancellationToken,
    ) -> std::result::Result<DeploymentSummary, DeployFailure> {
        self.execute(topology, DeployMode::Full, cancel).await
    }

    /// Stage and check every node without installing anything.
    pub async fn check(
        &self,
        topology: &Topology,
        cancel: CancellationToken,
    ) -> std::result::Result<DeploymentSummary, DeployFailure> {
        self.execute(topology, DeployMode::CheckOnly, cancel).await
    }

    pub async fn execute(
        &self,
        topology: &Topology,
        mode: DeployMode,
        cancel: CancellationToken,
    ) -> std::result::Result<DeploymentSummary, DeployFailure> {
        let run = Arc::new(DeploymentRun::new());
        let nodes = topology.nodes();
        info!(
            run_id = %run.id(),
            cluster = %topology.cluster_name,
            engine = %topology.engine,
            nodes = nodes.len(),
            mode = ?mode,
            "Starting deployment"
        );
        self.events.publish(Event::RunStarted {
            run_id: run.id(),
            cluster: topology.cluster_name.clone(),
            node_count: nodes.len(),
        });

        let staging = Arc::new(StagingCoordinator::new(
            topology.staging_dir.clone(),
            self.config.artifacts.clone(),
        ));
        let kind = match mode {
            DeployMode::Full => Some(ConfirmationKind::Deploy),
            DeployMode::CheckOnly => None,
        };

        let sessions = match self
            .validate_and_connect(topology, &nodes, kind, Some(&staging), &cancel)
            .await
        {
            Ok(sessions) => Arc::new(sessions),
            Err(cause) => return Err(self.fail_untouched(&run, cause)),
        };

        let scope = RunScope {
            run: Arc::clone(&run),
            sessions: Arc::clone(&sessions),
            installer: Arc::clone(&self.installer),
            staging,
            events: self.events.clone(),
            engine_parameters: Arc::new(topology.engine_parameters.clone()),
            cancel,
        };

        let outcome = self.drive(&scope, topology, &nodes, mode).await;

        match outcome {
            Ok(replicas) => {
                let cleanup = self.cleanup(&scope, &nodes).await;
                sessions.close_all().await;
                self.finish(&run);

                let mut summary = DeploymentSummary::new(run.id(), topology);
                summary.check_only = mode == DeployMode::CheckOnly;
                summary.replication = run.credential();
                summary.connected_replicas = replicas;
                summary.cleanup = cleanup;
                info!(run_id = %run.id(), cluster = %topology.cluster_name, "Deployment completed");
                Ok(summary)
            }
            Err(cause) => {
                let failed_phase = run.phase();
                error!(run_id = %run.id(), phase = %failed_phase, error = %cause, "Deployment failed");

                let rollback = self.unwind(&scope, failed_phase, &cause).await;
                let cleanup = self.cleanup(&scope, &nodes).await;
                sessions.close_all().await;
                self.finish(&run);

                Err(DeployFailure {
                    run_id: run.id(),
                    phase: failed_phase,
                    cause,
                    rollback,
                    cleanup,
                })
            }
        }
    }

    /// Uninstall every node of the cluster.
    ///
    /// Each node is attempted independently; a report with any failure
    /// becomes [`OrchestratorError::RemovalIncomplete`].
    pub async fn remove(
        &self,
        topology: &Topology,
        cancel: CancellationToken,
    ) -> Result<RollbackReport> {
        let run_id = Uuid::new_v4();
        let nodes = topology.nodes();
        info!(run_id = %run_id, cluster = %topology.cluster_name, "Removing cluster");

        let sessions = Arc::new(
            self.validate_and_connect(
                topology,
                &nodes,
                Some(ConfirmationKind::Remove),
                None,
                &cancel,
            )
            .await?,
        );

        if cancel.is_cancelled() {
            sessions.close_all().await;
            return Err(OrchestratorError::Cancelled {
                phase: DeploymentPhase::Validating,
            });
        }

        let report = self
            .rollback_manager()
            .rollback(run_id, &nodes, &sessions, "cluster removal")
            .await;
        sessions.close_all().await;

        if report.is_clean() {
            info!(run_id = %run_id, cluster = %topology.cluster_name, "Cluster removed");
            Ok(report)
        } else {
            Err(OrchestratorError::RemovalIncomplete {
                failed: report.failed_addresses(),
                report,
            })
        }
    }

    fn rollback_manager(&self) -> RollbackManager {
        RollbackManager::new(
            Arc::clone(&self.installer),
            self.events.clone(),
            self.config.parallelism,
        )
    }

    /// Everything that must hold before the first remote mutation.
    async fn validate_and_connect(
        &self,
        topology: &Topology,
        nodes: &[Node],
        confirmation: Option<ConfirmationKind>,
        staging: Option<&StagingCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<SessionSet> {
        self.validator.validate(topology)?;

        if let Some(staging) = staging {
            staging
                .check_artifacts()
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        }

        if let Some(kind) = confirmation {
            let prompt = ConfirmationPrompt::new(kind, topology);
            if !self.gate.confirm(&prompt).await {
                info!(cluster = %topology.cluster_name, "Declined by operator");
                return Err(OrchestratorError::AbortedByUser);
            }
        }

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled {
                phase: DeploymentPhase::Validating,
            });
        }

        SessionSet::open_all(Arc::clone(&self.connector), nodes, self.config.parallelism).await
    }

    /// Failure before any node was touched: no rollback, nothing to clean.
    fn fail_untouched(&self, run: &DeploymentRun, cause: OrchestratorError) -> DeployFailure {
        if cause.is_aborted_by_user() {
            info!(run_id = %run.id(), "Deployment aborted by user");
        } else {
            error!(run_id = %run.id(), error = %cause, "Deployment rejected before touching any node");
        }

        let phase = run.phase();
        if let Ok(from) = run.transition(DeploymentPhase::Failed) {
            self.events.publish(Event::PhaseChanged {
                run_id: run.id(),
                from,
                to: DeploymentPhase::Failed,
            });
        }
        self.finish(run);

        DeployFailure {
            run_id: run.id(),
            phase,
            cause,
            rollback: None,
            cleanup: CleanupReport::default(),
        }
    }

    fn finish(&self, run: &DeploymentRun) {
        self.events.publish(Event::RunFinished {
            run_id: run.id(),
            phase: run.phase(),
        });
    }

    async fn drive(
        &self,
        scope: &RunScope,
        topology: &Topology,
        nodes: &[Node],
        mode: DeployMode,
    ) -> Result<Vec<String>> {
        scope.advance(DeploymentPhase::Staging)?;
        self.stage_all(scope, nodes).await?;
        scope.checkpoint()?;

        scope.advance(DeploymentPhase::PreflightChecking)?;
        self.preflight_all(scope, nodes, false).await?;
        if mode == DeployMode::CheckOnly {
            self.preflight_all(scope, nodes, true).await?;
            scope.advance(DeploymentPhase::Completed)?;
            return Ok(Vec::new());
        }
        scope.checkpoint()?;

        scope.advance(DeploymentPhase::Installing)?;
        let seed = topology.seed_node();
        let seed_ctx = scope.context(&seed)?;
        install_node(scope, &seed).await?;
        scope
            .installer
            .wait_ready(&seed_ctx)
            .await
            .map_err(|source| OrchestratorError::Install {
                address: seed.address().to_string(),
                role: seed.role,
                source,
            })?;
        info!(run_id = %scope.run_id(), address = %seed.address(), "Seed is accepting connections");
        scope.checkpoint()?;

        self.install_batch(scope, topology.secondary_nodes()).await?;
        self.install_batch(scope, topology.auxiliary_nodes()).await?;
        scope.checkpoint()?;

        scope.advance(DeploymentPhase::BootstrappingReplication)?;
        let credential = ReplicationCredential::generate(&self.config.replication_user);
        scope.run.set_credential(credential.clone());
        self.bootstrap(scope, topology, &seed_ctx, &credential).await?;
        scope.checkpoint()?;

        scope.advance(DeploymentPhase::Verifying)?;
        let expected: Vec<_> = topology
            .secondaries
            .iter()
            .map(|spec| self.validator.identity(&spec.address))
            .collect();
        let replicas = ReplicaVerifier::new(self.config.verify_poll_interval, self.config.verify_timeout)
            .verify(scope.installer.as_ref(), &seed_ctx, &expected, &scope.cancel)
            .await?;
        scope.publish(Event::ReplicasVerified {
            run_id: scope.run_id(),
            replicas: replicas.clone(),
        });

        scope.advance(DeploymentPhase::Completed)?;
        Ok(replicas)
    }

    async fn stage_all(&self, scope: &RunScope, nodes: &[Node]) -> Result<()> {
        let stop = scope.cancel.child_token();
        let mut tasks = NodeTaskSet::new(self.config.parallelism);

        for node in nodes {
            let scope = scope.clone();
            let node = node.clone();
            let stop = stop.clone();
            tasks.spawn(async move {
                if stop.is_cancelled() {
                    return NodeOutcome::Skipped;
                }
                match stage_node(&scope, &node).await {
                    Ok(()) => NodeOutcome::Done,
                    Err(e) => {
                        stop.cancel();
                        NodeOutcome::Failed(e)
                    }
                }
            });
        }

        settle(tasks.join_all().await, DeploymentPhase::Staging)
    }

    /// Environment checks on every node, or install dry runs with `dry_run`.
    ///
    /// Every node is checked even after one fails so the events show the
    /// complete picture; nothing here mutates a node.
    async fn preflight_all(&self, scope: &RunScope, nodes: &[Node], dry_run: bool) -> Result<()> {
        let mut tasks = NodeTaskSet::new(self.config.parallelism);

        for node in nodes {
            let scope = scope.clone();
            let node = node.clone();
            tasks.spawn(async move {
                if scope.cancel.is_cancelled() {
                    return NodeOutcome::Skipped;
                }
                match preflight_node(&scope, &node, dry_run).await {
                    Ok(()) => NodeOutcome::Done,
                    Err(e) => NodeOutcome::Failed(e),
                }
            });
        }

        settle(tasks.join_all().await, DeploymentPhase::PreflightChecking)
    }

    /// Install a group of same-role nodes concurrently.
    ///
    /// After the first failure no further install starts; installs already
    /// running are waited for so their outcome is known before rollback.
    async fn install_batch(&self, scope: &RunScope, nodes: Vec<Node>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        let stop = scope.cancel.child_token();
        let mut tasks = NodeTaskSet::new(self.config.parallelism);

        for node in nodes {
            let scope = scope.clone();
            let stop = stop.clone();
            tasks.spawn(async move {
                if stop.is_cancelled() {
                    return NodeOutcome::Skipped;
                }
                match install_node(&scope, &node).await {
                    Ok(()) => NodeOutcome::Done,
                    Err(e) => {
                        stop.cancel();
                        NodeOutcome::Failed(e)
                    }
                }
            });
        }

        settle(tasks.join_all().await, DeploymentPhase::Installing)
    }

    async fn bootstrap(
        &self,
        scope: &RunScope,
        topology: &Topology,
        seed_ctx: &InstallContext,
        credential: &ReplicationCredential,
    ) -> Result<()> {
        let seed = &seed_ctx.node;
        let replicas = topology.secondary_addresses();

        scope
            .installer
            .create_replication_user(seed_ctx, credential, &replicas)
            .await
            .map_err(|e| OrchestratorError::bootstrap(seed.address(), e))?;
        info!(run_id = %scope.run_id(), replicas = ?replicas, "Replication access configured on seed");

        for secondary in topology.secondary_nodes() {
            scope.checkpoint()?;
            let ctx = scope.context(&secondary)?;
            scope
                .installer
                .clone_from_seed(&ctx, seed, credential)
                .await
                .map_err(|e| OrchestratorError::bootstrap(secondary.address(), e))?;

            info!(run_id = %scope.run_id(), address = %secondary.address(), "Replica cloned from seed");
            scope.publish(Event::ReplicaCloned {
                run_id: scope.run_id(),
                address: secondary.address().to_string(),
            });
        }

        for auxiliary in topology.auxiliary_nodes() {
            scope.checkpoint()?;
            let ctx = scope.context(&auxiliary)?;
            scope
                .installer
                .attach_auxiliary(&ctx, seed, credential)
                .await
                .map_err(|e| OrchestratorError::bootstrap(auxiliary.address(), e))?;
            info!(run_id = %scope.run_id(), address = %auxiliary.address(), role = %auxiliary.role, "Auxiliary attached");
        }

        Ok(())
    }

    /// Move a failed run to its terminal phase, uninstalling whatever it installed.
    async fn unwind(
        &self,
        scope: &RunScope,
        failed_phase: DeploymentPhase,
        cause: &OrchestratorError,
    ) -> Option<RollbackReport> {
        let mut report = None;

        if PhaseStateMachine::failure_target(&failed_phase) == DeploymentPhase::RollingBack {
            if let Err(e) = scope.advance(DeploymentPhase::RollingBack) {
                warn!(error = %e, "Cannot enter rollback phase");
            }
            let rollback_scope = scope.run.take_rollback_scope();
            if !rollback_scope.is_empty() {
                report = Some(
                    self.rollback_manager()
                        .rollback(scope.run_id(), &rollback_scope, &scope.sessions, &cause.to_string())
                        .await,
                );
            }
        }

        if let Err(e) = scope.advance(DeploymentPhase::Failed) {
            warn!(error = %e, "Cannot mark run failed");
        }
        report
    }

    /// Remove every staging directory this run created, on success and failure alike.
    async fn cleanup(&self, scope: &RunScope, nodes: &[Node]) -> CleanupReport {
        let staged = scope.run.staged_addresses();
        let mut tasks = NodeTaskSet::new(self.config.parallelism);

        for node in nodes.iter().filter(|n| staged.iter().any(|a| a == n.address())) {
            let scope = scope.clone();
            let node = node.clone();
            tasks.spawn(async move { cleanup_node(&scope, &node).await });
        }

        let entries = tasks.join_all().await;
        for entry in &entries {
            scope.publish(Event::StagingCleaned {
                run_id: scope.run_id(),
                address: entry.address.clone(),
                success: entry.removed,
            });
        }
        CleanupReport { entries }
    }
}

async fn stage_node(scope: &RunScope, node: &Node) -> Result<()> {
    let session = scope.session(node)?;
    let stage_error = |source| OrchestratorError::Stage {
        address: node.address().to_string(),
        source,
    };

    let staged = scope
        .staging
        .prepare(session.as_ref())
        .await
        .map_err(stage_error)?;
    scope.run.mark_staged(node.address());

    scope
        .staging
        .upload_artifacts(session.as_ref(), &staged)
        .await
        .map_err(stage_error)?;

    info!(run_id = %scope.run_id(), address = %node.address(), "Node staged");
    scope.publish(Event::NodeStaged {
        run_id: scope.run_id(),
        address: node.address().to_string(),
    });
    Ok(())
}

async fn preflight_node(scope: &RunScope, node: &Node, dry_run: bool) -> Result<()> {
    let ctx = scope.context(node)?;
    let checked = if dry_run {
        scope.installer.install(&ctx, true).await
    } else {
        scope.installer.check_environment(&ctx).await
    };

    match checked {
        Ok(()) => {
            if !dry_run {
                scope.publish(Event::PreflightPassed {
                    run_id: scope.run_id(),
                    address: node.address().to_string(),
                });
            }
            Ok(())
        }
        Err(e) => {
            warn!(run_id = %scope.run_id(), address = %node.address(), error = %e, "Preflight check failed");
            scope.publish(Event::PreflightFailed {
                run_id: scope.run_id(),
                address: node.address().to_string(),
                reason: e.to_string(),
            });
            Err(OrchestratorError::Preflight {
                address: node.address().to_string(),
                reason: e.to_string(),
            })
        }
    }
}

async fn install_node(scope: &RunScope, node: &Node) -> Result<()> {
    let ctx = scope.context(node)?;
    info!(run_id = %scope.run_id(), address = %node.address(), role = %node.role, "Installing node");
    scope.publish(Event::NodeInstallStarted {
        run_id: scope.run_id(),
        address: node.address().to_string(),
        role: node.role,
    });

    match scope.installer.install(&ctx, false).await {
        Ok(()) => {
            scope.run.mark_installed(node);
            info!(run_id = %scope.run_id(), address = %node.address(), "Node installed");
            scope.publish(Event::NodeInstalled {
                run_id: scope.run_id(),
                address: node.address().to_string(),
                role: node.role,
            });
            Ok(())
        }
        Err(source) => {
            scope.run.mark_install_failed(node);
            error!(run_id = %scope.run_id(), address = %node.address(), error = %source, "Install failed");
            scope.publish(Event::NodeInstallFailed {
                run_id: scope.run_id(),
                address: node.address().to_string(),
                role: node.role,
                reason: source.to_string(),
            });
            Err(OrchestratorError::Install {
                address: node.address().to_string(),
                role: node.role,
                source,
            })
        }
    }
}

/// Best effort: one retry over a fresh session, then record the failure.
async fn cleanup_node(scope: &RunScope, node: &Node) -> CleanupEntry {
    let mut entry = CleanupEntry {
        address: node.address().to_string(),
        removed: false,
        reopened: false,
        error: None,
    };

    let first_attempt = match scope.sessions.get(node.address()) {
        Some(session) => scope
            .staging
            .cleanup(session.as_ref())
            .await
            .map_err(|e| e.to_string()),
        None => Err("no open session".to_string()),
    };

    let reason = match first_attempt {
        Ok(()) => {
            entry.removed = true;
            return entry;
        }
        Err(reason) => reason,
    };
    warn!(address = %node.address(), error = %reason, "Staging cleanup failed, reconnecting");

    let retried = match scope.sessions.reopen(node).await {
        Ok(session) => {
            entry.reopened = true;
            scope
                .staging
                .cleanup(session.as_ref())
                .await
                .map_err(|e| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    };

    match retried {
        Ok(()) => entry.removed = true,
        Err(e) => {
            error!(address = %node.address(), dir = %scope.staging.dir(), error = %e, "Staging directory left behind");
            entry.error = Some(e);
        }
    }
    entry
}
