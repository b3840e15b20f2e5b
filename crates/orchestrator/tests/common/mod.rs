#![allow(dead_code)]

use async_trait::async_trait;
use cluster_core::{HostResolver, Node, NodeSpec, SyntaxOnlyResolver, Topology, TopologyValidator};
use events::{drain, Event, EventEnvelope, EventBus};
use orchestrator::{
    DeploymentOrchestrator, FixedAnswer, InstallContext, InstallResult, InstallerError,
    NodeInstaller, OrchestratorConfig, ReplicationCredential,
};
use remote::{CommandOutput, Connector, RemoteError, RemoteSession, SessionTimeouts};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const SEED: &str = "10.0.0.1";
pub const SECONDARY_A: &str = "10.0.0.2";
pub const SECONDARY_B: &str = "10.0.0.3";
pub const STAGING_DIR: &str = "/tmp/clusterforge-staging";

pub fn spec(address: &str) -> NodeSpec {
    NodeSpec::new(address, 5432, "/var/lib/engine").with_password("hunter2")
}

/// Seed 10.0.0.1 with secondaries 10.0.0.2 and 10.0.0.3.
pub fn topology() -> Topology {
    Topology::new("orders", "postgres", spec(SEED))
        .with_secondary(spec(SECONDARY_A))
        .with_secondary(spec(SECONDARY_B))
}

pub fn validator() -> TopologyValidator {
    TopologyValidator::new()
        .with_resolver(Arc::new(SyntaxOnlyResolver))
        .with_key_file_check(false)
}

/// Resolves names from a fixed table; other names do not resolve.
pub struct HostTable(HashMap<String, Ipv4Addr>);

impl HostTable {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(name, ip)| (name.to_string(), ip.parse().unwrap()))
                .collect(),
        )
    }
}

impl HostResolver for HostTable {
    fn lookup(&self, host: &str) -> Option<Vec<Ipv4Addr>> {
        Some(self.0.get(host).copied().into_iter().collect())
    }
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig::default().with_verify_timing(Duration::from_secs(1), Duration::from_secs(5))
}

/// Orchestrator wired to fakes, plus a subscription opened before any event.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub installer: Arc<RecordingInstaller>,
    pub orchestrator: DeploymentOrchestrator,
    pub receiver: broadcast::Receiver<EventEnvelope>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(RecordingInstaller::new(), config())
    }

    pub fn with(installer: RecordingInstaller, config: OrchestratorConfig) -> Self {
        Self::build(FakeCluster::new(), installer, config)
    }

    pub fn build(
        cluster: Arc<FakeCluster>,
        installer: RecordingInstaller,
        config: OrchestratorConfig,
    ) -> Self {
        let installer = Arc::new(installer);
        let events = EventBus::new();
        let receiver = events.subscribe();

        let orchestrator = DeploymentOrchestrator::new(
            Arc::new(FakeConnector::new(Arc::clone(&cluster))),
            Arc::clone(&installer) as Arc<dyn NodeInstaller>,
        )
        .with_validator(validator())
        .with_event_bus(events)
        .with_config(config);

        Self {
            cluster,
            installer,
            orchestrator,
            receiver,
        }
    }

    pub fn with_validator(mut self, validator: TopologyValidator) -> Self {
        self.orchestrator = self.orchestrator.with_validator(validator);
        self
    }

    pub fn answering(mut self, answer: &str) -> Self {
        self.orchestrator = self
            .orchestrator
            .with_gate(Arc::new(FixedAnswer::new(answer)));
        self
    }

    pub fn events(&mut self) -> Vec<Event> {
        drain(&mut self.receiver).into_iter().map(|e| e.event).collect()
    }
}

pub fn no_cancel() -> CancellationToken {
    CancellationToken::new()
}

/// Index of the first event matching `pred`.
pub fn position(events: &[Event], pred: impl Fn(&Event) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct HostState {
    pub entries: BTreeMap<String, Entry>,
    pub commands: Vec<String>,
    pub down: bool,
    pub failing_removals: usize,
    pub failing_closes: bool,
    pub closes: usize,
    pub opens: usize,
}

/// In-memory hosts shared by every session the fake connector hands out.
#[derive(Debug, Default)]
pub struct FakeCluster {
    hosts: Mutex<HashMap<String, HostState>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(host.to_string()).or_default())
    }

    pub fn add_dir(&self, host: &str, path: &str) {
        self.with_host(host, |h| h.entries.insert(path.to_string(), Entry::Dir));
    }

    pub fn add_file(&self, host: &str, path: &str, contents: &[u8]) {
        self.with_host(host, |h| {
            h.entries.insert(path.to_string(), Entry::File(contents.to_vec()))
        });
    }

    pub fn exists(&self, host: &str, path: &str) -> bool {
        self.with_host(host, |h| h.entries.contains_key(path))
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.with_host(host, |h| match h.entries.get(path) {
            Some(Entry::File(contents)) => Some(contents.clone()),
            _ => None,
        })
    }

    /// True when nothing was ever created on or run against the host.
    pub fn untouched(&self, host: &str) -> bool {
        self.with_host(host, |h| h.entries.is_empty() && h.commands.is_empty())
    }

    pub fn set_down(&self, host: &str, down: bool) {
        self.with_host(host, |h| h.down = down);
    }

    pub fn fail_removals(&self, host: &str, count: usize) {
        self.with_host(host, |h| h.failing_removals = count);
    }

    /// Every session close on `host` reports an error.
    pub fn fail_closes(&self, host: &str) {
        self.with_host(host, |h| h.failing_closes = true);
    }

    pub fn closes(&self, host: &str) -> usize {
        self.with_host(host, |h| h.closes)
    }

    pub fn opens(&self, host: &str) -> usize {
        self.with_host(host, |h| h.opens)
    }

    pub fn total_opens(&self) -> usize {
        self.hosts.lock().unwrap().values().map(|h| h.opens).sum()
    }
}

pub struct FakeConnector {
    cluster: Arc<FakeCluster>,
}

impl FakeConnector {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, node: &NodeSpec) -> remote::Result<Arc<dyn RemoteSession>> {
        let reachable = self.cluster.with_host(&node.address, |h| {
            if h.down {
                return false;
            }
            h.opens += 1;
            true
        });
        if !reachable {
            return Err(RemoteError::connect(&node.address, "No route to host"));
        }

        Ok(Arc::new(FakeSession {
            host: node.address.clone(),
            cluster: Arc::clone(&self.cluster),
        }))
    }
}

pub struct FakeSession {
    host: String,
    cluster: Arc<FakeCluster>,
}

impl FakeSession {
    fn on_host<T>(&self, f: impl FnOnce(&mut HostState) -> remote::Result<T>) -> remote::Result<T> {
        self.cluster.with_host(&self.host, |h| {
            if h.down {
                return Err(RemoteError::connect(&self.host, "Connection reset by peer"));
            }
            f(h)
        })
    }
}

fn is_child(parent: &str, path: &str) -> bool {
    path.len() > parent.len() + 1
        && path.starts_with(parent)
        && path.as_bytes()[parent.len()] == b'/'
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts::default()
    }

    async fn run(&self, command: &str, _timeout: Duration) -> remote::Result<CommandOutput> {
        self.on_host(|h| {
            h.commands.push(command.to_string());
            Ok(CommandOutput::default())
        })
    }

    async fn run_privileged(&self, command: &str, timeout: Duration) -> remote::Result<CommandOutput> {
        self.run(command, timeout).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> remote::Result<()> {
        let contents = std::fs::read(local)?;
        self.on_host(|h| {
            h.entries.insert(remote.to_string(), Entry::File(contents));
            Ok(())
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> remote::Result<()> {
        self.on_host(|h| {
            h.entries.insert(path.to_string(), Entry::File(contents.to_vec()));
            Ok(())
        })
    }

    async fn path_exists(&self, path: &str) -> remote::Result<bool> {
        self.on_host(|h| Ok(h.entries.contains_key(path)))
    }

    async fn is_dir(&self, path: &str) -> remote::Result<bool> {
        self.on_host(|h| Ok(h.entries.get(path) == Some(&Entry::Dir)))
    }

    async fn is_empty_dir(&self, path: &str) -> remote::Result<bool> {
        self.on_host(|h| {
            Ok(h.entries.get(path) == Some(&Entry::Dir)
                && !h.entries.keys().any(|p| is_child(path, p)))
        })
    }

    async fn list_dir(&self, path: &str) -> remote::Result<Vec<String>> {
        let prefix = format!("{path}/");
        self.on_host(|h| {
            Ok(h.entries
                .keys()
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect())
        })
    }

    async fn make_dir(&self, path: &str) -> remote::Result<()> {
        self.on_host(|h| {
            h.entries.insert(path.to_string(), Entry::Dir);
            Ok(())
        })
    }

    async fn set_permissions(&self, path: &str, _mode: u32) -> remote::Result<()> {
        self.on_host(|h| {
            if h.entries.contains_key(path) {
                Ok(())
            } else {
                Err(RemoteError::InvalidPath(path.to_string()))
            }
        })
    }

    async fn remove_path(&self, path: &str) -> remote::Result<()> {
        let host = self.host.clone();
        self.on_host(|h| {
            if h.failing_removals > 0 {
                h.failing_removals -= 1;
                return Err(RemoteError::CommandFailed {
                    host,
                    command: format!("rm -rf -- {path}"),
                    status: Some(1),
                    stderr: "Device or resource busy".to_string(),
                });
            }
            h.entries.retain(|p, _| p != path && !is_child(path, p));
            Ok(())
        })
    }

    async fn close(&self) -> remote::Result<()> {
        let host = self.host.clone();
        self.cluster.with_host(&self.host, |h| {
            h.closes += 1;
            if h.failing_closes {
                return Err(RemoteError::connect(host, "Broken pipe"));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Check,
    Install,
    CheckInstall,
    Ready,
    Uninstall,
    Grant,
    Clone,
    Attach,
}

type InstallHook = Box<dyn Fn() + Send + Sync>;

/// Installer that records every call and fails on request.
#[derive(Default)]
pub struct RecordingInstaller {
    trace: Mutex<Vec<String>>,
    failures: HashSet<(Step, String)>,
    cloned: Mutex<Vec<String>>,
    reported_replicas: Option<Vec<String>>,
    after_install: Option<(String, InstallHook)>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, step: Step, address: &str) -> Self {
        self.failures.insert((step, address.to_string()));
        self
    }

    /// Report a fixed replica list instead of the cloned secondaries.
    pub fn reporting_replicas(mut self, replicas: &[&str]) -> Self {
        self.reported_replicas = Some(replicas.iter().map(|r| r.to_string()).collect());
        self
    }

    /// Run `hook` once the install on `address` returns, whatever its outcome.
    pub fn on_install(mut self, address: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_install = Some((address.to_string(), Box::new(hook)));
        self
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    /// Addresses recorded for `step`, in call order.
    pub fn calls(&self, step: &str) -> Vec<String> {
        let prefix = format!("{step}:");
        self.trace()
            .iter()
            .filter_map(|t| t.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, step: &str, address: &str) {
        self.trace.lock().unwrap().push(format!("{step}:{address}"));
    }

    fn outcome(&self, step: Step, address: &str) -> InstallResult {
        if self.failures.contains(&(step, address.to_string())) {
            return Err(InstallerError::Failed(format!("{step:?} failed on {address}")));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeInstaller for RecordingInstaller {
    async fn check_environment(&self, ctx: &InstallContext) -> InstallResult {
        self.record("check", ctx.address());
        self.outcome(Step::Check, ctx.address())
    }

    async fn install(&self, ctx: &InstallContext, only_check: bool) -> InstallResult {
        if only_check {
            self.record("check_install", ctx.address());
            return self.outcome(Step::CheckInstall, ctx.address());
        }

        self.record("install", ctx.address());
        tokio::task::yield_now().await;
        let outcome = self.outcome(Step::Install, ctx.address());
        if outcome.is_ok() {
            self.record("installed", ctx.address());
        }
        if let Some((address, hook)) = &self.after_install {
            if address == ctx.address() {
                hook();
            }
        }
        outcome
    }

    async fn wait_ready(&self, ctx: &InstallContext) -> InstallResult {
        self.record("ready", ctx.address());
        self.outcome(Step::Ready, ctx.address())
    }

    async fn uninstall(&self, session: &dyn RemoteSession, _port: u16, _data_dir: &str) -> InstallResult {
        self.record("uninstall", session.host());
        self.outcome(Step::Uninstall, session.host())
    }

    async fn create_replication_user(
        &self,
        seed: &InstallContext,
        _credential: &ReplicationCredential,
        replica_addresses: &[String],
    ) -> InstallResult {
        self.record("grant", seed.address());
        for replica in replica_addresses {
            self.record("grant_to", replica);
        }
        self.outcome(Step::Grant, seed.address())
    }

    async fn clone_from_seed(
        &self,
        replica: &InstallContext,
        _seed: &Node,
        _credential: &ReplicationCredential,
    ) -> InstallResult {
        self.record("clone", replica.address());
        self.outcome(Step::Clone, replica.address())?;
        self.cloned.lock().unwrap().push(replica.address().to_string());
        Ok(())
    }

    async fn attach_auxiliary(
        &self,
        auxiliary: &InstallContext,
        _seed: &Node,
        _credential: &ReplicationCredential,
    ) -> InstallResult {
        self.record("attach", auxiliary.address());
        self.outcome(Step::Attach, auxiliary.address())
    }

    async fn connected_replicas(&self, seed: &InstallContext) -> InstallResult<Vec<String>> {
        self.record("replicas", seed.address());
        Ok(match &self.reported_replicas {
            Some(replicas) => replicas.clone(),
            None => self.cloned.lock().unwrap().clone(),
        })
    }
}
