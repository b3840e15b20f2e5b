use async_trait::async_trait;
use cluster_core::{Node, Topology};
use remote::RemoteSession;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::InstallerError;
use crate::run::ReplicationCredential;

pub type InstallResult<T = ()> = std::result::Result<T, InstallerError>;

/// Everything an installer needs to act on one node.
#[derive(Clone)]
pub struct InstallContext {
    pub session: Arc<dyn RemoteSession>,
    pub node: Node,
    pub staging_dir: String,
    pub engine_parameters: Arc<Map<String, Value>>,
}

impl InstallContext {
    pub fn new(session: Arc<dyn RemoteSession>, node: Node, topology: &Topology) -> Self {
        Self {
            session,
            node,
            staging_dir: topology.staging_dir.clone(),
            engine_parameters: Arc::new(topology.engine_parameters.clone()),
        }
    }

    pub fn address(&self) -> &str {
        self.node.address()
    }
}

/// Engine-specific installation recipe.
///
/// The orchestrator decides when each step runs and on which node; an
/// implementation only knows how to perform it over the given session.
#[async_trait]
pub trait NodeInstaller: Send + Sync {
    /// Non-mutating readiness check (port free, data directory empty, dependencies present)
    async fn check_environment(&self, ctx: &InstallContext) -> InstallResult;

    /// Install and start the service; with `only_check` only verify that it could be
    async fn install(&self, ctx: &InstallContext, only_check: bool) -> InstallResult;

    /// Block until a freshly installed node accepts connections
    async fn wait_ready(&self, _ctx: &InstallContext) -> InstallResult {
        Ok(())
    }

    /// Stop the service on `service_port` and remove `data_dir`
    async fn uninstall(
        &self,
        session: &dyn RemoteSession,
        service_port: u16,
        data_dir: &str,
    ) -> InstallResult;

    /// Create the replication login on the seed and allow the given replica addresses
    async fn create_replication_user(
        &self,
        seed: &InstallContext,
        credential: &ReplicationCredential,
        replica_addresses: &[String],
    ) -> InstallResult;

    /// Initialize a secondary from the seed's data and start replicating
    async fn clone_from_seed(
        &self,
        replica: &InstallContext,
        seed: &Node,
        credential: &ReplicationCredential,
    ) -> InstallResult;

    /// Join an arbiter, witness or proxy to the running cluster
    async fn attach_auxiliary(
        &self,
        _auxiliary: &InstallContext,
        _seed: &Node,
        _credential: &ReplicationCredential,
    ) -> InstallResult {
        Ok(())
    }

    /// Addresses of replicas currently streaming from the seed
    async fn connected_replicas(&self, seed: &InstallContext) -> InstallResult<Vec<String>>;
}
