//! Installer driven by shell command templates from configuration.
//!
//! Each contract step maps to a hook under `engine_parameters.hooks`. Hooks
//! may reference `{placeholder}` names; values are substituted as single
//! quoted shell words. `${VAR}` is left for the remote shell.

use async_trait::async_trait;
use cluster_core::{Node, Topology};
use regex::{Captures, Regex};
use remote::shell::quote;
use remote::RemoteSession;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::InstallerError;
use crate::installer::{InstallContext, InstallResult, NodeInstaller};
use crate::run::ReplicationCredential;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptHooks {
    #[serde(default)]
    pub check: Option<String>,
    pub install: String,
    #[serde(default)]
    pub check_install: Option<String>,
    #[serde(default)]
    pub ready: Option<String>,
    pub uninstall: String,
    pub create_replication_user: String,
    pub clone: String,
    #[serde(default)]
    pub attach: Option<String>,
    pub connected_replicas: String,
}

fn default_ready_timeout() -> u64 {
    120
}

fn default_ready_interval() -> u64 {
    2
}

#[derive(Debug, Deserialize)]
struct ScriptParameters {
    hooks: ScriptHooks,
    #[serde(default = "default_ready_timeout")]
    ready_timeout_secs: u64,
    #[serde(default = "default_ready_interval")]
    ready_interval_secs: u64,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\$?)\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid placeholder regex pattern")
    })
}

/// Substitute `{name}` placeholders with quoted values.
pub fn render(hook: &str, template: &str, vars: &HashMap<String, String>) -> InstallResult<String> {
    let mut unknown = None;
    let rendered = placeholder_pattern().replace_all(template, |caps: &Captures| {
        if !caps[1].is_empty() {
            return caps[0].to_string();
        }
        match vars.get(&caps[2]) {
            Some(value) => quote(value),
            None => {
                unknown.get_or_insert_with(|| caps[2].to_string());
                caps[0].to_string()
            }
        }
    });

    match unknown {
        Some(placeholder) => Err(InstallerError::UnknownPlaceholder {
            hook: hook.to_string(),
            placeholder,
        }),
        None => Ok(rendered.into_owned()),
    }
}

pub struct ScriptInstaller {
    hooks: ScriptHooks,
    staging_dir: String,
    seed: Node,
    secondaries: Vec<String>,
    parameters: HashMap<String, String>,
    ready_timeout: Duration,
    ready_interval: Duration,
}

impl ScriptInstaller {
    pub fn from_topology(topology: &Topology) -> InstallResult<Self> {
        let params: ScriptParameters =
            serde_json::from_value(Value::Object(topology.engine_parameters.clone()))
                .map_err(|e| InstallerError::InvalidParameters(e.to_string()))?;

        Ok(Self {
            hooks: params.hooks,
            staging_dir: topology.staging_dir.clone(),
            seed: topology.seed_node(),
            secondaries: topology.secondary_addresses(),
            parameters: scalar_parameters(&topology.engine_parameters),
            ready_timeout: Duration::from_secs(params.ready_timeout_secs),
            ready_interval: Duration::from_secs(params.ready_interval_secs.max(1)),
        })
    }

    pub fn hooks(&self) -> &ScriptHooks {
        &self.hooks
    }

    fn base_vars(&self) -> HashMap<String, String> {
        let mut vars = self.parameters.clone();
        vars.insert("staging_dir".into(), self.staging_dir.clone());
        vars.insert("seed_address".into(), self.seed.address().to_string());
        vars.insert("seed_port".into(), self.seed.service_port().to_string());
        vars.insert("replica_addresses".into(), self.secondaries.join(","));
        vars
    }

    fn node_vars(&self, node: &Node) -> HashMap<String, String> {
        let mut vars = self.base_vars();
        vars.insert("address".into(), node.address().to_string());
        vars.insert("role".into(), node.role.as_str().to_string());
        vars.insert("service_port".into(), node.service_port().to_string());
        vars.insert("data_dir".into(), node.data_dir().to_string());
        vars
    }

    fn with_credential(
        mut vars: HashMap<String, String>,
        credential: &ReplicationCredential,
    ) -> HashMap<String, String> {
        vars.insert("replication_user".into(), credential.user.clone());
        vars.insert("replication_password".into(), credential.password().to_string());
        vars
    }

    async fn run_hook(
        &self,
        session: &dyn RemoteSession,
        hook: &str,
        template: &str,
        vars: &HashMap<String, String>,
    ) -> InstallResult<String> {
        let command = render(hook, template, vars)?;
        debug!(host = %session.host(), hook = %hook, "Running installer hook");
        let output = session.exec_long(&command).await?;
        Ok(output.stdout)
    }

    async fn default_environment_check(&self, ctx: &InstallContext) -> InstallResult {
        let data_dir = ctx.node.data_dir();
        if ctx.session.path_exists(data_dir).await? && !ctx.session.is_empty_dir(data_dir).await? {
            return Err(InstallerError::Environment(format!(
                "data directory {data_dir} exists and is not empty"
            )));
        }
        Ok(())
    }
}

fn scalar_parameters(parameters: &Map<String, Value>) -> HashMap<String, String> {
    parameters
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), text))
        })
        .collect()
}

#[async_trait]
impl NodeInstaller for ScriptInstaller {
    async fn check_environment(&self, ctx: &InstallContext) -> InstallResult {
        self.default_environment_check(ctx).await?;
        if let Some(check) = &self.hooks.check {
            self.run_hook(ctx.session.as_ref(), "check", check, &self.node_vars(&ctx.node))
                .await
                .map_err(|e| InstallerError::Environment(e.to_string()))?;
        }
        Ok(())
    }

    async fn install(&self, ctx: &InstallContext, only_check: bool) -> InstallResult {
        let vars = self.node_vars(&ctx.node);
        if only_check {
            return match &self.hooks.check_install {
                Some(hook) => self
                    .run_hook(ctx.session.as_ref(), "check_install", hook, &vars)
                    .await
                    .map(|_| ()),
                None => self.check_environment(ctx).await,
            };
        }

        self.run_hook(ctx.session.as_ref(), "install", &self.hooks.install, &vars)
            .await?;
        info!(address = %ctx.address(), role = %ctx.node.role, "Install hook finished");
        Ok(())
    }

    async fn wait_ready(&self, ctx: &InstallContext) -> InstallResult {
        let Some(ready) = &self.hooks.ready else {
            return Ok(());
        };
        let command = render("ready", ready, &self.node_vars(&ctx.node))?;
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            match ctx.session.exec(&command).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() + self.ready_interval > deadline => {
                    return Err(InstallerError::Timeout(format!(
                        "{} to accept connections: {e}",
                        ctx.address()
                    )));
                }
                Err(e) => debug!(address = %ctx.address(), error = %e, "Not ready yet"),
            }
            tokio::time::sleep(self.ready_interval).await;
        }
    }

    async fn uninstall(
        &self,
        session: &dyn RemoteSession,
        service_port: u16,
        data_dir: &str,
    ) -> InstallResult {
        let mut vars = self.base_vars();
        vars.insert("address".into(), session.host().to_string());
        vars.insert("service_port".into(), service_port.to_string());
        vars.insert("data_dir".into(), data_dir.to_string());

        self.run_hook(session, "uninstall", &self.hooks.uninstall, &vars)
            .await
            .map(|_| ())
    }

    async fn create_replication_user(
        &self,
        seed: &InstallContext,
        credential: &ReplicationCredential,
        replica_addresses: &[String],
    ) -> InstallResult {
        let mut vars = Self::with_credential(self.node_vars(&seed.node), credential);
        vars.insert("replica_addresses".into(), replica_addresses.join(","));

        self.run_hook(
            seed.session.as_ref(),
            "create_replication_user",
            &self.hooks.create_replication_user,
            &vars,
        )
        .await
        .map(|_| ())
    }

    async fn clone_from_seed(
        &self,
        replica: &InstallContext,
        seed: &Node,
        credential: &ReplicationCredential,
    ) -> InstallResult {
        let mut vars = Self::with_credential(self.node_vars(&replica.node), credential);
        vars.insert("seed_address".into(), seed.address().to_string());
        vars.insert("seed_port".into(), seed.service_port().to_string());

        self.run_hook(replica.session.as_ref(), "clone", &self.hooks.clone, &vars)
            .await
            .map(|_| ())
    }

    async fn attach_auxiliary(
        &self,
        auxiliary: &InstallContext,
        seed: &Node,
        credential: &ReplicationCredential,
    ) -> InstallResult {
        let Some(attach) = &self.hooks.attach else {
            return Ok(());
        };
        let mut vars = Self::with_credential(self.node_vars(&auxiliary.node), credential);
        vars.insert("seed_address".into(), seed.address().to_string());
        vars.insert("seed_port".into(), seed.service_port().to_string());

        self.run_hook(auxiliary.session.as_ref(), "attach", attach, &vars)
            .await
            .map(|_| ())
    }

    async fn connected_replicas(&self, seed: &InstallContext) -> InstallResult<Vec<String>> {
        let stdout = self
            .run_hook(
                seed.session.as_ref(),
                "connected_replicas",
                &self.hooks.connected_replicas,
                &self.node_vars(&seed.node),
            )
            .await?;

        Ok(stdout
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}
