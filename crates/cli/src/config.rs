use anyhow::{Context, Result};
use cluster_core::{Topology, TopologyValidator, DEFAULT_MAX_SECONDARIES};
use orchestrator::{OrchestratorConfig, DEFAULT_PARALLELISM, DEFAULT_REPLICATION_USER};
use remote::{Artifact, HostKeyPolicy, SessionTimeouts, SshConnector};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment tuning from the `[deploy]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploySettings {
    pub max_secondaries: usize,
    pub parallelism: usize,
    pub verify_poll_interval_secs: u64,
    pub verify_timeout_secs: u64,
    pub replication_user: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            max_secondaries: DEFAULT_MAX_SECONDARIES,
            parallelism: DEFAULT_PARALLELISM,
            verify_poll_interval_secs: 2,
            verify_timeout_secs: 60,
            replication_user: DEFAULT_REPLICATION_USER.to_string(),
        }
    }
}

/// SSH time limits and host-key trust from the `[ssh]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub long_command_timeout_secs: u64,
    /// Defaults to `~/.ssh/known_hosts`
    pub known_hosts: Option<PathBuf>,
    /// Record keys of hosts missing from known_hosts instead of refusing them
    pub accept_new_host_keys: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout_secs: 60,
            long_command_timeout_secs: 30 * 60,
            known_hosts: None,
            accept_new_host_keys: false,
        }
    }
}

impl SshSettings {
    pub fn known_hosts_path(&self) -> PathBuf {
        match &self.known_hosts {
            Some(path) => path.clone(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(".ssh/known_hosts"),
        }
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        if self.accept_new_host_keys {
            HostKeyPolicy::AcceptNew
        } else {
            HostKeyPolicy::Strict
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub staging_dir: Option<String>,
    pub parallelism: Option<usize>,
    pub max_secondaries: Option<usize>,
    pub verify_timeout_secs: Option<u64>,
}

/// Contents of a cluster configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(flatten)]
    pub topology: Topology,
    #[serde(default)]
    pub deploy: DeploySettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl ClusterConfig {
    /// Read a TOML file; relative artifact paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        if let Some(base) = path.parent() {
            for artifact in &mut config.artifacts {
                if artifact.path.is_relative() {
                    artifact.path = base.join(&artifact.path);
                }
            }
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.staging_dir {
            self.topology.staging_dir = dir.clone();
        }
        if let Some(parallelism) = overrides.parallelism {
            self.deploy.parallelism = parallelism;
        }
        if let Some(max) = overrides.max_secondaries {
            self.deploy.max_secondaries = max;
        }
        if let Some(secs) = overrides.verify_timeout_secs {
            self.deploy.verify_timeout_secs = secs;
        }
    }

    pub fn validator(&self) -> TopologyValidator {
        TopologyValidator::new().with_max_secondaries(self.deploy.max_secondaries)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_parallelism(self.deploy.parallelism)
            .with_verify_timing(
                Duration::from_secs(self.deploy.verify_poll_interval_secs),
                Duration::from_secs(self.deploy.verify_timeout_secs),
            )
            .with_replication_user(self.deploy.replication_user.clone())
            .with_artifacts(self.artifacts.clone())
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_secs(self.ssh.connect_timeout_secs),
            command: Duration::from_secs(self.ssh.command_timeout_secs),
            long_command: Duration::from_secs(self.ssh.long_command_timeout_secs),
        }
    }

    pub fn connector(&self) -> SshConnector {
        SshConnector::new(self.session_timeouts(), self.ssh.known_hosts_path())
            .with_host_key_policy(self.ssh.host_key_policy())
    }
}
