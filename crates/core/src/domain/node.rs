use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u32 {
    22
}

/// Role of a node within a cluster topology.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Seed,
    Secondary,
    Arbiter,
    Witness,
    Proxy,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Secondary => "secondary",
            Self::Arbiter => "arbiter",
            Self::Witness => "witness",
            Self::Proxy => "proxy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(Self::Seed),
            "secondary" => Some(Self::Secondary),
            "arbiter" => Some(Self::Arbiter),
            "witness" => Some(Self::Witness),
            "proxy" => Some(Self::Proxy),
            _ => None,
        }
    }

    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Self::Arbiter | Self::Witness | Self::Proxy)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles that may be attached to a cluster without holding a replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryRole {
    Arbiter,
    Witness,
    Proxy,
}

impl From<AuxiliaryRole> for NodeRole {
    fn from(role: AuxiliaryRole) -> Self {
        match role {
            AuxiliaryRole::Arbiter => NodeRole::Arbiter,
            AuxiliaryRole::Witness => NodeRole::Witness,
            AuxiliaryRole::Proxy => NodeRole::Proxy,
        }
    }
}

/// SSH authentication material for one node.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    PrivateKey(PathBuf),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

/// Engine install parameters the orchestrator needs to know about.
///
/// Only the service port and data directory are interpreted (they are the
/// arguments of an uninstall); everything else is engine specific and lives
/// in [`crate::Topology::engine_parameters`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallParams {
    pub service_port: u16,
    pub data_dir: String,
}

/// One host of the topology as written in configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub address: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Wider than `u16` so that out-of-range values reach validation.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(flatten)]
    pub install: InstallParams,
}

impl NodeSpec {
    pub fn new(address: impl Into<String>, service_port: u16, data_dir: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            password: None,
            private_key: None,
            install: InstallParams {
                service_port,
                data_dir: data_dir.into(),
            },
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    pub fn with_ssh_port(mut self, port: u32) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    /// Key-based auth wins when both are configured; validation rejects that
    /// combination before any session is opened.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.private_key, &self.password) {
            (Some(key), _) => Some(Credentials::PrivateKey(key.clone())),
            (None, Some(password)) => Some(Credentials::Password(password.clone())),
            (None, None) => None,
        }
    }

    /// SSH port as a `u16`, falling back to 22 for values validation rejects.
    pub fn port(&self) -> u16 {
        u16::try_from(self.ssh_port)
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(22)
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("address", &self.address)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_port", &self.ssh_port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("install", &self.install)
            .finish()
    }
}

/// A topology member together with its role, in install order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub role: NodeRole,
    pub spec: NodeSpec,
}

impl Node {
    pub fn new(role: NodeRole, spec: NodeSpec) -> Self {
        Self { role, spec }
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn service_port(&self) -> u16 {
        self.spec.install.service_port
    }

    pub fn data_dir(&self) -> &str {
        &self.spec.install.data_dir
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.spec.address, self.role)
    }
}

/// A configured node address and the IPs it resolved to.
///
/// Peers may report a node by either, so a reported replica matches when it
/// equals the configured name (case-insensitively) or one of its IPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub address: String,
    pub resolved: Vec<IpAddr>,
}

impl HostIdentity {
    pub fn new(address: impl Into<String>, resolved: Vec<IpAddr>) -> Self {
        Self {
            address: address.into(),
            resolved,
        }
    }

    pub fn matches(&self, reported: &str) -> bool {
        let reported = reported.trim();
        if reported
            .trim_end_matches('.')
            .eq_ignore_ascii_case(self.address.trim_end_matches('.'))
        {
            return true;
        }
        reported
            .parse::<IpAddr>()
            .is_ok_and(|ip| self.resolved.contains(&ip))
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)?;
        let literal = self.address.parse::<IpAddr>().ok();
        let extra: Vec<String> = self
            .resolved
            .iter()
            .filter(|ip| Some(**ip) != literal)
            .map(IpAddr::to_string)
            .collect();
        if !extra.is_empty() {
            write!(f, " ({})", extra.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [
            NodeRole::Seed,
            NodeRole::Secondary,
            NodeRole::Arbiter,
            NodeRole::Witness,
            NodeRole::Proxy,
        ] {
            assert_eq!(NodeRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(NodeRole::parse("primary"), None);
        assert!(NodeRole::Witness.is_auxiliary());
        assert!(!NodeRole::Seed.is_auxiliary());
    }

    #[test]
    fn test_key_takes_precedence() {
        let spec = NodeSpec::new("10.0.0.1", 5432, "/var/lib/db")
            .with_password("pw")
            .with_private_key("/root/.ssh/id_ed25519");

        assert_eq!(
            spec.credentials(),
            Some(Credentials::PrivateKey(PathBuf::from("/root/.ssh/id_ed25519")))
        );
    }

    #[test]
    fn test_password_is_redacted() {
        let spec = NodeSpec::new("10.0.0.1", 5432, "/var/lib/db").with_password("hunter2");

        let debug = format!("{:?} {:?}", spec, spec.credentials());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_identity_matches_name_or_resolved_ip() {
        let identity = HostIdentity::new("db-2.internal", vec!["10.0.0.2".parse().unwrap()]);

        assert!(identity.matches("10.0.0.2"));
        assert!(identity.matches("DB-2.internal"));
        assert!(identity.matches("db-2.internal."));
        assert!(!identity.matches("10.0.0.3"));
        assert!(!identity.matches("db-2"));
        assert_eq!(identity.to_string(), "db-2.internal (10.0.0.2)");
    }

    #[test]
    fn test_port_fallback() {
        let spec = NodeSpec::new("db1", 5432, "/data").with_ssh_port(70000);
        assert_eq!(spec.port(), 22);

        let spec = NodeSpec::new("db1", 5432, "/data").with_ssh_port(2222);
        assert_eq!(spec.port(), 2222);
    }
}
