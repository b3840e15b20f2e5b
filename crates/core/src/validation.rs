//! Topology validation.
//!
//! Validation never talks to the target nodes. It checks the shape of the
//! topology, the syntax of every address, optional name resolution and the
//! presence of local private-key files, and reports every problem found in a
//! single [`ValidationError`].

use regex::Regex;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::domain::{HostIdentity, NodeSpec, Topology};
use crate::error::{ValidationError, Violation};

pub const DEFAULT_MAX_SECONDARIES: usize = 2;

/// Looks up the IPv4 addresses of a syntactically valid hostname.
pub trait HostResolver: Send + Sync {
    /// `None` when this resolver does not look names up at all.
    fn lookup(&self, host: &str) -> Option<Vec<Ipv4Addr>>;
}

/// Resolves through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup(&self, host: &str) -> Option<Vec<Ipv4Addr>> {
        let addresses = (host, 0u16)
            .to_socket_addrs()
            .map(|addrs| {
                addrs
                    .filter_map(|addr| match addr.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(addresses)
    }
}

/// Accepts every syntactically valid hostname without resolving it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxOnlyResolver;

impl HostResolver for SyntaxOnlyResolver {
    fn lookup(&self, _host: &str) -> Option<Vec<Ipv4Addr>> {
        None
    }
}

fn hostname_label() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
            .expect("Invalid hostname label regex pattern")
    })
}

#[derive(Clone)]
pub struct TopologyValidator {
    max_secondaries: usize,
    resolver: Arc<dyn HostResolver>,
    check_key_files: bool,
}

impl Default for TopologyValidator {
    fn default() -> Self {
        Self {
            max_secondaries: DEFAULT_MAX_SECONDARIES,
            resolver: Arc::new(SystemResolver),
            check_key_files: true,
        }
    }
}

impl std::fmt::Debug for TopologyValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyValidator")
            .field("max_secondaries", &self.max_secondaries)
            .field("check_key_files", &self.check_key_files)
            .finish()
    }
}

impl TopologyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_secondaries(mut self, max: usize) -> Self {
        self.max_secondaries = max;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_key_file_check(mut self, enabled: bool) -> Self {
        self.check_key_files = enabled;
        self
    }

    pub fn max_secondaries(&self) -> usize {
        self.max_secondaries
    }

    pub fn validate(&self, topology: &Topology) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        if topology.cluster_name.trim().is_empty() {
            violations.push(Violation::EmptyClusterName);
        }
        if topology.engine.trim().is_empty() {
            violations.push(Violation::EmptyEngine);
        }

        if topology.secondaries.is_empty() {
            violations.push(Violation::NoSecondaries);
        } else if topology.secondaries.len() > self.max_secondaries {
            violations.push(Violation::TooManySecondaries {
                count: topology.secondaries.len(),
                max: self.max_secondaries,
            });
        }

        let staging = topology.staging_dir.trim_end_matches('/');
        if !topology.staging_dir.starts_with('/') || staging.is_empty() {
            violations.push(Violation::InvalidStagingDir(topology.staging_dir.clone()));
        }

        let specs = std::iter::once(&topology.seed)
            .chain(topology.secondaries.iter())
            .chain(topology.auxiliaries.iter().map(|aux| &aux.spec));

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for spec in specs {
            let key = spec.address.trim().to_ascii_lowercase();
            if !key.is_empty() && !seen.insert(key.clone()) && reported.insert(key) {
                violations.push(Violation::DuplicateAddress(spec.address.clone()));
            }
            self.check_node(spec, &mut violations);
        }

        debug!(
            cluster = %topology.cluster_name,
            violations = violations.len(),
            "Topology validated"
        );

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

    fn check_node(&self, spec: &NodeSpec, violations: &mut Vec<Violation>) {
        if let Err(reason) = self.check_address(&spec.address) {
            violations.push(Violation::InvalidAddress {
                address: spec.address.clone(),
                reason,
            });
        }

        if spec.ssh_port == 0 || spec.ssh_port > u32::from(u16::MAX) {
            violations.push(Violation::SshPortOutOfRange {
                address: spec.address.clone(),
                port: spec.ssh_port,
            });
        }

        match (&spec.password, &spec.private_key) {
            (None, None) => violations.push(Violation::MissingCredentials {
                address: spec.address.clone(),
            }),
            (Some(_), Some(_)) => violations.push(Violation::ConflictingCredentials {
                address: spec.address.clone(),
            }),
            (None, Some(key)) if self.check_key_files && !key.exists() => {
                violations.push(Violation::KeyFileNotFound {
                    address: spec.address.clone(),
                    path: key.clone(),
                })
            }
            _ => {}
        }

        if spec.install.service_port == 0 {
            violations.push(Violation::InvalidServicePort {
                address: spec.address.clone(),
            });
        }

        if !spec.install.data_dir.starts_with('/') || spec.install.data_dir.trim_end_matches('/').is_empty() {
            violations.push(Violation::InvalidDataDir {
                address: spec.address.clone(),
                data_dir: spec.install.data_dir.clone(),
            });
        }
    }

    fn check_address(&self, address: &str) -> Result<(), String> {
        if address.is_empty() {
            return Err("address is empty".to_string());
        }
        if address != address.trim() {
            return Err("address has surrounding whitespace".to_string());
        }

        if address.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return address
                .parse::<Ipv4Addr>()
                .map(|_| ())
                .map_err(|_| "not a valid IPv4 address".to_string());
        }

        let host = address.strip_suffix('.').unwrap_or(address);
        if host.len() > 253 || !host.split('.').all(|label| hostname_label().is_match(label)) {
            return Err("not a valid hostname".to_string());
        }

        if matches!(self.resolver.lookup(host), Some(addresses) if addresses.is_empty()) {
            return Err("hostname does not resolve to an IPv4 address".to_string());
        }

        Ok(())
    }

    /// Every identity `address` may be reported under by its peers.
    ///
    /// IPv4 literals stand for themselves; hostnames carry whatever the
    /// resolver returns for them.
    pub fn identity(&self, address: &str) -> HostIdentity {
        if let Ok(ip) = address.parse::<Ipv4Addr>() {
            return HostIdentity::new(address, vec![IpAddr::V4(ip)]);
        }

        let host = address.strip_suffix('.').unwrap_or(address);
        let resolved = self
            .resolver
            .lookup(host)
            .unwrap_or_default()
            .into_iter()
            .map(IpAddr::V4)
            .collect();
        HostIdentity::new(address, resolved)
    }
}
