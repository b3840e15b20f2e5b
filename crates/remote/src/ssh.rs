//! SSH transport on libssh2.
//!
//! One authenticated [`ssh2::Session`] is held per node for the whole run.
//! libssh2 calls block, so every operation runs on tokio's blocking pool and
//! operations on the same session are serialized.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use cluster_core::{Credentials, NodeSpec};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::shell::{checked_path, quote, sudo, sudo_with_password};
use crate::traits::{CommandOutput, Connector, RemoteSession, SessionTimeouts};

/// `LIBSSH2_ERROR_TIMEOUT`
const SESSION_TIMEOUT: i32 = -9;
/// `SSH_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;
const KEEPALIVE_INTERVAL_SECS: u32 = 15;

fn millis(duration: Duration) -> u32 {
    duration.as_millis().clamp(1, u128::from(u32::MAX)) as u32
}

/// OpenSSH-style `SHA256:` fingerprint of a raw host key.
fn fingerprint_sha256(key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key)))
}

/// Host pattern a known_hosts line uses for `host` on `port`.
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// What to do with a host whose key is not in known_hosts yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Refuse to connect
    #[default]
    Strict,
    /// Record the key and connect
    AcceptNew,
}

#[derive(Debug, PartialEq, Eq)]
enum HostKeyVerdict {
    Trusted,
    Learn,
    Reject(&'static str),
}

fn host_key_verdict(check: CheckResult, policy: HostKeyPolicy) -> HostKeyVerdict {
    match check {
        CheckResult::Match => HostKeyVerdict::Trusted,
        CheckResult::NotFound if policy == HostKeyPolicy::AcceptNew => HostKeyVerdict::Learn,
        CheckResult::NotFound => HostKeyVerdict::Reject("host key is not in known_hosts"),
        CheckResult::Mismatch => {
            HostKeyVerdict::Reject("host key differs from the known_hosts entry, refusing to connect")
        }
        CheckResult::Failure => HostKeyVerdict::Reject("host key could not be checked"),
    }
}

/// Map a libssh2 error from `operation` on `host`.
///
/// Session-level failures mean the connection is gone; SFTP status codes are
/// reported against the path they concern.
fn classify(host: &str, operation: &str, path: &str, timeout: Duration, e: ssh2::Error) -> RemoteError {
    match e.code() {
        ErrorCode::Session(SESSION_TIMEOUT) => RemoteError::Timeout {
            host: host.to_string(),
            command: operation.to_string(),
            after: timeout,
        },
        ErrorCode::Session(_) => RemoteError::connect(host, format!("{operation}: {e}")),
        ErrorCode::SFTP(_) => RemoteError::Sftp {
            host: host.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
            reason: e.message().to_string(),
        },
    }
}

fn stream_error(host: &str, command: &str, timeout: Duration, e: io::Error) -> RemoteError {
    if e.kind() == io::ErrorKind::TimedOut {
        RemoteError::Timeout {
            host: host.to_string(),
            command: command.to_string(),
            after: timeout,
        }
    } else {
        RemoteError::connect(host, format!("{command}: {e}"))
    }
}

/// `Ok(None)` for a missing path; any other failure, permission denied
/// included, is an error rather than an answer.
fn sftp_lookup<T>(result: std::result::Result<T, ssh2::Error>) -> std::result::Result<Option<T>, ssh2::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
        Err(e) => Err(e),
    }
}

/// An authenticated libssh2 session and the host it belongs to.
struct Link {
    host: String,
    session: Session,
}

impl Link {
    fn exec(&self, command: &str, stdin: Option<&[u8]>, timeout: Duration) -> Result<CommandOutput> {
        let host = self.host.as_str();
        let fail = |e| classify(host, command, "", timeout, e);
        let broken = |e| stream_error(host, command, timeout, e);

        self.session.set_timeout(millis(timeout));
        let mut channel = self.session.channel_session().map_err(fail)?;
        channel.exec(command).map_err(fail)?;

        if let Some(input) = stdin {
            channel.write_all(input).map_err(broken)?;
        }
        channel.send_eof().map_err(fail)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout).map_err(broken)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr).map_err(broken)?;
        channel.wait_close().map_err(fail)?;
        let status = channel.exit_status().map_err(fail)?;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        if status != 0 {
            return Err(RemoteError::CommandFailed {
                host: self.host.clone(),
                command: command.to_string(),
                status: Some(status),
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }

    fn sftp(&self, timeout: Duration) -> Result<ssh2::Sftp> {
        self.session.set_timeout(millis(timeout));
        self.session
            .sftp()
            .map_err(|e| classify(&self.host, "open sftp", "", timeout, e))
    }

    fn stat(&self, path: &str, follow: bool, timeout: Duration) -> Result<Option<ssh2::FileStat>> {
        let sftp = self.sftp(timeout)?;
        let result = if follow {
            sftp.stat(Path::new(path))
        } else {
            sftp.lstat(Path::new(path))
        };
        sftp_lookup(result).map_err(|e| classify(&self.host, "stat", path, timeout, e))
    }

    fn read_dir(&self, path: &str, timeout: Duration) -> Result<Vec<String>> {
        let entries = self
            .sftp(timeout)?
            .readdir(Path::new(path))
            .map_err(|e| classify(&self.host, "readdir", path, timeout, e))?;
        Ok(entries
            .iter()
            .filter_map(|(entry, _)| entry.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn write(&self, remote: &str, source: &mut dyn Read, timeout: Duration) -> Result<()> {
        let sftp = self.sftp(timeout)?;
        let mut file = sftp
            .create(Path::new(remote))
            .map_err(|e| classify(&self.host, "create", remote, timeout, e))?;
        io::copy(source, &mut file).map_err(|e| stream_error(&self.host, remote, timeout, e))?;
        Ok(())
    }
}

struct Target {
    host: String,
    port: u16,
    user: String,
    credentials: Credentials,
}

fn open_link(target: &Target, timeout: Duration, known_hosts: &Path, policy: HostKeyPolicy) -> Result<Link> {
    let host = target.host.as_str();
    let addresses = (host, target.port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::connect(host, format!("cannot resolve: {e}")))?;

    let mut last_error = None;
    let mut stream = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let stream = stream.ok_or_else(|| {
        let reason = last_error.map_or_else(|| "no address to connect to".to_string(), |e| e.to_string());
        RemoteError::connect(host, reason)
    })?;

    let mut session = Session::new().map_err(|e| RemoteError::connect(host, e.to_string()))?;
    session.set_tcp_stream(stream);
    session.set_timeout(millis(timeout));
    session
        .handshake()
        .map_err(|e| RemoteError::connect(host, format!("SSH handshake failed: {e}")))?;

    verify_host_key(&session, host, target.port, known_hosts, policy)?;

    let auth = match &target.credentials {
        Credentials::Password(password) => session.userauth_password(&target.user, password),
        Credentials::PrivateKey(key) => session.userauth_pubkey_file(&target.user, None, key, None),
    };
    auth.map_err(|e| RemoteError::connect(host, format!("authentication as {} failed: {e}", target.user)))?;
    if !session.authenticated() {
        return Err(RemoteError::connect(host, format!("authentication as {} failed", target.user)));
    }

    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    Ok(Link {
        host: target.host.clone(),
        session,
    })
}

fn verify_host_key(session: &Session, host: &str, port: u16, known_hosts: &Path, policy: HostKeyPolicy) -> Result<()> {
    let rejected = |reason: String| RemoteError::HostKeyRejected {
        host: host.to_string(),
        reason,
    };

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| rejected("server sent no host key".to_string()))?;
    let fingerprint = fingerprint_sha256(key);

    let mut known = session.known_hosts().map_err(|e| rejected(e.to_string()))?;
    if known_hosts.exists() {
        known
            .read_file(known_hosts, KnownHostFileKind::OpenSSH)
            .map_err(|e| rejected(format!("cannot read {}: {e}", known_hosts.display())))?;
    }

    match host_key_verdict(known.check_port(host, port, key), policy) {
        HostKeyVerdict::Trusted => Ok(()),
        HostKeyVerdict::Learn => {
            if let Some(parent) = known_hosts.parent() {
                fs::create_dir_all(parent)?;
            }
            known
                .add(
                    &known_hosts_name(host, port),
                    key,
                    "clusterforge",
                    KnownHostKeyFormat::from(key_type),
                )
                .map_err(|e| rejected(e.to_string()))?;
            known
                .write_file(known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| rejected(format!("cannot write {}: {e}", known_hosts.display())))?;
            warn!(
                host = %host,
                fingerprint = %fingerprint,
                known_hosts = %known_hosts.display(),
                "Trusted new SSH host key"
            );
            Ok(())
        }
        HostKeyVerdict::Reject(reason) => Err(rejected(format!(
            "{reason} ({fingerprint}, {})",
            known_hosts.display()
        ))),
    }
}

/// Session holding one authenticated libssh2 connection.
pub struct SshSession {
    host: String,
    user: String,
    sudo_password: Option<String>,
    timeouts: SessionTimeouts,
    link: Arc<Mutex<Link>>,
}

impl SshSession {
    fn new(link: Link, node: &NodeSpec, credentials: Credentials, timeouts: SessionTimeouts) -> Self {
        let sudo_password = match credentials {
            Credentials::Password(password) => Some(password),
            Credentials::PrivateKey(_) => None,
        };
        Self {
            host: node.address.clone(),
            user: node.ssh_user.clone(),
            sudo_password,
            timeouts,
            link: Arc::new(Mutex::new(link)),
        }
    }

    fn is_root(&self) -> bool {
        self.user == "root"
    }

    /// Run `op` against the held session on the blocking pool.
    async fn with_link<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Link) -> Result<T> + Send + 'static,
    {
        let link = Arc::clone(&self.link);
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || {
            let link = link
                .lock()
                .map_err(|_| RemoteError::connect(&host, "session poisoned by an earlier panic"))?;
            op(&link)
        })
        .await
        .map_err(|e| RemoteError::connect(&self.host, format!("SSH worker stopped: {e}")))?
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!(host = %self.host, command = %command, "Running remote command");
        let command = command.to_string();
        self.with_link(move |link| link.exec(&command, None, timeout))
            .await
    }

    async fn run_privileged(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        if self.is_root() {
            return self.run(command, timeout).await;
        }

        match &self.sudo_password {
            Some(password) => {
                debug!(host = %self.host, command = %command, "Running remote command with sudo");
                let wrapped = sudo_with_password(command);
                let input = format!("{password}\n").into_bytes();
                self.with_link(move |link| link.exec(&wrapped, Some(&input), timeout))
                    .await
            }
            None => self.run(&sudo(command), timeout).await,
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.host, local = %local.display(), remote = %remote, "Uploading file");
        let timeout = self.timeouts.long_command;
        let source = local.to_path_buf();
        let target = remote.to_string();

        self.with_link(move |link| {
            let mut file = fs::File::open(&source)?;
            link.write(&target, &mut file, timeout)
        })
        .await
        .map_err(|e| match e {
            RemoteError::Sftp { reason, .. } | RemoteError::ConnectFailed { reason, .. } => {
                RemoteError::UploadFailed {
                    host: self.host.clone(),
                    local: local.display().to_string(),
                    remote: remote.to_string(),
                    reason,
                }
            }
            RemoteError::Io(e) => RemoteError::UploadFailed {
                host: self.host.clone(),
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: e.to_string(),
            },
            other => other,
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let timeout = self.timeouts.command;
        let path = path.to_string();
        let contents = contents.to_vec();
        self.with_link(move |link| link.write(&path, &mut contents.as_slice(), timeout))
            .await
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let timeout = self.timeouts.command;
        let path = path.to_string();
        self.with_link(move |link| Ok(link.stat(&path, false, timeout)?.is_some()))
            .await
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        let timeout = self.timeouts.command;
        let path = path.to_string();
        self.with_link(move |link| Ok(link.stat(&path, true, timeout)?.is_some_and(|s| s.is_dir())))
            .await
    }

    async fn is_empty_dir(&self, path: &str) -> Result<bool> {
        let timeout = self.timeouts.command;
        let path = path.to_string();
        self.with_link(move |link| match link.stat(&path, true, timeout)? {
            Some(stat) if stat.is_dir() => Ok(link.read_dir(&path, timeout)?.is_empty()),
            _ => Ok(false),
        })
        .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let timeout = self.timeouts.command;
        let path = path.to_string();
        self.with_link(move |link| link.read_dir(&path, timeout))
            .await
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let path = checked_path(path)?;
        self.exec(&format!("mkdir -p {}", quote(path))).await.map(|_| ())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        self.exec(&format!("chmod {:o} {}", mode, quote(path)))
            .await
            .map(|_| ())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let path = checked_path(path)?;
        self.exec(&format!("rm -rf -- {}", quote(path))).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let timeout = self.timeouts.connect;
        self.with_link(move |link| {
            link.session.set_timeout(millis(timeout));
            link.session
                .disconnect(None, "deployment finished", None)
                .map_err(|e| classify(&link.host, "disconnect", "", timeout, e))
        })
        .await
    }
}

/// Opens authenticated [`SshSession`]s, checking host keys against a
/// known_hosts file.
#[derive(Debug, Clone)]
pub struct SshConnector {
    timeouts: SessionTimeouts,
    known_hosts: PathBuf,
    host_keys: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(timeouts: SessionTimeouts, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            timeouts,
            known_hosts: known_hosts.into(),
            host_keys: HostKeyPolicy::default(),
        }
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_keys = policy;
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, node: &NodeSpec) -> Result<Arc<dyn RemoteSession>> {
        let credentials = node.credentials().ok_or_else(|| {
            RemoteError::connect(&node.address, "no password or private key configured")
        })?;

        let target = Target {
            host: node.address.clone(),
            port: node.port(),
            user: node.ssh_user.clone(),
            credentials: credentials.clone(),
        };
        let timeout = self.timeouts.connect;
        let known_hosts = self.known_hosts.clone();
        let policy = self.host_keys;

        let link = tokio::task::spawn_blocking(move || open_link(&target, timeout, &known_hosts, policy))
            .await
            .map_err(|e| RemoteError::connect(&node.address, format!("SSH worker stopped: {e}")))??;

        debug!(host = %node.address, port = node.port(), user = %node.ssh_user, "SSH session established");
        Ok(Arc::new(SshSession::new(link, node, credentials, self.timeouts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_matches_openssh_format() {
        assert_eq!(
            fingerprint_sha256(b""),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn test_known_hosts_name_brackets_custom_ports() {
        assert_eq!(known_hosts_name("db1", 22), "db1");
        assert_eq!(known_hosts_name("10.0.0.1", 2222), "[10.0.0.1]:2222");
    }

    #[test]
    fn test_unknown_host_key_needs_explicit_policy() {
        assert_eq!(
            host_key_verdict(CheckResult::Match, HostKeyPolicy::Strict),
            HostKeyVerdict::Trusted
        );
        assert!(matches!(
            host_key_verdict(CheckResult::NotFound, HostKeyPolicy::Strict),
            HostKeyVerdict::Reject(_)
        ));
        assert_eq!(
            host_key_verdict(CheckResult::NotFound, HostKeyPolicy::AcceptNew),
            HostKeyVerdict::Learn
        );
    }

    #[test]
    fn test_changed_host_key_is_always_rejected() {
        for policy in [HostKeyPolicy::Strict, HostKeyPolicy::AcceptNew] {
            assert!(matches!(
                host_key_verdict(CheckResult::Mismatch, policy),
                HostKeyVerdict::Reject(_)
            ));
            assert!(matches!(
                host_key_verdict(CheckResult::Failure, policy),
                HostKeyVerdict::Reject(_)
            ));
        }
    }

    #[test]
    fn test_missing_path_is_an_answer() {
        let missing = ssh2::Error::new(ErrorCode::SFTP(SFTP_NO_SUCH_FILE), "no such file");
        assert!(matches!(sftp_lookup::<()>(Err(missing)), Ok(None)));
        assert!(matches!(sftp_lookup(Ok(7)), Ok(Some(7))));
    }

    #[test]
    fn test_unreadable_path_is_an_error() {
        let denied = ssh2::Error::new(ErrorCode::SFTP(3), "permission denied");
        let err = sftp_lookup::<()>(Err(denied)).unwrap_err();

        match classify("db1", "readdir", "/srv/stage", Duration::from_secs(1), err) {
            RemoteError::Sftp { host, path, .. } => {
                assert_eq!(host, "db1");
                assert_eq!(path, "/srv/stage");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_session_errors_classified() {
        let timeout = ssh2::Error::new(ErrorCode::Session(SESSION_TIMEOUT), "timed out");
        assert!(matches!(
            classify("db1", "apt-get install", "", Duration::from_secs(5), timeout),
            RemoteError::Timeout { after, .. } if after == Duration::from_secs(5)
        ));

        let dropped = ssh2::Error::new(ErrorCode::Session(-13), "socket disconnect");
        assert!(matches!(
            classify("db1", "true", "", Duration::from_secs(5), dropped),
            RemoteError::ConnectFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_connecting() {
        let node = NodeSpec::new("10.0.0.1", 5432, "/data");
        let connector = SshConnector::new(SessionTimeouts::default(), "/nonexistent/known_hosts");

        let result = connector.open(&node).await;
        assert!(matches!(result, Err(RemoteError::ConnectFailed { .. })));
    }
}
