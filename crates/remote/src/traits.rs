use async_trait::async_trait;
use cluster_core::NodeSpec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Per-operation time limits of a session.
///
/// Connection setup, quick path queries and long-running installation
/// commands get separate allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub command: Duration,
    pub long_command: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(60),
            long_command: Duration::from_secs(30 * 60),
        }
    }
}

/// Captured output of a successful remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// An authenticated connection to one host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Address of the host this session talks to
    fn host(&self) -> &str;

    fn timeouts(&self) -> SessionTimeouts;

    /// Run a shell command; non-zero exit is an error
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Run a shell command with root privileges
    async fn run_privileged(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Copy a local file to a remote path
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Create or truncate a remote file with the given contents
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    async fn path_exists(&self, path: &str) -> Result<bool>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    /// True when `path` is a directory with no entries
    async fn is_empty_dir(&self, path: &str) -> Result<bool>;

    /// Names of the entries directly inside a directory
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Create a directory and any missing parents
    async fn make_dir(&self, path: &str) -> Result<()>;

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()>;

    /// Remove a file or directory tree
    async fn remove_path(&self, path: &str) -> Result<()>;

    /// Release the connection; further calls may fail
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Run with the short command timeout
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.run(command, self.timeouts().command).await
    }

    /// Run privileged with the long command timeout (package installs, data sync)
    async fn exec_long(&self, command: &str) -> Result<CommandOutput> {
        self.run_privileged(command, self.timeouts().long_command)
            .await
    }
}

/// Opens sessions to topology nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a session; fails if the node is unreachable
    async fn open(&self, node: &NodeSpec) -> Result<Arc<dyn RemoteSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts_are_ordered() {
        let timeouts = SessionTimeouts::default();
        assert!(timeouts.connect < timeouts.command);
        assert!(timeouts.command < timeouts.long_command);
    }

    #[test]
    fn test_output_trimmed() {
        let output = CommandOutput {
            stdout: "  2\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.trimmed(), "2");
    }
}
