//! Local-exec transport.
//!
//! Runs every "remote" operation on this machine. Useful for single-host
//! test clusters and for exercising staging against a real filesystem.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RemoteError, Result};
use crate::shell::checked_path;
use crate::traits::{CommandOutput, RemoteSession, SessionTimeouts};

pub struct LocalSession {
    host: String,
    timeouts: SessionTimeouts,
}

impl LocalSession {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeouts: SessionTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!(host = %self.host, command = %command, "Running local command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| RemoteError::Timeout {
                host: self.host.clone(),
                command: command.to_string(),
                after: timeout,
            })??;

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                host: self.host.clone(),
                command: command.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_privileged(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run(command, timeout).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| RemoteError::UploadFailed {
                host: self.host.clone(),
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).await?;
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(fs::symlink_metadata(path).await.is_ok())
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn is_empty_dir(&self, path: &str) -> Result<bool> {
        if !self.is_dir(path).await? {
            return Ok(false);
        }
        let mut entries = fs::read_dir(path).await?;
        Ok(entries.next_entry().await?.is_none())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(checked_path(path)?).await?;
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let path = checked_path(path)?;
        match fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await?,
            Ok(_) => fs::remove_file(path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
