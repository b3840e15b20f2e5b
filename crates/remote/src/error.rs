use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Cannot connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Command on {host} failed (exit {status:?}): {command}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Command on {host} timed out after {after:?}: {command}")]
    Timeout {
        host: String,
        command: String,
        after: Duration,
    },

    #[error("Upload of {local} to {host}:{remote} failed: {reason}")]
    UploadFailed {
        host: String,
        local: String,
        remote: String,
        reason: String,
    },

    #[error("Host key of {host} rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("SFTP {operation} of {path} on {host} failed: {reason}")]
    Sftp {
        host: String,
        operation: String,
        path: String,
        reason: String,
    },

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn connect(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Why a node's staging directory could not be prepared.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("staging directory {dir} on {host} is not empty and was not created by this tool; refusing to touch it")]
    ForeignContent { host: String, dir: String },

    #[error("staging path {dir} on {host} exists and is not a directory")]
    NotADirectory { host: String, dir: String },

    #[error("artifact {0} does not exist locally")]
    MissingArtifact(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
