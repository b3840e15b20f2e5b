pub mod error;
pub mod local;
pub mod shell;
pub mod ssh;
pub mod staging;
pub mod traits;

pub use error::{RemoteError, Result, StageError};
pub use local::LocalSession;
pub use ssh::{HostKeyPolicy, SshConnector, SshSession};
pub use staging::{Artifact, ArtifactKind, StagedDir, StagingCoordinator, STAGING_MARKER};
pub use traits::{CommandOutput, Connector, RemoteSession, SessionTimeouts};
