//! Per-node staging directories.
//!
//! Every node gets the same scratch directory for installer artifacts. A
//! marker file identifies directories this tool created, so a retry after a
//! crashed run can reclaim its own leftovers while anything else on the host
//! is left strictly alone.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, StageError};
use crate::shell::checked_path;
use crate::traits::RemoteSession;

/// Name of the ownership marker written into every staging directory.
pub const STAGING_MARKER: &str = ".clusterforge-staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Installer,
    Checksums,
    Package,
}

impl ArtifactKind {
    fn default_mode(self) -> Option<u32> {
        match self {
            ArtifactKind::Installer => Some(0o755),
            ArtifactKind::Checksums | ArtifactKind::Package => None,
        }
    }
}

/// A local file copied into every staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub mode: Option<u32>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        Self {
            path: path.into(),
            kind,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    fn effective_mode(&self) -> Option<u32> {
        self.mode.or_else(|| self.kind.default_mode())
    }
}

/// A staging directory owned by the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDir {
    pub host: String,
    pub path: String,
    /// Entries removed from a leftover directory of an earlier run
    pub reclaimed: Option<Vec<String>>,
}

impl StagedDir {
    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), name)
    }
}

pub struct StagingCoordinator {
    dir: String,
    artifacts: Vec<Artifact>,
}

impl StagingCoordinator {
    pub fn new(dir: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self {
            dir: dir.into(),
            artifacts,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Fail early when a configured artifact is missing on this machine.
    pub fn check_artifacts(&self) -> Result<(), StageError> {
        for artifact in &self.artifacts {
            if !artifact.path.is_file() || artifact.file_name().is_none() {
                return Err(StageError::MissingArtifact(
                    artifact.path.display().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn marker_path(&self) -> String {
        format!("{}/{}", self.dir.trim_end_matches('/'), STAGING_MARKER)
    }

    /// Create the staging directory on a node and claim it with the marker.
    ///
    /// A non-empty directory without the marker belongs to someone else and
    /// yields [`StageError::ForeignContent`] without modifying anything.
    pub async fn prepare(&self, session: &dyn RemoteSession) -> Result<StagedDir, StageError> {
        let host = session.host().to_string();
        checked_path(&self.dir)?;
        let mut reclaimed = None;

        if session.path_exists(&self.dir).await? {
            if !session.is_dir(&self.dir).await? {
                return Err(StageError::NotADirectory {
                    host,
                    dir: self.dir.clone(),
                });
            }

            if !session.is_empty_dir(&self.dir).await? {
                if !session.path_exists(&self.marker_path()).await? {
                    return Err(StageError::ForeignContent {
                        host,
                        dir: self.dir.clone(),
                    });
                }

                let entries: Vec<String> = session
                    .list_dir(&self.dir)
                    .await?
                    .into_iter()
                    .filter(|name| name != STAGING_MARKER)
                    .collect();
                warn!(
                    host = %host,
                    dir = %self.dir,
                    entries = ?entries,
                    "Clearing staging directory left by an earlier run"
                );
                session.remove_path(&self.dir).await?;
                reclaimed = Some(entries);
            }
        }

        session.make_dir(&self.dir).await?;
        session
            .write_file(&self.marker_path(), b"clusterforge\n")
            .await?;

        debug!(host = %host, dir = %self.dir, reclaimed = reclaimed.is_some(), "Staging directory ready");
        Ok(StagedDir {
            host,
            path: self.dir.clone(),
            reclaimed,
        })
    }

    /// Copy every artifact into a prepared directory and apply its mode.
    pub async fn upload_artifacts(
        &self,
        session: &dyn RemoteSession,
        staged: &StagedDir,
    ) -> Result<(), StageError> {
        for artifact in &self.artifacts {
            let name = artifact
                .file_name()
                .ok_or_else(|| StageError::MissingArtifact(artifact.path.display().to_string()))?;
            let target = staged.file(name);

            session.upload(&artifact.path, &target).await?;
            if let Some(mode) = artifact.effective_mode() {
                session.set_permissions(&target, mode).await?;
            }
        }

        info!(host = %staged.host, count = self.artifacts.len(), "Artifacts staged");
        Ok(())
    }

    /// Delete the staging directory; a missing directory counts as success.
    pub async fn cleanup(&self, session: &dyn RemoteSession) -> Result<(), RemoteError> {
        session.remove_path(&self.dir).await?;
        debug!(host = %session.host(), dir = %self.dir, "Staging directory removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSession;
    use tempfile::TempDir;

    fn setup() -> (TempDir, String, LocalSession) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("stage").to_str().unwrap().to_string();
        (temp, dir, LocalSession::new("db1"))
    }

    #[tokio::test]
    async fn test_prepare_creates_and_marks() {
        let (_temp, dir, session) = setup();
        let staging = StagingCoordinator::new(&dir, vec![]);

        let staged = staging.prepare(&session).await.unwrap();

        assert!(staged.reclaimed.is_none());
        assert!(std::path::Path::new(&staged.file(STAGING_MARKER)).is_file());
    }

    #[tokio::test]
    async fn test_prepare_reuses_empty_directory() {
        let (_temp, dir, session) = setup();
        std::fs::create_dir(&dir).unwrap();

        let staged = StagingCoordinator::new(&dir, vec![])
            .prepare(&session)
            .await
            .unwrap();
        assert!(staged.reclaimed.is_none());
    }

    #[tokio::test]
    async fn test_prepare_reclaims_own_leftovers() {
        let (_temp, dir, session) = setup();
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(format!("{dir}/{STAGING_MARKER}"), b"").unwrap();
        std::fs::write(format!("{dir}/stale.tar.gz"), b"old").unwrap();
        std::fs::write(format!("{dir}/notes.txt"), b"added later").unwrap();

        let staged = StagingCoordinator::new(&dir, vec![])
            .prepare(&session)
            .await
            .unwrap();

        assert_eq!(
            staged.reclaimed,
            Some(vec!["notes.txt".to_string(), "stale.tar.gz".to_string()])
        );
        assert!(!std::path::Path::new(&format!("{dir}/stale.tar.gz")).exists());
        assert!(!std::path::Path::new(&format!("{dir}/notes.txt")).exists());
    }

    #[tokio::test]
    async fn test_prepare_refuses_foreign_directory() {
        let (_temp, dir, session) = setup();
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(format!("{dir}/precious.db"), b"keep me").unwrap();

        let err = StagingCoordinator::new(&dir, vec![])
            .prepare(&session)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::ForeignContent { .. }));
        assert_eq!(
            std::fs::read(format!("{dir}/precious.db")).unwrap(),
            b"keep me"
        );
        assert!(!std::path::Path::new(&format!("{dir}/{STAGING_MARKER}")).exists());
    }

    #[tokio::test]
    async fn test_prepare_rejects_file() {
        let (_temp, dir, session) = setup();
        std::fs::write(&dir, b"").unwrap();

        let err = StagingCoordinator::new(&dir, vec![])
            .prepare(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn test_upload_and_cleanup() {
        let (temp, dir, session) = setup();
        let installer = temp.path().join("install.sh");
        let sums = temp.path().join("SHA256SUMS");
        std::fs::write(&installer, b"#!/bin/sh\n").unwrap();
        std::fs::write(&sums, b"abc  install.sh\n").unwrap();

        let staging = StagingCoordinator::new(
            &dir,
            vec![
                Artifact::new(&installer, ArtifactKind::Installer),
                Artifact::new(&sums, ArtifactKind::Checksums),
            ],
        );
        staging.check_artifacts().unwrap();

        let staged = staging.prepare(&session).await.unwrap();
        staging.upload_artifacts(&session, &staged).await.unwrap();

        assert!(std::path::Path::new(&staged.file("install.sh")).is_file());
        assert!(std::path::Path::new(&staged.file("SHA256SUMS")).is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(staged.file("install.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        staging.cleanup(&session).await.unwrap();
        assert!(!std::path::Path::new(&dir).exists());
        staging.cleanup(&session).await.unwrap();
    }

    #[test]
    fn test_missing_artifact() {
        let staging = StagingCoordinator::new(
            "/tmp/stage",
            vec![Artifact::new("/nonexistent/pkg.tar.gz", ArtifactKind::Package)],
        );
        assert!(matches!(
            staging.check_artifacts(),
            Err(StageError::MissingArtifact(_))
        ));
    }

    #[test]
    fn test_artifact_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            artifacts: Vec<Artifact>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[artifacts]]
            path = "/srv/pkg/installer.sh"
            kind = "installer"

            [[artifacts]]
            path = "/srv/pkg/engine.tar.gz"
            kind = "package"
            mode = 0o644
            "#,
        )
        .unwrap();

        assert_eq!(parsed.artifacts[0].effective_mode(), Some(0o755));
        assert_eq!(parsed.artifacts[1].mode, Some(0o644));
    }
}
