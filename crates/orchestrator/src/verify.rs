use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cluster_core::{DeploymentPhase, HostIdentity};

use crate::error::{OrchestratorError, Result};
use crate::installer::{InstallContext, NodeInstaller};

/// Polls the seed until exactly the expected replicas are connected.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaVerifier {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for ReplicaVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl ReplicaVerifier {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Returns the observed replica addresses once they match `expected`.
    ///
    /// Query errors count as "not yet"; the last one is reported if the
    /// deadline passes.
    pub async fn verify(
        &self,
        installer: &dyn NodeInstaller,
        seed: &InstallContext,
        expected: &[HostIdentity],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last_observation = match installer.connected_replicas(seed).await {
                Ok(observed) => {
                    let matched = match_replicas(expected, &observed);
                    if matched.is_complete() {
                        info!(replicas = ?observed, attempts, "All replicas connected");
                        return Ok(observed);
                    }
                    debug!(
                        observed = ?observed,
                        missing = ?matched.missing,
                        unexpected = ?matched.unexpected,
                        attempts,
                        "Replicas not yet converged"
                    );
                    matched.describe(expected.len(), observed.len())
                }
                Err(e) => {
                    debug!(error = %e, attempts, "Replica query failed");
                    format!("replica query failed: {e}")
                }
            };

            if Instant::now() + self.poll_interval > deadline {
                return Err(OrchestratorError::Verify(format!(
                    "{last_observation} after {:?} ({attempts} checks)",
                    self.timeout
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled {
                        phase: DeploymentPhase::Verifying,
                    });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Expected identities nobody reported, and reports matching no identity.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReplicaMatch {
    missing: Vec<String>,
    unexpected: Vec<String>,
}

impl ReplicaMatch {
    fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    fn describe(&self, expected: usize, observed: usize) -> String {
        let mut message = format!("observed {observed} of {expected} replicas");
        if !self.missing.is_empty() {
            message.push_str(&format!("; not connected: [{}]", self.missing.join(", ")));
        }
        if !self.unexpected.is_empty() {
            message.push_str(&format!("; unexpected: [{}]", self.unexpected.join(", ")));
        }
        message
    }
}

/// Pair each reported replica with at most one expected identity.
fn match_replicas(expected: &[HostIdentity], observed: &[String]) -> ReplicaMatch {
    let mut claimed = vec![false; expected.len()];
    let mut result = ReplicaMatch::default();

    for reported in observed {
        let slot = (0..expected.len()).find(|&i| !claimed[i] && expected[i].matches(reported));
        match slot {
            Some(i) => claimed[i] = true,
            None => result.unexpected.push(reported.clone()),
        }
    }

    result.missing = expected
        .iter()
        .zip(&claimed)
        .filter(|(_, claimed)| !**claimed)
        .map(|(identity, _)| identity.to_string())
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallerError;
    use crate::installer::InstallResult;
    use crate::run::ReplicationCredential;
    use async_trait::async_trait;
    use cluster_core::{Node, NodeRole, NodeSpec, Topology};
    use remote::{LocalSession, RemoteSession};
    use std::sync::{Arc, Mutex};

    /// Reports each queued answer once, then repeats the last one.
    struct QueuedReplicas {
        answers: Mutex<Vec<InstallResult<Vec<String>>>>,
        calls: Mutex<u32>,
    }

    impl QueuedReplicas {
        fn new(mut answers: Vec<InstallResult<Vec<String>>>) -> Self {
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NodeInstaller for QueuedReplicas {
        async fn check_environment(&self, _ctx: &InstallContext) -> InstallResult {
            Ok(())
        }

        async fn install(&self, _ctx: &InstallContext, _only_check: bool) -> InstallResult {
            Ok(())
        }

        async fn uninstall(&self, _s: &dyn RemoteSession, _port: u16, _dir: &str) -> InstallResult {
            Ok(())
        }

        async fn create_replication_user(
            &self,
            _seed: &InstallContext,
            _credential: &ReplicationCredential,
            _replicas: &[String],
        ) -> InstallResult {
            Ok(())
        }

        async fn clone_from_seed(
            &self,
            _replica: &InstallContext,
            _seed: &Node,
            _credential: &ReplicationCredential,
        ) -> InstallResult {
            Ok(())
        }

        async fn connected_replicas(&self, _seed: &InstallContext) -> InstallResult<Vec<String>> {
            *self.calls.lock().unwrap() += 1;
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop().unwrap()
            } else {
                match answers.last().unwrap() {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(InstallerError::Failed(e.to_string())),
                }
            }
        }
    }

    fn seed_context() -> InstallContext {
        let spec = NodeSpec::new("10.0.0.1", 5432, "/data");
        let topology = Topology::new("orders", "postgres", spec.clone());
        InstallContext::new(
            Arc::new(LocalSession::new("10.0.0.1")),
            Node::new(NodeRole::Seed, spec),
            &topology,
        )
    }

    fn expected() -> Vec<HostIdentity> {
        ["10.0.0.2", "10.0.0.3"]
            .into_iter()
            .map(|ip| HostIdentity::new(ip, vec![ip.parse().unwrap()]))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_converged() {
        let installer = QueuedReplicas::new(vec![
            Ok(vec![]),
            Err(InstallerError::Failed("connection refused".to_string())),
            Ok(vec!["10.0.0.2".to_string()]),
            Ok(vec!["10.0.0.3".to_string(), "10.0.0.2".to_string()]),
        ]);

        let observed = ReplicaVerifier::default()
            .verify(&installer, &seed_context(), &expected(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(observed.len(), 2);
        assert_eq!(installer.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_last_observation() {
        let installer = QueuedReplicas::new(vec![Ok(vec!["10.0.0.2".to_string()])]);
        let verifier = ReplicaVerifier::new(Duration::from_secs(2), Duration::from_secs(10));

        let err = verifier
            .verify(&installer, &seed_context(), &expected(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Verify(msg) => {
                assert!(msg.contains("observed 1 of 2"), "{msg}");
                assert!(msg.contains("not connected: [10.0.0.3]"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(installer.calls() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostnames_match_reported_addresses() {
        let installer = QueuedReplicas::new(vec![Ok(vec![
            "10.0.0.3".to_string(),
            "10.0.0.2".to_string(),
        ])]);
        let expected = vec![
            HostIdentity::new("db-2.internal", vec!["10.0.0.2".parse().unwrap()]),
            HostIdentity::new("db-3.internal", vec!["10.0.0.3".parse().unwrap()]),
        ];

        let observed = ReplicaVerifier::default()
            .verify(&installer, &seed_context(), &expected, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(observed, vec!["10.0.0.3", "10.0.0.2"]);
    }

    #[test]
    fn test_one_report_claims_one_identity() {
        let shared: std::net::IpAddr = "10.0.0.2".parse().unwrap();
        let expected = vec![
            HostIdentity::new("db-2a.internal", vec![shared]),
            HostIdentity::new("db-2b.internal", vec![shared]),
        ];

        let matched = match_replicas(&expected, &["10.0.0.2".to_string()]);
        assert_eq!(matched.missing, vec!["db-2b.internal (10.0.0.2)"]);
        assert!(matched.unexpected.is_empty());

        let matched = match_replicas(&expected, &["10.0.0.2".to_string(), "10.0.0.2".to_string()]);
        assert!(matched.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_identity_is_not_healthy() {
        let installer = QueuedReplicas::new(vec![Ok(vec![
            "10.0.0.2".to_string(),
            "10.0.0.99".to_string(),
        ])]);
        let verifier = ReplicaVerifier::new(Duration::from_secs(1), Duration::from_secs(3));

        let result = verifier
            .verify(&installer, &seed_context(), &expected(), &CancellationToken::new())
            .await;
        match result {
            Err(OrchestratorError::Verify(msg)) => {
                assert!(msg.contains("not connected: [10.0.0.3]"), "{msg}");
                assert!(msg.contains("unexpected: [10.0.0.99]"), "{msg}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_polling() {
        let installer = QueuedReplicas::new(vec![Ok(vec![])]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ReplicaVerifier::default()
            .verify(&installer, &seed_context(), &expected(), &cancel)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled { .. })));
    }
}
