//! Human confirmation before destructive operations.

use async_trait::async_trait;
use cluster_core::Topology;
use std::fmt::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::report::NodeSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Deploy,
    Remove,
}

/// What the operator is asked to approve.
#[derive(Debug, Clone)]
pub struct ConfirmationPrompt {
    pub kind: ConfirmationKind,
    pub cluster_name: String,
    pub engine: String,
    pub nodes: Vec<NodeSummary>,
}

impl ConfirmationPrompt {
    pub fn new(kind: ConfirmationKind, topology: &Topology) -> Self {
        Self {
            kind,
            cluster_name: topology.cluster_name.clone(),
            engine: topology.engine.clone(),
            nodes: topology.nodes().iter().map(NodeSummary::from).collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.kind {
            ConfirmationKind::Deploy => {
                let _ = writeln!(
                    out,
                    "About to deploy {} cluster '{}' on {} nodes:",
                    self.engine,
                    self.cluster_name,
                    self.nodes.len()
                );
            }
            ConfirmationKind::Remove => {
                let _ = writeln!(
                    out,
                    "WARNING: this permanently removes {} cluster '{}'.",
                    self.engine, self.cluster_name
                );
                let _ = writeln!(
                    out,
                    "Services will be stopped and ALL DATA in the directories below deleted. This cannot be undone."
                );
            }
        }

        for node in &self.nodes {
            let _ = writeln!(
                out,
                "  {:<10} {}:{}  data: {}",
                node.role.as_str(),
                node.address,
                node.service_port,
                node.data_dir
            );
        }

        let question = match self.kind {
            ConfirmationKind::Deploy => "Proceed? [y/N] ",
            ConfirmationKind::Remove => "Really remove the cluster and delete its data? [y/N] ",
        };
        out.push_str(question);
        out
    }
}

/// Only "y" or "yes" in any case counts as approval.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, prompt: &ConfirmationPrompt) -> bool;
}

/// Reads the answer from standard input.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalGate;

#[async_trait]
impl ConfirmationGate for TerminalGate {
    async fn confirm(&self, prompt: &ConfirmationPrompt) -> bool {
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(prompt.render().as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(_) => is_affirmative(&line),
            Err(e) => {
                warn!(error = %e, "Cannot read confirmation");
                false
            }
        }
    }
}

/// Approves everything; for `--yes` and scripted runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

#[async_trait]
impl ConfirmationGate for AssumeYes {
    async fn confirm(&self, prompt: &ConfirmationPrompt) -> bool {
        debug!(kind = ?prompt.kind, "Confirmation bypassed");
        true
    }
}

/// Answers every prompt with a fixed response.
#[derive(Debug, Clone)]
pub struct FixedAnswer(pub String);

impl FixedAnswer {
    pub fn new(answer: impl Into<String>) -> Self {
        Self(answer.into())
    }
}

#[async_trait]
impl ConfirmationGate for FixedAnswer {
    async fn confirm(&self, _prompt: &ConfirmationPrompt) -> bool {
        is_affirmative(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::NodeSpec;

    fn topology() -> Topology {
        Topology::new("orders", "postgres", NodeSpec::new("10.0.0.1", 5432, "/var/lib/pg"))
            .with_secondary(NodeSpec::new("10.0.0.2", 5432, "/var/lib/pg"))
    }

    #[test]
    fn test_affirmative_answers() {
        for answer in ["y", "Y", "yes", "YES", " Yes\n"] {
            assert!(is_affirmative(answer), "{answer:?}");
        }
        for answer in ["", "n", "no", "yep", "sure", "y e s"] {
            assert!(!is_affirmative(answer), "{answer:?}");
        }
    }

    #[test]
    fn test_prompt_lists_nodes() {
        let rendered = ConfirmationPrompt::new(ConfirmationKind::Deploy, &topology()).render();

        assert!(rendered.contains("10.0.0.1:5432"));
        assert!(rendered.contains("10.0.0.2:5432"));
        assert!(rendered.contains("/var/lib/pg"));
        assert!(rendered.ends_with("[y/N] "));
    }

    #[test]
    fn test_removal_prompt_warns_about_data_loss() {
        let rendered = ConfirmationPrompt::new(ConfirmationKind::Remove, &topology()).render();
        assert!(rendered.starts_with("WARNING"));
        assert!(rendered.contains("cannot be undone"));
    }

    #[tokio::test]
    async fn test_fixed_answers() {
        let prompt = ConfirmationPrompt::new(ConfirmationKind::Deploy, &topology());

        assert!(AssumeYes.confirm(&prompt).await);
        assert!(FixedAnswer::new("Yes").confirm(&prompt).await);
        assert!(!FixedAnswer::new("nope").confirm(&prompt).await);
    }
}
