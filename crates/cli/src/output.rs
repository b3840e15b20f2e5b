use anyhow::{Context, Result};
use orchestrator::{DeploymentSummary, NodeSummary, RollbackReport};
use std::fmt::Write as _;
use std::path::Path;

const RULE: &str = "════════════════════════════════════════";

fn node_line(out: &mut String, node: &NodeSummary) {
    let _ = writeln!(
        out,
        "  {:<10} {}:{}  {}",
        node.role.as_str(),
        node.address,
        node.service_port,
        node.data_dir
    );
}

/// Terminal report of a finished run.
///
/// The replication password is only shown when `reveal_secret` is set;
/// otherwise it is expected to go to the info file.
pub fn render_summary(summary: &DeploymentSummary, reveal_secret: bool) -> String {
    let mut out = String::new();
    let verb = if summary.check_only {
        "checked"
    } else {
        "deployed"
    };

    let _ = writeln!(out);
    let _ = writeln!(out, "Cluster '{}' ({}) {}", summary.cluster_name, summary.engine, verb);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out);
    for node in summary.nodes() {
        node_line(&mut out, node);
    }

    if let Some(credential) = &summary.replication {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Replication user:     {}", credential.user);
        if reveal_secret {
            let _ = writeln!(out, "  Replication password: {}", credential.password());
        }
    }
    if !summary.check_only {
        let _ = writeln!(
            out,
            "  Connected replicas:   {}",
            summary.connected_replicas.join(", ")
        );
    }

    if !summary.cleanup.is_clean() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", summary.cleanup);
    }
    out
}

pub fn render_removal(cluster_name: &str, report: &RollbackReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "Cluster '{cluster_name}' removed");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "{report}");
    out
}

/// Write the summary, including the replication credential, as pretty JSON.
pub fn write_info_file(path: &Path, summary: &DeploymentSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write info file {}", path.display()))
}
