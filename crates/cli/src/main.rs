mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orchestrator::{
    AssumeYes, CancellationToken, ConfirmationGate, DeployMode, DeploymentOrchestrator,
    ScriptInstaller, TerminalGate,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{ClusterConfig, Overrides};

const DEFAULT_FILTER: &str = "clusterforge=info,orchestrator=info,remote=info";
const VERBOSE_FILTER: &str = "clusterforge=debug,orchestrator=debug,remote=debug";

#[derive(Parser)]
#[command(name = "clusterforge")]
#[command(about = "Deploy replicated database clusters over SSH", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log remote commands and per-node detail
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the seed, its secondaries and any auxiliaries
    Deploy {
        #[command(flatten)]
        target: Target,

        /// Stage and run every check without installing
        #[arg(long)]
        check_only: bool,

        /// Write connection details, including the replication password, as JSON
        #[arg(long)]
        info_file: Option<PathBuf>,

        #[arg(long)]
        staging_dir: Option<String>,

        #[arg(long)]
        parallelism: Option<usize>,

        #[arg(long)]
        max_secondaries: Option<usize>,

        /// Seconds to wait for all replicas to connect
        #[arg(long)]
        verify_timeout: Option<u64>,
    },
    /// Uninstall every node of a cluster
    RemoveDeploy {
        #[command(flatten)]
        target: Target,
    },
    /// Check a configuration file and list every problem
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct Target {
    #[arg(short, long)]
    config: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

impl Target {
    fn gate(&self) -> Arc<dyn ConfirmationGate> {
        if self.yes {
            Arc::new(AssumeYes)
        } else {
            Arc::new(TerminalGate)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Deploy {
            target,
            check_only,
            info_file,
            staging_dir,
            parallelism,
            max_secondaries,
            verify_timeout,
        } => {
            let overrides = Overrides {
                staging_dir,
                parallelism,
                max_secondaries,
                verify_timeout_secs: verify_timeout,
            };
            let mode = if check_only {
                DeployMode::CheckOnly
            } else {
                DeployMode::Full
            };
            deploy(&target, &overrides, mode, info_file).await
        }
        Commands::RemoveDeploy { target } => remove(&target).await,
        Commands::Validate { config } => validate(&config),
    }
}

fn load(path: &Path, overrides: &Overrides) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::load(path)?;
    config.apply(overrides);
    Ok(config)
}

fn build_orchestrator(config: &ClusterConfig, target: &Target) -> Result<DeploymentOrchestrator> {
    let installer = ScriptInstaller::from_topology(&config.topology)
        .context("Invalid engine_parameters")?;
    Ok(
        DeploymentOrchestrator::new(Arc::new(config.connector()), Arc::new(installer))
            .with_gate(target.gate())
            .with_validator(config.validator())
            .with_config(config.orchestrator_config()),
    )
}

/// Token cancelled on the first Ctrl+C; the run then stops at its next step
/// boundary and still rolls back. A second Ctrl+C exits immediately.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping after the current step (Ctrl+C again to exit now)");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Exiting without rollback or cleanup");
            std::process::exit(130);
        }
    });
    token
}

async fn deploy(
    target: &Target,
    overrides: &Overrides,
    mode: DeployMode,
    info_file: Option<PathBuf>,
) -> Result<()> {
    let config = load(&target.config, overrides)?;
    let orchestrator = build_orchestrator(&config, target)?;
    tracing::info!(
        config = %target.config.display(),
        cluster = %config.topology.cluster_name,
        "Loaded cluster configuration"
    );

    let summary = orchestrator
        .execute(&config.topology, mode, cancel_on_interrupt())
        .await?;

    if let Some(path) = &info_file {
        output::write_info_file(path, &summary)?;
        println!("Connection details written to {}", path.display());
    }
    print!("{}", output::render_summary(&summary, info_file.is_none()));
    Ok(())
}

async fn remove(target: &Target) -> Result<()> {
    let config = load(&target.config, &Overrides::default())?;
    let orchestrator = build_orchestrator(&config, target)?;

    let report = orchestrator
        .remove(&config.topology, cancel_on_interrupt())
        .await?;

    print!("{}", output::render_removal(&config.topology.cluster_name, &report));
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let config = load(path, &Overrides::default())?;
    config.validator().validate(&config.topology)?;

    println!(
        "{}: cluster '{}' with {} nodes is valid",
        path.display(),
        config.topology.cluster_name,
        config.topology.nodes().len()
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}
