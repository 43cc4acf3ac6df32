//! Dynatrace Prometheus provisioner CLI
//!
//! Prepares an OpenShift cluster so Dynatrace can read its Prometheus
//! metrics, re-verifies an existing setup, and shows the endpoints.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commands::{endpoints, setup, verify};
use provision_lib::{init_tracing, ClusterClient, KubeCluster, LogFormat, ProvisionError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Dynatrace Prometheus provisioner
#[derive(Parser)]
#[command(name = "dtp")]
#[command(author, version, about = "Provision OpenShift Prometheus access for Dynatrace", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses KUBECONFIG or ~/.kube/config if not specified)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Configuration file (defaults to ~/.config/dtp/config.toml when present)
    #[arg(long, short = 'c', env = "DTP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the service account, grant read access, mint a token and write the configuration files
    Setup {
        #[command(flatten)]
        target: TargetArgs,

        /// Token validity in hours
        #[arg(long)]
        token_duration_hours: Option<u64>,

        /// Skip the connectivity probe and metric verification
        #[arg(long)]
        skip_probes: bool,

        /// Do not annotate the Prometheus service for scraping
        #[arg(long)]
        no_annotate: bool,

        /// Exit with status 2 when any step raised a warning
        #[arg(long)]
        strict: bool,
    },

    /// Re-run the connectivity probe and metric verification with an existing token
    Verify {
        #[command(flatten)]
        target: TargetArgs,

        /// Token file (defaults to the one written by setup)
        #[arg(long)]
        token_file: Option<PathBuf>,

        /// Also query the external route from this machine
        #[arg(long)]
        external: bool,

        /// Accept invalid TLS certificates for the external query
        #[arg(long, requires = "external")]
        insecure: bool,

        /// Exit with status 2 when any check raised a warning
        #[arg(long)]
        strict: bool,
    },

    /// Show the Prometheus endpoints without changing anything
    Endpoints,
}

/// Where the service account lives and where files go
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Namespace for the service account and probe workloads
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Service account name
    #[arg(long)]
    pub service_account: Option<String>,

    /// Directory for generated files
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let log_format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(level, log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            output::print_error(&format!("{:#}", err));
            let provision_err = err.downcast_ref::<ProvisionError>();
            if let Some(hint) = provision_err.and_then(output::error_hint) {
                output::print_info(hint);
            }
            let code = provision_err.map_or(1, ProvisionError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Setup {
            target,
            token_duration_hours,
            skip_probes,
            no_annotate,
            strict,
        } => {
            let overrides = config::Overrides::from_target(target)
                .token_duration_hours(token_duration_hours)
                .annotate_service(!no_annotate);
            let settings = config::load(cli.config.as_deref(), overrides)?;
            let cluster = connect(&cli.kubeconfig, cli.context.as_deref()).await?;
            setup::run(cluster, settings, skip_probes, strict, cli.format).await
        }
        Commands::Verify {
            target,
            token_file,
            external,
            insecure,
            strict,
        } => {
            let settings = config::load(cli.config.as_deref(), config::Overrides::from_target(target))?;
            let cluster = connect(&cli.kubeconfig, cli.context.as_deref()).await?;
            let options = verify::VerifyOptions {
                token_file,
                external,
                insecure,
                strict,
            };
            verify::run(cluster, settings, options, cli.format).await
        }
        Commands::Endpoints => {
            let settings = config::load(cli.config.as_deref(), config::Overrides::default())?;
            let cluster = connect(&cli.kubeconfig, cli.context.as_deref()).await?;
            endpoints::show(cluster.as_ref(), &settings, cli.format).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(kubeconfig: &Option<PathBuf>, context: Option<&str>) -> Result<Arc<dyn ClusterClient>> {
    tracing::debug!(kubeconfig = ?kubeconfig, context = ?context, "Connecting to cluster");
    let cluster = KubeCluster::connect(kubeconfig.as_deref(), context)
        .await
        .map_err(|e| ProvisionError::SessionUnavailable(e.to_string()))
        .context("Failed to connect to the cluster")?;
    Ok(Arc::new(cluster))
}
