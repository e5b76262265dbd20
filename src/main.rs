//! agent-stack - Deployment CLI
//!
//! Deploys, tests and tears down the supervisor/collaborator agent stack.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use agent_stack::cleanup::confirm;
use agent_stack::collaborators::{Domain, Selection};
use agent_stack::config::{BackendKind, PollingConfig};
use agent_stack::package::PackageSource;
use agent_stack::provider::Backend;
use agent_stack::{CleanupCoordinator, Config, DeploymentContext, DeploymentPlan, Orchestrator};
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default directory of documents for the knowledge base.
const DEFAULT_DATA_DIR: &str = "data";

/// Bootstrap bytes used by the local simulator when no runtime binary is built.
const PLACEHOLDER_BOOTSTRAP: &[u8] = b"#!/bin/sh\nexec collaborator-runtime\n";

/// Multi-agent stack deployment and management.
#[derive(Debug, Parser)]
#[command(name = "agent-stack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Control plane to talk to.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// State file of the local backend.
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Aws,
    Local,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Aws => BackendKind::Aws,
            BackendArg::Local => BackendKind::Local,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deploy the complete system.
    Deploy(DeployArgs),
    /// Delete every deployed resource.
    Cleanup(CleanupArgs),
    /// Send a query to the deployed supervisor.
    Test(TestArgs),
    /// Show the effective configuration.
    Config,
}

#[derive(Debug, Args)]
struct DeployArgs {
    /// Upload documents to the knowledge base (default).
    #[arg(long)]
    upload_data: bool,

    /// Skip the document upload and ingestion.
    #[arg(long, conflicts_with = "upload_data")]
    no_upload_data: bool,

    /// Directory or file to upload.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Disable the weather collaborator.
    #[arg(long)]
    disable_weather: bool,

    /// Disable the stock market collaborator.
    #[arg(long)]
    disable_stock: bool,

    /// Disable the news collaborator.
    #[arg(long)]
    disable_news: bool,

    /// Collaborator runtime executable to package into functions.
    #[arg(long)]
    runtime_binary: Option<PathBuf>,
}

impl DeployArgs {
    fn selection(&self) -> Selection {
        let mut selection = Selection::all();
        for (disabled, domain) in [
            (self.disable_weather, Domain::Weather),
            (self.disable_stock, Domain::Stock),
            (self.disable_news, Domain::News),
        ] {
            if disabled {
                selection = selection.without(domain);
            }
        }
        selection
    }

    /// Reject a deployment with nothing to deploy before touching the backend.
    fn check(&self) -> anyhow::Result<()> {
        if self.selection().collaborators().is_empty() {
            bail!("no collaborators enabled; at least one is required");
        }
        Ok(())
    }

    /// Document path to upload, if any. A missing default directory is
    /// skipped; an explicit one is passed through and fails the upload.
    fn upload_path(&self) -> Option<PathBuf> {
        if self.no_upload_data {
            return None;
        }
        match &self.data_dir {
            Some(dir) => Some(dir.clone()),
            None => {
                let dir = PathBuf::from(DEFAULT_DATA_DIR);
                if dir.exists() {
                    Some(dir)
                } else {
                    warn!(dir = %dir.display(), "Data directory not found, skipping upload");
                    None
                }
            }
        }
    }
}

#[derive(Debug, Args)]
struct CleanupArgs {
    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
struct TestArgs {
    /// Query for the supervisor.
    query: String,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_stack=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }
    if let Some(state_file) = &cli.state_file {
        config.state_file = state_file.clone();
    }
    if config.backend == BackendKind::Local {
        config.polling = PollingConfig::immediate();
    }

    match cli.command {
        Commands::Config => {
            print_config(&config);
            Ok(())
        }
        Commands::Deploy(args) => {
            args.check()?;
            if let Some(path) = &args.runtime_binary {
                config.runtime_binary = Some(path.clone());
            }
            let (ctx, backend) = connect(config).await?;
            let result = deploy(ctx, &backend, args).await;
            finish(&backend, result)
        }
        Commands::Cleanup(args) => {
            if !args.yes {
                let stdin = io::stdin();
                let mut stdout = io::stdout();
                if !confirm(stdin.lock(), &mut stdout)? {
                    println!("Cleanup cancelled");
                    return Ok(());
                }
            }
            let (ctx, backend) = connect(config).await?;
            let result = cleanup(ctx, &backend).await;
            finish(&backend, result)
        }
        Commands::Test(args) => {
            let (ctx, backend) = connect(config).await?;
            let result = test(ctx, &backend, args).await;
            finish(&backend, result)
        }
    }
}

/// Open the configured backend and discover the caller identity.
async fn connect(config: Config) -> anyhow::Result<(Arc<DeploymentContext>, Backend)> {
    info!(backend = %config.backend, region = %config.region, "Connecting");
    let backend = Backend::connect(&config).await?;
    let plane = backend.control_plane();
    let ctx = DeploymentContext::discover(config, plane.identity.as_ref()).await?;
    Ok((ctx, backend))
}

/// Persist backend state whether or not the command succeeded.
fn finish(backend: &Backend, result: anyhow::Result<()>) -> anyhow::Result<()> {
    if let Err(e) = backend.persist() {
        error!("Failed to save backend state: {}", e);
        if result.is_ok() {
            return Err(e.into());
        }
    }
    result
}

fn package_source(config: &Config) -> anyhow::Result<PackageSource> {
    match config.resolve_runtime_binary() {
        Some(path) if path.is_file() => Ok(PackageSource::Binary(path)),
        Some(path) if config.runtime_binary.is_some() => {
            bail!("runtime binary {} does not exist", path.display())
        }
        _ if config.backend == BackendKind::Local => {
            warn!(
                "collaborator-runtime binary not found, packaging a placeholder for the local backend"
            );
            Ok(PackageSource::Inline(PLACEHOLDER_BOOTSTRAP.to_vec()))
        }
        _ => bail!(
            "collaborator-runtime binary not found; build it or pass --runtime-binary"
        ),
    }
}

async fn deploy(
    ctx: Arc<DeploymentContext>,
    backend: &Backend,
    args: DeployArgs,
) -> anyhow::Result<()> {
    let mut plan =
        DeploymentPlan::new(package_source(&ctx.config)?).with_selection(args.selection());
    if let Some(path) = args.upload_path() {
        plan = plan.with_upload(path);
    }

    let orchestrator = Orchestrator::new(ctx, &backend.control_plane());
    let report = orchestrator.deploy(&plan).await?;

    println!("{}", "=".repeat(80));
    println!("DEPLOYMENT SUCCESSFUL");
    println!("{}", "=".repeat(80));
    for line in report.summary() {
        println!("{}", line);
    }
    println!("{}", "=".repeat(80));
    Ok(())
}

async fn cleanup(ctx: Arc<DeploymentContext>, backend: &Backend) -> anyhow::Result<()> {
    let coordinator = CleanupCoordinator::new(ctx, &backend.control_plane());
    let report = coordinator.run().await;

    println!(
        "Deleted {} resources in {:.2} seconds",
        report.total_deleted(),
        report.elapsed.as_secs_f64()
    );
    if let Some(summary) = report.error_summary() {
        bail!(
            "cleanup finished with errors:\n{}\nCheck the console and delete the remaining resources manually.",
            summary
        );
    }
    Ok(())
}

async fn test(
    ctx: Arc<DeploymentContext>,
    backend: &Backend,
    args: TestArgs,
) -> anyhow::Result<()> {
    info!(query = %args.query, "Testing supervisor");
    let orchestrator = Orchestrator::new(ctx, &backend.control_plane());
    let answer = orchestrator
        .ask(&args.query)
        .await
        .context("supervisor could not be invoked; is the system deployed?")?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", "=".repeat(80))?;
    writeln!(stdout, "AGENT RESPONSE")?;
    writeln!(stdout, "{}", "=".repeat(80))?;
    writeln!(stdout, "{}", answer)?;
    writeln!(stdout, "{}", "=".repeat(80))?;
    Ok(())
}

fn print_config(config: &Config) {
    println!("Backend:            {}", config.backend);
    println!("Region:             {}", config.region);
    println!("Base name:          {}", config.naming.base_name);
    println!("KB base name:       {}", config.naming.kb_base_name);
    println!("Storage base name:  {}", config.naming.storage_base_name);
    println!("Foundation model:   {}", config.foundation_model);
    println!(
        "Embedding model:    {} ({} dimensions)",
        config.embedding_model, config.embedding_dimension
    );
    if config.backend == BackendKind::Local {
        println!("State file:         {}", config.state_file.display());
        println!("Account id:         {}", config.local_account_id);
    }
    match config.resolve_runtime_binary() {
        Some(path) => println!("Runtime binary:     {}", path.display()),
        None => println!("Runtime binary:     (not found)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_args(flags: &[&str]) -> DeployArgs {
        let argv = ["agent-stack", "deploy"].iter().chain(flags).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Deploy(args) => args,
            other => panic!("expected deploy, got {other:?}"),
        }
    }

    #[test]
    fn deploy_without_collaborators_is_rejected_up_front() {
        let args = deploy_args(&["--disable-weather", "--disable-stock", "--disable-news"]);
        let err = args.check().unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn one_collaborator_is_enough() {
        let args = deploy_args(&["--disable-weather", "--disable-stock"]);
        args.check().unwrap();
        assert_eq!(args.selection().collaborators().len(), 1);
    }

    #[test]
    fn upload_flags_conflict() {
        let argv = ["agent-stack", "deploy", "--upload-data", "--no-upload-data"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
