use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shipwright::agent::{PermissionEnvelope, SubprocessAgent};
use shipwright::config::Config;
use shipwright::notify::WebhookNotifier;
use shipwright::orchestrator::Orchestrator;
use shipwright::release::HttpReleaseWatcher;
use shipwright::risk::RiskPolicy;
use shipwright::store::HttpStore;
use shipwright::tree::SourceTree;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Autonomous change-delivery pipeline")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// The checkout the pipeline operates on. Defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the poll loop until interrupted
    Run,
    /// Process at most one work item, then exit
    Once,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    Show,
    Validate,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "shipwright=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let tree = SourceTree::open(&config.project_dir, &config.remote, &config.integrated_branch)
        .context("Failed to open the working checkout")?;
    let store = Arc::new(HttpStore::new(&config.store_url, config.store_token.clone()));
    let agent = Arc::new(SubprocessAgent::new(
        &config.agent_cmd,
        config.agent_args.clone(),
        config.project_dir.clone(),
    ));
    let notifier = Arc::new(WebhookNotifier::new(
        config.status_webhook.clone(),
        config.review_webhook.clone(),
    ));
    let releases = Arc::new(HttpReleaseWatcher::new(
        &config.store_url,
        config.store_token.clone(),
        config.release_poll_interval(),
        config.release_poll_window(),
    ));
    let policy = RiskPolicy::with_extra(&config.forbidden_paths);
    let envelope = PermissionEnvelope::new(
        policy.forbidden_prefixes().to_vec(),
        config.agent_max_iterations,
        config.agent_timeout(),
    );

    Ok(Orchestrator::new(
        store,
        agent,
        notifier,
        releases,
        tree,
        policy,
        envelope,
        config.poll_interval(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::load(project_dir)?;

    match &cli.command {
        Commands::Run => {
            config.validate()?;
            let orchestrator = build_orchestrator(&config)?;
            orchestrator.run().await;
        }
        Commands::Once => {
            config.validate()?;
            let orchestrator = build_orchestrator(&config)?;
            orchestrator.tick().await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => println!("{:#?}", config),
            ConfigCommands::Validate => {
                config.validate()?;
                println!("configuration ok");
            }
        },
    }

    Ok(())
}
