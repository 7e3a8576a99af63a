use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use devbot_config::{Config, LogFormat, LoggingConfig, DEFAULT_CONFIG_FILE};
use devbot_controllers::pipeline::CommandTools;
use devbot_controllers::{Context, Settings};
use devbot_github::RestClient;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "devbot", version, about = "GitOps continuous deployment for Kubernetes")]
struct Cli {
    /// Path to the operator configuration
    #[arg(long, short, global = true, env = "DEVBOT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all controllers against the current cluster
    Run,
    /// Print the custom resource definitions as a YAML stream
    Crds,
    /// Print the effective configuration (file + environment)
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => {
            for (i, crd) in devbot_api::crds().iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                print!("{}", serde_yaml::to_string(crd)?);
            }
        }
        Commands::Config => {
            let config = load(&cli.config)?;
            print!("{}", config.to_toml()?);
        }
        Commands::Run => {
            let config = load(&cli.config)?;
            init_logging(&config.logging)?;
            serve(&config).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load(path: &Path) -> anyhow::Result<Config> {
    Config::load_with_env(path).with_context(|| format!("failed to load config from {}", path.display()))
}

/// `RUST_LOG` takes precedence over `logging.filter`.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.filter)
            .with_context(|| format!("invalid log filter '{}'", logging.filter))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }
    Ok(())
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let github = RestClient::new(&config.github.api_url, config.github_timeout()?)?;
    let tools = CommandTools::from_config(&config.tools, config.tools_timeout()?);
    let settings = Settings::from_config(config)?;

    std::fs::create_dir_all(&settings.workspace_root)
        .with_context(|| format!("failed to create {}", settings.workspace_root.display()))?;

    let client = kube::Client::try_default()
        .await
        .context("failed to connect to the cluster")?;

    tracing::info!(
        workspace = %settings.workspace_root.display(),
        apply_mode = ?settings.apply_mode,
        "starting controllers"
    );

    let ctx = Context {
        github: Arc::new(github),
        tools: Arc::new(tools),
        settings,
    };
    devbot_controllers::runtime::run(client, ctx).await;

    tracing::info!("controllers stopped");
    Ok(())
}
