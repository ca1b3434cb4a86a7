use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dg_domain::config::Config;
use dg_gateway::api;
use dg_gateway::state::AppState;
use dg_sandbox::docker::DockerRuntime;
use dg_store::Repository;

#[derive(Parser)]
#[command(name = "deepgate", about = "Multi-tenant agent orchestration server")]
struct Cli {
    /// Path to deepgate.toml (defaults to $DEEPGATE_CONFIG, then built-ins).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default).
    Serve,
    /// Load and validate the configuration, then exit.
    ConfigValidate,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var("DEEPGATE_CONFIG").ok().map(PathBuf::from));

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(config_path.as_deref()).context("loading configuration")?;
            config.validate().context("validating configuration")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load(config_path.as_deref()).context("loading configuration")?;
            config.validate().context("validating configuration")?;
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("deepgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dg_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "DeepGate starting");

    std::fs::create_dir_all(&config.storage.base_dir)
        .with_context(|| format!("creating {}", config.storage.base_dir.display()))?;
    std::fs::create_dir_all(config.storage.skills_dir())?;

    let repo = Arc::new(
        Repository::connect(&config.database.url)
            .await
            .context("connecting to the database")?,
    );
    tracing::info!(url = %config.database.url, "database ready");

    let runtime = Arc::new(DockerRuntime::connect().context("connecting to the container runtime")?);
    let state = AppState::build(config.clone(), repo, runtime);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    let app = api::router(state.clone());
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, stopping sandboxes");
            shutdown_state.sandboxes.stop_all().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
