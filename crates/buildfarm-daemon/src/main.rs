//! The buildfarm coordinator daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use buildfarm_api::AppState;
use buildfarm_config::FarmConfig;
use buildfarm_dispatch::{BuildEvent, Dispatcher, DispatcherHandle};
use buildfarm_exec::LocalRunner;

mod supervisor;

#[derive(Parser)]
#[command(name = "buildfarmd")]
#[command(about = "CI build dispatcher", long_about = None)]
struct Cli {
    /// Path to the farm configuration document
    #[arg(long, env = "BUILDFARM_CONFIG", default_value = "farm.kdl")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator (default)
    Run,
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Check => check(&cli.config),
        Command::Run => run(cli.config).await,
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = FarmConfig::load(path)
        .with_context(|| format!("configuration error in {}", path.display()))?;
    println!(
        "configuration OK: {} workers, {} builders, {} schedulers, {} sources",
        config.workers.len(),
        config.builders.len(),
        config.schedulers.len(),
        config.sources.len()
    );
    Ok(())
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    // A broken configuration must refuse to start, not run partially.
    let config = Arc::new(
        FarmConfig::load(&config_path)
            .with_context(|| format!("configuration error in {}", config_path.display()))?,
    );
    info!(
        project = %config.project,
        workers = config.workers.len(),
        builders = config.builders.len(),
        "starting coordinator"
    );

    let runner = Arc::new(LocalRunner::new(config.state_dir.join("workers")));
    let (dispatcher, _dispatcher_task) = Dispatcher::spawn(config.clone(), runner);

    tokio::spawn(log_events(dispatcher.clone()));
    tokio::spawn(supervisor::run(dispatcher.clone()));

    let app = buildfarm_api::router(AppState::new(dispatcher, &config_path))
        .layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen))?;
    info!(listen = %config.listen, "status API up");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shut down");
    Ok(())
}

/// Log build outcomes; the failure edge is the operator-facing alert.
async fn log_events(dispatcher: DispatcherHandle) {
    let mut events = dispatcher.subscribe();
    loop {
        match events.recv().await {
            Ok(BuildEvent::FailureEdge(notification)) => {
                warn!(
                    builder = %notification.builder,
                    run = %notification.run,
                    step = ?notification.failing_step,
                    "builder started failing"
                );
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "cannot install shutdown handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
