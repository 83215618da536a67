//! metric-collector entry point.
//!
//! Resolves configuration, installs logging and runs the selected service
//! until a shutdown signal arrives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use metric_collector::agent::Agent;
use metric_collector::cli::{Args, Commands, LogLevel};
use metric_collector::commands::command_keygen;
use metric_collector::config::{self, AgentConfig, Config, ServerConfig, DEFAULT_SHUTDOWN_GRACE};
use metric_collector::server;

/// -------------------------------------------------------------------
/// LOGGING
/// -------------------------------------------------------------------
fn setup_logging(args: &Args) {
    let level = match args.log_level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// -------------------------------------------------------------------
/// CONFIGURATION
/// -------------------------------------------------------------------
fn load_file_config(args: &Args) -> anyhow::Result<Config> {
    match (&args.config, args.no_config) {
        (Some(path), false) => Ok(config::load(path)?),
        _ => Ok(Config::default()),
    }
}

/// Handles `--show-config` and `--check-config`. Returns true when the
/// process should exit afterwards.
fn inspect_config<T: Serialize>(
    args: &Args,
    effective: &T,
    validation: Result<(), config::ConfigError>,
) -> anyhow::Result<bool> {
    if args.check_config {
        if let Err(e) = validation {
            eprintln!("Configuration invalid: {e}");
            std::process::exit(1);
        }
        println!("Configuration is valid");
        return Ok(true);
    }
    if args.show_config {
        println!("{}", config::render(effective, args.config_format.into())?);
        return Ok(true);
    }
    Ok(false)
}

/// -------------------------------------------------------------------
/// SHUTDOWN
/// -------------------------------------------------------------------
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Runs `service` until it ends or a signal arrives; after a signal the
/// token is cancelled and the service gets `grace` to finish.
async fn run_until_signal<F>(
    service: F,
    shutdown: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut task = tokio::spawn(service);
    tokio::select! {
        joined = &mut task => return joined.context("service task failed")?,
        _ = shutdown_signal() => {}
    }

    shutdown.cancel();
    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => joined.context("service task failed")?,
        Err(_) => {
            warn!(?grace, "Shutdown grace period elapsed, aborting");
            task.abort();
            Ok(())
        }
    }
}

/// -------------------------------------------------------------------
/// MAIN APPLICATION ENTRY POINT
/// -------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = load_file_config(&args)?;
    let grace = Duration::from_secs(
        args.shutdown_grace
            .or(file.shutdown_grace)
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE),
    );
    let shutdown = CancellationToken::new();

    match &args.command {
        Commands::Keygen { dir, bits } => {
            setup_logging(&args);
            let (private, public) = command_keygen(dir, *bits)?;
            println!("Private key: {}", private.display());
            println!("Public key:  {}", public.display());
            Ok(())
        }
        Commands::Agent(agent_args) => {
            let effective = file.agent.overlay(AgentConfig::from(agent_args));
            if inspect_config(&args, &effective.clone().with_defaults(), effective.validate())? {
                return Ok(());
            }
            let settings = effective.resolve()?;

            setup_logging(&args);
            info!(address = %settings.address, "Starting metric-collector agent");
            let agent = Arc::new(Agent::new(settings)?);
            let token = shutdown.clone();
            run_until_signal(
                async move {
                    agent.run(token).await;
                    Ok(())
                },
                shutdown,
                grace,
            )
            .await
        }
        Commands::Server(server_args) => {
            let effective = file.server.overlay(ServerConfig::from(server_args));
            if inspect_config(&args, &effective.clone().with_defaults(), effective.validate())? {
                return Ok(());
            }
            let settings = effective.resolve()?;

            setup_logging(&args);
            info!(address = %settings.address, "Starting metric-collector server");
            run_until_signal(server::run(settings, shutdown.clone()), shutdown, grace).await
        }
    }
}
