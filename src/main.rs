use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stackyard::cli::{run_command, Cli, Commands, PidFile};
use stackyard::config::Config;
use stackyard::engine::{spawn_status_sweep, InstanceManager};
use stackyard::notifications::{EventKind, StatusEvent};
use stackyard::registry::InstanceStatus;
use stackyard::runtime::detect_runtime;
use stackyard::startup::run_startup_checks;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging. Logs go to stderr so command output stays parseable.
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        None | Some(Commands::Run) => run_daemon(config, cli.skip_checks).await,
        Some(_) => run_command(&cli, config).await,
    }
}

async fn run_daemon(config: Config, skip_checks: bool) -> Result<()> {
    tracing::info!("Starting stackyard v{}", env!("CARGO_PKG_VERSION"));

    // Detect container runtime
    let runtime = detect_runtime(&config.runtime).await?;

    if skip_checks {
        tracing::warn!("Startup checks skipped");
    } else {
        let report = run_startup_checks(&config, runtime.as_ref()).await;
        if !report.all_critical_passed {
            anyhow::bail!("Startup aborted: {}", report.summary);
        }
    }

    std::fs::create_dir_all(&config.server.data_dir)?;
    let _pid_file = PidFile::acquire(&config.server.data_dir)?;

    let monitor = config.monitor.clone();
    let manager = Arc::new(InstanceManager::from_config(config, runtime).await?);

    let list = manager.list().await;
    tracing::info!(
        instances = list.stats.total,
        running = list.stats.running,
        stopped = list.stats.stopped,
        "Instance registry loaded"
    );

    let event_log = tokio::spawn(log_events(manager.subscribe()));
    let sweep = spawn_status_sweep(manager.clone(), monitor);

    shutdown_signal().await;

    if let Some(sweep) = sweep {
        sweep.abort();
    }
    event_log.abort();

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Write every lifecycle event to the log until the channel closes.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<StatusEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.kind {
                EventKind::Created => {
                    tracing::info!(instance = %event.instance_id, name = %event.name, "Instance created")
                }
                EventKind::Deleted => {
                    tracing::info!(instance = %event.instance_id, name = %event.name, "Instance deleted")
                }
                EventKind::StatusChanged if event.status == InstanceStatus::Error => {
                    tracing::warn!(
                        instance = %event.instance_id,
                        name = %event.name,
                        error = event.message.as_deref().unwrap_or("unknown error"),
                        "Instance entered error state"
                    )
                }
                EventKind::StatusChanged => {
                    tracing::info!(
                        instance = %event.instance_id,
                        name = %event.name,
                        from = event.previous.map(|s| s.as_str()).unwrap_or("-"),
                        to = %event.status,
                        "Instance status changed"
                    )
                }
            },
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event log fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
