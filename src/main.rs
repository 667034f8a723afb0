use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use telemsg_dispatcher::config;
use telemsg_dispatcher::dispatcher::Dispatcher;
use telemsg_dispatcher::notifier;
use telemsg_dispatcher::store::FsMarkerStore;

#[derive(Parser, Debug)]
#[command(name = "telemsg-dispatcher", about = "Chat notifications for anomaly marker files")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/telemsg-dispatcher/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Log notifications instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("telemsg-dispatcher {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = config::Config::load(&cli.config)?;
    config.validate(cli.dry_run)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        marker_dir = %config.dispatcher.marker_dir,
        "Starting telemsg dispatcher"
    );

    if let Err(e) = run(config, &cli).await {
        error!(error = %e, "Dispatcher terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &config::Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.agent.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: config::Config, cli: &Cli) -> Result<()> {
    let store = Arc::new(FsMarkerStore::new(&config.dispatcher.marker_dir));
    let sender: Arc<dyn notifier::NotificationSender> =
        Arc::from(notifier::create_sender(&config, cli.dry_run)?);

    if config.dispatcher.destinations.is_empty() {
        warn!("No destinations configured; markers will be consumed without notifying anyone");
    }

    let dispatcher = Dispatcher::new(store, sender, config.dispatcher.destinations.clone())
        .with_max_concurrent(config.dispatcher.max_concurrent_events);

    if cli.once {
        let report = dispatcher.poll_once().await?;
        info!(
            applied = report.applied,
            failed = report.failed,
            messages = report.messages,
            "Single poll finished"
        );
        return Ok(());
    }

    dispatcher
        .run(config.dispatcher.poll_interval(), shutdown_signal())
        .await;

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal, exiting");
}
