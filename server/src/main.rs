use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use cfdevd_server::{
    open_listener, platform_installer, Daemon, DaemonConfig, ServiceInstaller, SystemAliases,
};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cfdevd")]
#[command(about = "Privileged network helper daemon")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Socket path to bind when no activated socket is available
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Never adopt a socket from the service manager
    #[arg(long)]
    no_activation: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests until stopped (default)
    Run,
    /// Report whether the service manager has the daemon running
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = DaemonConfig::from_env();
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    if args.no_activation {
        config = config.with_socket_activation(false);
    }

    let installer = platform_installer(&config.service);

    match args.command.unwrap_or(Commands::Run) {
        Commands::Status => {
            let running = installer
                .is_running()
                .context("Failed to query service manager")?;
            println!(
                "{} is {}",
                config.service.label,
                if running { "running" } else { "not running" }
            );
            Ok(())
        }
        Commands::Run => run(config, installer).await,
    }
}

async fn run(config: DaemonConfig, installer: Arc<dyn ServiceInstaller>) -> Result<()> {
    info!("Starting cfdevd...");
    if nix::unistd::geteuid().is_root() {
        info!("Daemon running with root privileges");
    } else {
        warn!("Daemon not running as root - binds and alias changes will fail");
    }

    let bound = open_listener(&config).context("Failed to open daemon socket")?;
    let daemon = Daemon::new(config, installer, Arc::new(SystemAliases::default()));

    let shutdown = daemon.shutdown_handle();
    let mut terminate = signal(SignalKind::terminate()).context("Failed to set signal handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("SIGTERM received, stopping daemon"),
            _ = tokio::signal::ctrl_c() => warn!("Ctrl-C received, stopping daemon"),
        }
        shutdown.trigger();
    });

    daemon.run(bound.listener).await.context("Daemon error")?;

    if let Some(path) = bound.created {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to remove socket {}: {}", path.display(), e);
        }
    }

    info!("Daemon stopped");
    Ok(())
}
