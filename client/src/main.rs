use std::{net::SocketAddrV4, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use cfdevd_client::{BindRequest, ClientConfig, DaemonClient};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cfdevd-ctl")]
#[command(about = "Talk to the cfdevd helper daemon")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Daemon socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Per-operation timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon answers its handshake
    Probe,
    /// Remove the daemon's service registration
    Uninstall,
    /// Add the loopback aliases
    AddAliases,
    /// Remove the loopback aliases
    RemoveAliases,
    /// Have the daemon bind a TCP address and report what came back
    Bind {
        /// Address to bind, e.g. 10.144.0.2:443
        addr: SocketAddrV4,
        /// Request a UDP socket (always refused)
        #[arg(long)]
        udp: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::new().with_timeout(Duration::from_secs(args.timeout));
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    info!("Using daemon socket {}", config.socket_path.display());
    let client = DaemonClient::new(config);

    match args.command {
        Commands::Probe => {
            let daemon = client.probe().context("Failed to reach daemon")?;
            println!(
                "{} v{} ({})",
                daemon.identifier_lossy(),
                daemon.version,
                daemon.tag_lossy()
            );
        }

        Commands::Uninstall => {
            client.uninstall().context("Uninstall failed")?;
            println!("Uninstalled");
        }

        Commands::AddAliases => {
            client.add_ip_aliases().context("Failed to add aliases")?;
            println!("Aliases added");
        }

        Commands::RemoveAliases => {
            client.remove_ip_aliases().context("Failed to remove aliases")?;
            println!("Aliases removed");
        }

        Commands::Bind { addr, udp } => {
            let listener = client
                .bind(BindRequest { addr, udp })
                .with_context(|| format!("Failed to bind {addr}"))?;
            println!("Bound {}", listener.local_addr()?);
        }
    }

    Ok(())
}
