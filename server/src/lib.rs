//! cfdevd: the privileged half of a privilege-separated pair.
//!
//! The daemon runs as root and accepts connections on a Unix domain socket.
//! Every connection carries one handshake and one command:
//!
//! | code | command |
//! |---|---|
//! | 1 | Uninstall |
//! | 2 | RemoveIPAlias |
//! | 3 | AddIPAlias |
//! | 6 | Bind |
//!
//! Bind is the reason the daemon exists: it binds a TCP listener on an
//! allow-listed address and passes the live descriptor back to the
//! unprivileged client.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use tokio::{net::UnixListener, sync::watch};

pub mod alias;
pub mod allow_list;
pub mod bind;
pub mod config;
mod connection;
pub mod installer;

pub use alias::{LoopbackAliases, SystemAliases};
pub use allow_list::AllowList;
pub use bind::{OsBinder, SocketBinder};
pub use config::{DaemonConfig, ServiceConfig};
pub use installer::{platform_installer, ServiceInstaller};

/// State shared by every connection handler. Immutable once the accept loop
/// has started.
pub(crate) struct Context {
    pub(crate) config:     DaemonConfig,
    pub(crate) allow_list: AllowList,
    pub(crate) installer:  Arc<dyn ServiceInstaller>,
    pub(crate) aliases:    Arc<dyn LoopbackAliases>,
    pub(crate) binder:     Arc<dyn SocketBinder>,
    pub(crate) shutdown:   ShutdownHandle,
}

/// Requests that the daemon stop accepting connections
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The privileged daemon
pub struct Daemon {
    config:     DaemonConfig,
    allow_list: AllowList,
    installer:  Arc<dyn ServiceInstaller>,
    aliases:    Arc<dyn LoopbackAliases>,
    binder:     Arc<dyn SocketBinder>,
    shutdown:   ShutdownHandle,
}

impl Daemon {
    /// Creates a daemon acting on the default allow-list through the OS binder
    pub fn new(
        config: DaemonConfig,
        installer: Arc<dyn ServiceInstaller>,
        aliases: Arc<dyn LoopbackAliases>,
    ) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            config,
            allow_list: AllowList::default(),
            installer,
            aliases,
            binder: Arc::new(OsBinder),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        }
    }

    /// Replace the set of addresses the daemon acts on
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    /// Replace the OS binder
    pub fn with_binder(mut self, binder: Arc<dyn SocketBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Accepts connections until shutdown is requested. Each connection is
    /// served on its own task; in-flight connections are not awaited.
    pub async fn run(&self, listener: UnixListener) -> Result<()> {
        let ctx = Arc::new(Context {
            config:     self.config.clone(),
            allow_list: self.allow_list.clone(),
            installer:  Arc::clone(&self.installer),
            aliases:    Arc::clone(&self.aliases),
            binder:     Arc::clone(&self.binder),
            shutdown:   self.shutdown.clone(),
        });
        let mut shutdown_rx = self.shutdown.tx.subscribe();

        tracing::info!(
            allow_list = ?self.allow_list,
            "cfdevd accepting connections"
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(connection::serve(stream, ctx));
                    }
                    Err(e) => {
                        tracing::error!("Connection error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        tracing::info!("Shutdown signal received, no longer accepting connections");
        Ok(())
    }
}

/// The daemon's listening socket
pub struct BoundSocket {
    pub listener: UnixListener,
    /// Set when the daemon created the socket file and should remove it on exit
    pub created:  Option<PathBuf>,
}

/// Adopts an activated socket when configured to, otherwise creates the
/// socket at the configured path. Must be called inside a Tokio runtime.
pub fn open_listener(config: &DaemonConfig) -> Result<BoundSocket> {
    use cfdevd_common::platform_socket;

    if config.socket_activation {
        if let Some(listener) = platform_socket::activated_listener()
            .context("Failed to adopt activated socket")?
        {
            tracing::info!("Using socket handed over by the service manager");
            listener.set_nonblocking(true)?;
            return Ok(BoundSocket {
                listener: UnixListener::from_std(listener)?,
                created:  None,
            });
        }
        tracing::debug!("No activated socket, binding {}", config.socket_path.display());
    }

    let listener = platform_socket::bind_listener(&config.socket_path, config.socket_mode)
        .with_context(|| format!("Failed to bind to socket: {}", config.socket_path.display()))?;
    listener.set_nonblocking(true)?;

    tracing::info!("cfdevd listening on: {}", config.socket_path.display());
    Ok(BoundSocket {
        listener: UnixListener::from_std(listener)?,
        created:  Some(config.socket_path.clone()),
    })
}
