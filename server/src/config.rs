use std::{env, path::PathBuf, time::Duration};

use cfdevd_common::config::{self as common, DEFAULT_TIMEOUT, SOCKET_PATH_ENV};

const SOCKET_MODE_ENV: &str = "CFDEVD_SOCKET_MODE";
const SOCKET_ACTIVATION_ENV: &str = "CFDEVD_SOCKET_ACTIVATION";
const CONNECTION_TIMEOUT_ENV: &str = "CFDEVD_CONNECTION_TIMEOUT_SECS";
const SERVICE_LABEL_ENV: &str = "CFDEVD_SERVICE_LABEL";
const REGISTRATION_PATH_ENV: &str = "CFDEVD_REGISTRATION_PATH";

/// Service-manager label of the daemon
pub const DEFAULT_SERVICE_LABEL: &str = "org.cloudfoundry.cfdevd";

/// Clients run unprivileged, so the socket is world-connectable by default
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

#[cfg(target_os = "macos")]
fn default_registration_path(label: &str) -> PathBuf {
    PathBuf::from(format!("/Library/LaunchDaemons/{label}.plist"))
}

#[cfg(not(target_os = "macos"))]
fn default_registration_path(label: &str) -> PathBuf {
    PathBuf::from(format!("/etc/systemd/system/{label}.service"))
}

/// How the host service manager knows the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// launchd label, or systemd unit name without the `.service` suffix
    pub label:             String,
    /// File whose presence makes the service manager (re)start the daemon
    pub registration_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            label:             DEFAULT_SERVICE_LABEL.to_string(),
            registration_path: default_registration_path(DEFAULT_SERVICE_LABEL),
        }
    }
}

/// Runtime configuration of the daemon.
///
/// The set of addresses the daemon acts on is deliberately not part of this
/// structure; see [`crate::AllowList`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Socket path used when no activated socket is handed to us
    pub socket_path:        PathBuf,
    /// Permission bits for a socket the daemon creates itself
    pub socket_mode:        u32,
    /// Try service-manager socket activation before binding `socket_path`
    pub socket_activation:  bool,
    /// Bound for one handshake + command exchange
    pub connection_timeout: Duration,
    /// Stop accepting connections once Uninstall has been answered
    pub exit_on_uninstall:  bool,
    /// Build tag sent in the handshake frame
    pub tag:                String,
    pub service:            ServiceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path:        PathBuf::from(common::DEFAULT_SOCKET_PATH),
            socket_mode:        DEFAULT_SOCKET_MODE,
            socket_activation:  true,
            connection_timeout: DEFAULT_TIMEOUT,
            exit_on_uninstall:  true,
            tag:                format!("cfdevd {}", env!("CARGO_PKG_VERSION")),
            service:            ServiceConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Creates a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables
    ///
    /// Reads CFDEVD_SOCKET_PATH, CFDEVD_SOCKET_MODE, CFDEVD_SOCKET_ACTIVATION,
    /// CFDEVD_CONNECTION_TIMEOUT_SECS, CFDEVD_SERVICE_LABEL and
    /// CFDEVD_REGISTRATION_PATH. Unparseable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(path) = lookup(SOCKET_PATH_ENV) {
            config.socket_path = PathBuf::from(path);
        }

        if let Some(mode) = lookup(SOCKET_MODE_ENV) {
            match u32::from_str_radix(mode.trim_start_matches("0o"), 8) {
                Ok(mode) if mode <= 0o777 => config.socket_mode = mode,
                _ => tracing::warn!("Ignoring invalid {}={:?}", SOCKET_MODE_ENV, mode),
            }
        }

        if let Some(activation) = lookup(SOCKET_ACTIVATION_ENV) {
            config.socket_activation = activation.to_lowercase() == "true";
        }

        if let Some(secs) = lookup(CONNECTION_TIMEOUT_ENV) {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.connection_timeout = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid {}={:?}", CONNECTION_TIMEOUT_ENV, secs),
            }
        }

        if let Some(label) = lookup(SERVICE_LABEL_ENV) {
            config.service.registration_path = default_registration_path(&label);
            config.service.label = label;
        }

        if let Some(path) = lookup(REGISTRATION_PATH_ENV) {
            config.service.registration_path = PathBuf::from(path);
        }

        config
    }

    /// Set the socket path
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, socket_path: P) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    /// Set the permission bits of a daemon-created socket
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    /// Enable or disable socket activation
    pub fn with_socket_activation(mut self, enabled: bool) -> Self {
        self.socket_activation = enabled;
        self
    }

    /// Set the per-connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Choose whether a successful Uninstall stops the daemon
    pub fn with_exit_on_uninstall(mut self, exit: bool) -> Self {
        self.exit_on_uninstall = exit;
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }
}
