//! The host service manager as seen by the daemon.
//!
//! Installing and starting the service is handled elsewhere; the daemon only
//! needs to drop its own registration on Uninstall and to report whether the
//! service manager considers it running.

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use anyhow::{Context as _, Result};

use crate::config::ServiceConfig;

pub trait ServiceInstaller: Send + Sync {
    /// Remove the persistent registration so the daemon is not started again.
    /// Succeeds when the registration is already gone.
    fn uninstall(&self) -> Result<()>;

    /// Whether the service manager reports the daemon as running
    fn is_running(&self) -> Result<bool>;
}

/// Picks the service manager of the host
pub fn platform_installer(service: &ServiceConfig) -> Arc<dyn ServiceInstaller> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(Launchd::new(service.clone()))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(Systemd::new(service.clone()))
    }
}

/// Deletes a registration file, returning whether it existed
fn remove_registration(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("Removed service registration {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("Service registration {} already absent", path.display());
            Ok(false)
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to remove service registration {}", path.display())),
    }
}

/// Runs a service manager command; returns whether it exited successfully
fn run_manager(program: &Path, args: &[&str]) -> Result<bool> {
    tracing::debug!("Running {} {:?}", program.display(), args);
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program.display()))?;

    if !output.status.success() {
        tracing::debug!(
            "{} {:?} exited with {}: {}",
            program.display(),
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.status.success())
}

/// launchd on macOS: the registration is a plist in /Library/LaunchDaemons
#[derive(Debug, Clone)]
pub struct Launchd {
    service:   ServiceConfig,
    launchctl: PathBuf,
}

impl Launchd {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            service,
            launchctl: PathBuf::from("launchctl"),
        }
    }

    /// Use a different `launchctl` executable
    pub fn with_launchctl<P: Into<PathBuf>>(mut self, launchctl: P) -> Self {
        self.launchctl = launchctl.into();
        self
    }
}

impl ServiceInstaller for Launchd {
    fn uninstall(&self) -> Result<()> {
        let target = format!("system/{}", self.service.label);
        match run_manager(&self.launchctl, &["disable", &target]) {
            Ok(true) => tracing::info!("Disabled {}", target),
            Ok(false) => tracing::warn!("launchctl could not disable {}", target),
            Err(e) => tracing::warn!("{:#}", e),
        }
        remove_registration(&self.service.registration_path)?;
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        run_manager(&self.launchctl, &["list", &self.service.label])
    }
}

/// systemd on Linux: the registration is a unit file
#[derive(Debug, Clone)]
pub struct Systemd {
    service:   ServiceConfig,
    systemctl: PathBuf,
}

impl Systemd {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            service,
            systemctl: PathBuf::from("systemctl"),
        }
    }

    /// Use a different `systemctl` executable
    pub fn with_systemctl<P: Into<PathBuf>>(mut self, systemctl: P) -> Self {
        self.systemctl = systemctl.into();
        self
    }

    fn unit(&self) -> String {
        format!("{}.service", self.service.label)
    }
}

impl ServiceInstaller for Systemd {
    fn uninstall(&self) -> Result<()> {
        let unit = self.unit();
        match run_manager(&self.systemctl, &["disable", &unit]) {
            Ok(true) => tracing::info!("Disabled {}", unit),
            Ok(false) => tracing::warn!("systemctl could not disable {}", unit),
            Err(e) => tracing::warn!("{:#}", e),
        }

        if remove_registration(&self.service.registration_path)? {
            if let Err(e) = run_manager(&self.systemctl, &["daemon-reload"]) {
                tracing::warn!("{:#}", e);
            }
        }
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        run_manager(&self.systemctl, &["is-active", "--quiet", &self.unit()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_in(dir: &Path) -> ServiceConfig {
        ServiceConfig {
            label:             "org.example.cfdevd-test".to_string(),
            registration_path: dir.join("cfdevd-test.registration"),
        }
    }

    #[test]
    fn systemd_uninstall_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        std::fs::write(&service.registration_path, "[Unit]\n").unwrap();

        let installer = Systemd::new(service.clone()).with_systemctl("true");
        installer.uninstall().unwrap();
        assert!(!service.registration_path.exists());

        installer.uninstall().unwrap();
    }

    #[test]
    fn launchd_uninstall_survives_missing_launchctl() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        std::fs::write(&service.registration_path, "<plist/>").unwrap();

        let installer = Launchd::new(service.clone()).with_launchctl("/nonexistent/launchctl");
        installer.uninstall().unwrap();
        assert!(!service.registration_path.exists());
    }

    #[test]
    fn running_state_follows_manager_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        assert!(Systemd::new(service.clone()).with_systemctl("true").is_running().unwrap());
        assert!(!Systemd::new(service.clone()).with_systemctl("false").is_running().unwrap());
        assert!(Launchd::new(service).with_launchctl("/nonexistent/launchctl").is_running().is_err());
    }
}
