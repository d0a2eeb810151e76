//! Loopback aliases for the allow-listed addresses.
//!
//! Adding makes the virtual director and router reachable as local addresses
//! from the unprivileged side. Both directions are idempotent: the current
//! interface state is checked before every change.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    process::Command,
};

use anyhow::{anyhow, Context as _, Result};

/// Access to the loopback interface's address list
pub trait LoopbackAliases: Send + Sync {
    fn contains(&self, ip: Ipv4Addr) -> Result<bool>;
    fn add(&self, ip: Ipv4Addr) -> Result<()>;
    fn remove(&self, ip: Ipv4Addr) -> Result<()>;
}

/// Ensures every address is aliased, skipping those already present
pub fn add_all<I>(aliases: &dyn LoopbackAliases, addrs: I) -> Result<()>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    for ip in addrs {
        if aliases.contains(ip)? {
            tracing::debug!("Loopback alias {} already present", ip);
            continue;
        }
        aliases
            .add(ip)
            .with_context(|| format!("Failed to add loopback alias {ip}"))?;
        tracing::info!("Added loopback alias {}", ip);
    }
    Ok(())
}

/// Ensures no address is aliased, skipping those already absent
pub fn remove_all<I>(aliases: &dyn LoopbackAliases, addrs: I) -> Result<()>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    for ip in addrs {
        if !aliases.contains(ip)? {
            tracing::debug!("Loopback alias {} already absent", ip);
            continue;
        }
        aliases
            .remove(ip)
            .with_context(|| format!("Failed to remove loopback alias {ip}"))?;
        tracing::info!("Removed loopback alias {}", ip);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
const LOOPBACK_INTERFACE: &str = "lo0";

#[cfg(not(target_os = "macos"))]
const LOOPBACK_INTERFACE: &str = "lo";

/// Reads the interface with `getifaddrs` and changes it with the host's
/// network configuration tool
#[derive(Debug, Clone)]
pub struct SystemAliases {
    interface: String,
}

impl Default for SystemAliases {
    fn default() -> Self {
        Self {
            interface: LOOPBACK_INTERFACE.to_string(),
        }
    }
}

impl SystemAliases {
    pub fn new<S: Into<String>>(interface: S) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        tracing::debug!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {program}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} {:?} exited with {}: {}",
                program,
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

impl LoopbackAliases for SystemAliases {
    fn contains(&self, ip: Ipv4Addr) -> Result<bool> {
        let addrs = nix::ifaddrs::getifaddrs().context("Failed to list interface addresses")?;

        let found = addrs
            .filter(|ifaddr| ifaddr.interface_name == self.interface)
            .filter_map(|ifaddr| ifaddr.address)
            .filter_map(|addr| addr.as_sockaddr_in().copied())
            .any(|sin| *SocketAddrV4::from(sin).ip() == ip);

        Ok(found)
    }

    #[cfg(target_os = "macos")]
    fn add(&self, ip: Ipv4Addr) -> Result<()> {
        self.run("ifconfig", &[&self.interface, "alias", &ip.to_string()])
    }

    #[cfg(not(target_os = "macos"))]
    fn add(&self, ip: Ipv4Addr) -> Result<()> {
        let cidr = format!("{ip}/32");
        self.run("ip", &["addr", "add", &cidr, "dev", &self.interface])
    }

    #[cfg(target_os = "macos")]
    fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        self.run("ifconfig", &[&self.interface, "-alias", &ip.to_string()])
    }

    #[cfg(not(target_os = "macos"))]
    fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        let cidr = format!("{ip}/32");
        self.run("ip", &["addr", "del", &cidr, "dev", &self.interface])
    }
}
