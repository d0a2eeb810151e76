use std::{env, net::Ipv4Addr, path::PathBuf, time::Duration};

/// Well-known location of the daemon socket when it is not socket-activated
pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/cfdevd.socket";

/// Environment override for the socket location, honoured by both sides
pub const SOCKET_PATH_ENV: &str = "CFDEVD_SOCKET_PATH";

/// Default bound for one request/response exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Address of the virtual BOSH director
pub const DIRECTOR_IP: Ipv4Addr = Ipv4Addr::new(10, 144, 0, 2);

/// Address of the virtual router
pub const ROUTER_IP: Ipv4Addr = Ipv4Addr::new(10, 144, 0, 34);

/// The addresses the daemon is allowed to bind and alias
pub const PRIVILEGED_ADDRESSES: [Ipv4Addr; 2] = [DIRECTOR_IP, ROUTER_IP];

/// Resolves the socket path, preferring the environment override
pub fn socket_path() -> PathBuf {
    env::var_os(SOCKET_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_addresses_are_director_and_router() {
        assert_eq!(PRIVILEGED_ADDRESSES, [DIRECTOR_IP, ROUTER_IP]);
        assert!(PRIVILEGED_ADDRESSES.iter().all(|ip| ip.is_private()));
    }
}
