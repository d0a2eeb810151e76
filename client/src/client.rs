use std::{
    io::{self, Read, Write},
    net::{SocketAddrV4, TcpListener},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::net::UnixStream,
    },
    path::PathBuf,
    time::Duration,
};

use cfdevd_common::{
    config::{self, DEFAULT_TIMEOUT},
    fd_passing,
    platform_socket::{connect_socket, is_daemon_absent},
    protocol::{
        BindRequest, BindStatus, GenericStatus, Handshake, Instruction, ProtocolError,
        BIND_STATUS_LEN, HANDSHAKE_LEN, UNIMPLEMENTED_STATUS,
    },
};

use crate::ClientError;

/// Configuration for a daemon client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the daemon socket
    pub socket_path: PathBuf,
    /// Bound on each read and write of an exchange
    pub timeout:     Duration,
    /// Free-form label sent in our handshake, shows up in daemon logs
    pub tag:         String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: config::socket_path(),
            timeout:     DEFAULT_TIMEOUT,
            tag:         format!("cfdevd-client {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket path
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, socket_path: P) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    /// Set the per-operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the handshake tag
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = tag.into();
        self
    }
}

/// Client for the privileged daemon.
///
/// Every call opens its own connection, performs the handshake, sends one
/// instruction and reads one response. Nothing is kept between calls.
///
/// Teardown calls ([`uninstall`](Self::uninstall) and
/// [`remove_ip_aliases`](Self::remove_ip_aliases)) succeed when no daemon is
/// running, since there is nothing left to tear down. Calls that need the
/// daemon's privileges fail with [`ClientError::DaemonUnavailable`] instead.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    config: ClientConfig,
}

/// One open connection after both handshake frames have been exchanged
struct Session {
    stream: UnixStream,
    daemon: Handshake,
}

impl DaemonClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Creates a client for the default socket location
    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects and exchanges handshakes without sending a command.
    /// Returns the daemon's frame.
    pub fn probe(&self) -> Result<Handshake, ClientError> {
        let session = self.open()?;
        Ok(session.daemon)
    }

    /// Asks the daemon to remove its service registration
    pub fn uninstall(&self) -> Result<(), ClientError> {
        self.teardown(Instruction::Uninstall)
    }

    /// Asks the daemon to remove the loopback aliases for its allow-list
    pub fn remove_ip_aliases(&self) -> Result<(), ClientError> {
        self.teardown(Instruction::RemoveIpAlias)
    }

    /// Asks the daemon to add the loopback aliases for its allow-list
    pub fn add_ip_aliases(&self) -> Result<(), ClientError> {
        self.command(Instruction::AddIpAlias)
    }

    /// Asks the daemon to bind `request` and hand back the listener.
    ///
    /// The returned listener is owned solely by the caller; the daemon closes
    /// its copy once the descriptor is sent.
    pub fn bind(&self, request: BindRequest) -> Result<TcpListener, ClientError> {
        let mut session = self.open()?;

        let mut frame = Vec::with_capacity(1 + request.encode().len());
        frame.push(Instruction::Bind.code());
        frame.extend_from_slice(&request.encode());
        session.stream.write_all(&frame)?;
        tracing::debug!("Sent bind request for {}", request.addr);

        let (status, fd) = read_bind_status(&session.stream)?;
        if !status.is_success() {
            tracing::debug!("Daemon refused bind of {}: {}", request.addr, status);
            return Err(ClientError::from_bind_status(status));
        }

        let fd = fd.ok_or(ClientError::MissingDescriptor)?;
        let listener = TcpListener::from(fd);
        tracing::info!("Received listener for {}", request.addr);
        Ok(listener)
    }

    /// Shorthand for a TCP bind of `addr`
    pub fn bind_tcp(&self, addr: SocketAddrV4) -> Result<TcpListener, ClientError> {
        self.bind(BindRequest::tcp(addr))
    }

    /// Runs a command, treating an absent daemon as success
    fn teardown(&self, instruction: Instruction) -> Result<(), ClientError> {
        match self.command(instruction) {
            Err(e) if e.is_daemon_absent() => {
                tracing::info!("cfdevd not running, nothing to do for {}", instruction);
                Ok(())
            }
            other => other,
        }
    }

    /// Sends a single-byte command and reads its one-byte status
    fn command(&self, instruction: Instruction) -> Result<(), ClientError> {
        let mut session = self.open()?;
        session.stream.write_all(&[instruction.code()])?;

        let mut status = [0u8; 1];
        session
            .stream
            .read_exact(&mut status)
            .map_err(ProtocolError::from_read)?;

        match status[0] {
            UNIMPLEMENTED_STATUS => Err(ClientError::Unimplemented(instruction.code())),
            byte => match GenericStatus::from_byte(byte) {
                Some(GenericStatus::Success) => Ok(()),
                Some(GenericStatus::Failure) => Err(ClientError::CommandFailed(instruction)),
                None => Err(ClientError::UnexpectedStatus(byte)),
            },
        }
    }

    /// Connects and exchanges handshake frames. A missing socket, a refused
    /// connection or a peer that closes before its frame arrives all count as
    /// the daemon being unavailable.
    fn open(&self) -> Result<Session, ClientError> {
        let path = &self.config.socket_path;
        let unavailable = |source: io::Error| ClientError::DaemonUnavailable {
            path: path.clone(),
            source,
        };

        let mut stream = match connect_socket(path, self.config.timeout) {
            Ok(stream) => stream,
            Err(e) if is_daemon_absent(&e) => return Err(unavailable(e)),
            Err(e) => return Err(e.into()),
        };

        let ours = Handshake::new(&self.config.tag);
        if let Err(e) = stream.write_all(&ours.encode()) {
            return Err(match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => unavailable(e),
                _ => e.into(),
            });
        }

        let mut frame = [0u8; HANDSHAKE_LEN];
        if let Err(e) = stream.read_exact(&mut frame) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => unavailable(e),
                _ => e.into(),
            });
        }
        let daemon = Handshake::decode(&frame)?;

        if !daemon.is_compatible() {
            tracing::warn!(
                "Daemon handshake {:?} v{} does not match ours",
                daemon.identifier_lossy(),
                daemon.version
            );
        }

        Ok(Session { stream, daemon })
    }
}

/// Reads the eight status bytes of a Bind answer together with the descriptor
/// attached to them. A daemon that does not know Bind answers with the single
/// unimplemented byte and closes.
fn read_bind_status(stream: &UnixStream) -> Result<(BindStatus, Option<OwnedFd>), ClientError> {
    let mut buf = [0u8; BIND_STATUS_LEN];
    let (filled, received) = fd_passing::recv_until_full_with_fd(stream.as_raw_fd(), &mut buf)?;

    match filled {
        BIND_STATUS_LEN => Ok((BindStatus::from_bytes(buf), received)),
        0 => Err(ProtocolError::ConnectionClosed.into()),
        1 if buf[0] == UNIMPLEMENTED_STATUS => Err(ClientError::Unimplemented(Instruction::Bind.code())),
        actual => Err(ProtocolError::Truncated {
            frame: "bind status",
            expected: BIND_STATUS_LEN,
            actual,
        }
        .into()),
    }
}
