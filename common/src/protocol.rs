//! Wire protocol between `cfdevd` and its clients.
//!
//! One connection carries exactly one exchange:
//!
//! ```text
//! both peers  -> 49-byte handshake frame
//! client      -> 1-byte instruction [+ 7-byte Bind payload]
//! daemon      -> 1-byte status, or 8-byte Bind status [+ SCM_RIGHTS descriptor]
//! ```
//!
//! All multi-byte integers are little-endian except the IPv4 address in the
//! Bind payload, which travels in network order.

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddrV4},
};

use thiserror::Error;

/// Identifier written at the start of every handshake frame
pub const HANDSHAKE_IDENTIFIER: [u8; 5] = *b"CFDEV";

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Total handshake frame length
pub const HANDSHAKE_LEN: usize = 49;

const IDENTIFIER_LEN: usize = HANDSHAKE_IDENTIFIER.len();
const VERSION_LEN: usize = 4;

/// Length of the opaque build-tag field trailing the handshake
pub const HANDSHAKE_TAG_LEN: usize = HANDSHAKE_LEN - IDENTIFIER_LEN - VERSION_LEN;

/// Length of the Bind request payload following the instruction byte
pub const BIND_REQUEST_LEN: usize = 7;

/// Length of the Bind status message
pub const BIND_STATUS_LEN: usize = 8;

/// Status byte answered to an instruction the daemon does not know
pub const UNIMPLEMENTED_STATUS: u8 = 33;

/// Errors raised while reading or decoding protocol frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated {frame}: expected {expected} bytes, got {actual}")]
    Truncated {
        frame:    &'static str,
        expected: usize,
        actual:   usize,
    },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Maps an I/O error from a fixed-size read, turning EOF into
    /// [`ProtocolError::ConnectionClosed`]
    pub fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(err)
        }
    }
}

fn check_len(frame: &'static str, bytes: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            frame,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// The fixed-size frame both peers send right after connecting.
///
/// Only used for diagnostics. It carries no authorization value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identifier: [u8; IDENTIFIER_LEN],
    pub version:    u32,
    pub tag:        [u8; HANDSHAKE_TAG_LEN],
}

impl Handshake {
    /// Builds a frame for this protocol version with the given build tag.
    /// Tags longer than the reserved field are truncated.
    pub fn new(tag: &str) -> Self {
        let mut field = [0u8; HANDSHAKE_TAG_LEN];
        let len = tag.len().min(HANDSHAKE_TAG_LEN);
        field[..len].copy_from_slice(&tag.as_bytes()[..len]);

        Self {
            identifier: HANDSHAKE_IDENTIFIER,
            version:    PROTOCOL_VERSION,
            tag:        field,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut frame = [0u8; HANDSHAKE_LEN];
        frame[..IDENTIFIER_LEN].copy_from_slice(&self.identifier);
        frame[IDENTIFIER_LEN..IDENTIFIER_LEN + VERSION_LEN]
            .copy_from_slice(&self.version.to_le_bytes());
        frame[IDENTIFIER_LEN + VERSION_LEN..].copy_from_slice(&self.tag);
        frame
    }

    /// Decodes a frame. The identifier and version are not validated here;
    /// see [`Handshake::is_compatible`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len("handshake", bytes, HANDSHAKE_LEN)?;

        let mut identifier = [0u8; IDENTIFIER_LEN];
        identifier.copy_from_slice(&bytes[..IDENTIFIER_LEN]);

        let mut version = [0u8; VERSION_LEN];
        version.copy_from_slice(&bytes[IDENTIFIER_LEN..IDENTIFIER_LEN + VERSION_LEN]);

        let mut tag = [0u8; HANDSHAKE_TAG_LEN];
        tag.copy_from_slice(&bytes[IDENTIFIER_LEN + VERSION_LEN..HANDSHAKE_LEN]);

        Ok(Self {
            identifier,
            version: u32::from_le_bytes(version),
            tag,
        })
    }

    /// Whether the peer speaks the same protocol as us
    pub fn is_compatible(&self) -> bool {
        self.identifier == HANDSHAKE_IDENTIFIER && self.version == PROTOCOL_VERSION
    }

    /// Identifier rendered for log output
    pub fn identifier_lossy(&self) -> String {
        String::from_utf8_lossy(&self.identifier).into_owned()
    }

    /// Build tag rendered for log output, without the zero padding
    pub fn tag_lossy(&self) -> String {
        let end = self
            .tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.tag.len());
        String::from_utf8_lossy(&self.tag[..end]).into_owned()
    }
}

/// The single instruction byte a client sends after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Uninstall,
    RemoveIpAlias,
    AddIpAlias,
    Bind,
    Unknown(u8),
}

impl Instruction {
    pub fn code(self) -> u8 {
        match self {
            Instruction::Uninstall => 1,
            Instruction::RemoveIpAlias => 2,
            Instruction::AddIpAlias => 3,
            Instruction::Bind => 6,
            Instruction::Unknown(code) => code,
        }
    }
}

impl From<u8> for Instruction {
    fn from(code: u8) -> Self {
        match code {
            1 => Instruction::Uninstall,
            2 => Instruction::RemoveIpAlias,
            3 => Instruction::AddIpAlias,
            6 => Instruction::Bind,
            other => Instruction::Unknown(other),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Uninstall => write!(f, "uninstall"),
            Instruction::RemoveIpAlias => write!(f, "remove-ip-alias"),
            Instruction::AddIpAlias => write!(f, "add-ip-alias"),
            Instruction::Bind => write!(f, "bind"),
            Instruction::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Payload of a Bind instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    pub addr: SocketAddrV4,
    pub udp:  bool,
}

impl BindRequest {
    /// A TCP bind request for `addr`
    pub fn tcp(addr: SocketAddrV4) -> Self {
        Self { addr, udp: false }
    }

    pub fn encode(&self) -> [u8; BIND_REQUEST_LEN] {
        let mut payload = [0u8; BIND_REQUEST_LEN];
        payload[..4].copy_from_slice(&self.addr.ip().octets());
        payload[4..6].copy_from_slice(&self.addr.port().to_le_bytes());
        payload[6] = u8::from(self.udp);
        payload
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len("bind request", bytes, BIND_REQUEST_LEN)?;

        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_le_bytes([bytes[4], bytes[5]]);

        Ok(Self {
            addr: SocketAddrV4::new(ip, port),
            udp:  bytes[6] != 0,
        })
    }
}

/// Outcome of a Bind instruction, sent as an 8-byte little-endian code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStatus {
    Success,
    /// The address is not on the daemon's allow-list
    Denied,
    /// UDP was requested, or this platform cannot pass descriptors
    Unsupported,
    AddressInUse,
    AddressNotAvailable,
    Unknown,
}

impl BindStatus {
    pub fn code(self) -> u64 {
        match self {
            BindStatus::Success => 0,
            BindStatus::Denied => 1,
            BindStatus::Unsupported => 2,
            BindStatus::AddressInUse => 3,
            BindStatus::AddressNotAvailable => 4,
            BindStatus::Unknown => 5,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            0 => BindStatus::Success,
            1 => BindStatus::Denied,
            2 => BindStatus::Unsupported,
            3 => BindStatus::AddressInUse,
            4 => BindStatus::AddressNotAvailable,
            _ => BindStatus::Unknown,
        }
    }

    /// Classifies an error returned by bind/listen
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindStatus::AddressInUse,
            io::ErrorKind::AddrNotAvailable => BindStatus::AddressNotAvailable,
            _ => BindStatus::Unknown,
        }
    }

    pub fn to_bytes(self) -> [u8; BIND_STATUS_LEN] {
        self.code().to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; BIND_STATUS_LEN]) -> Self {
        Self::from_code(u64::from_le_bytes(bytes))
    }

    pub fn is_success(self) -> bool {
        self == BindStatus::Success
    }
}

impl fmt::Display for BindStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BindStatus::Success => "success",
            BindStatus::Denied => "denied",
            BindStatus::Unsupported => "unsupported",
            BindStatus::AddressInUse => "address in use",
            BindStatus::AddressNotAvailable => "address not available",
            BindStatus::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

/// One-byte status answered by Uninstall, AddIPAlias and RemoveIPAlias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericStatus {
    Success,
    Failure,
}

impl GenericStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            GenericStatus::Success => 0,
            GenericStatus::Failure => 1,
        }
    }

    /// Returns `None` for bytes that are not a generic status, such as
    /// [`UNIMPLEMENTED_STATUS`]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(GenericStatus::Success),
            1 => Some(GenericStatus::Failure),
            _ => None,
        }
    }
}

impl From<bool> for GenericStatus {
    fn from(ok: bool) -> Self {
        if ok {
            GenericStatus::Success
        } else {
            GenericStatus::Failure
        }
    }
}
