use std::{io, path::PathBuf};

use cfdevd_common::protocol::{BindStatus, Instruction, ProtocolError};
use thiserror::Error;

/// Everything a daemon request can end in, one variant per outcome a caller
/// may want to branch on
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cfdevd is not running at {path}: {source}")]
    DaemonUnavailable {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("address is not on the daemon's allow-list")]
    Denied,

    #[error("bind request not supported by the daemon")]
    Unsupported,

    #[error("address already in use")]
    AddressInUse,

    #[error("address not available")]
    AddressNotAvailable,

    #[error("daemon failed to bind the address")]
    BindFailed,

    #[error("daemon reported failure for {0}")]
    CommandFailed(Instruction),

    #[error("daemon does not implement instruction {0}")]
    Unimplemented(u8),

    #[error("daemon answered with unexpected status byte {0}")]
    UnexpectedStatus(u8),

    #[error("bind succeeded but no descriptor was attached")]
    MissingDescriptor,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Maps a non-success Bind status
    pub(crate) fn from_bind_status(status: BindStatus) -> Self {
        match status {
            BindStatus::Denied => ClientError::Denied,
            BindStatus::Unsupported => ClientError::Unsupported,
            BindStatus::AddressInUse => ClientError::AddressInUse,
            BindStatus::AddressNotAvailable => ClientError::AddressNotAvailable,
            BindStatus::Success | BindStatus::Unknown => ClientError::BindFailed,
        }
    }

    /// Whether the daemon was missing or went away before answering
    pub fn is_daemon_absent(&self) -> bool {
        matches!(
            self,
            ClientError::DaemonUnavailable { .. }
                | ClientError::Protocol(ProtocolError::ConnectionClosed)
        )
    }
}
