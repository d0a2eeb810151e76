//! cfdevd Common Library
//!
//! This crate provides the pieces shared by the privileged `cfdevd` daemon and
//! its unprivileged clients:
//!
//! - The binary wire protocol: handshake frame, instruction byte, Bind payload
//!   and the status codes each command answers with
//! - Unix domain socket setup for the daemon and connection helpers for clients
//! - Descriptor passing (`SCM_RIGHTS`) used to hand a bound listener across the
//!   process boundary
//!
//! # Trust boundary
//!
//! The protocol carries no authentication. Whoever can open the daemon socket
//! may issue commands, so the socket's filesystem ownership and permission bits
//! are the actual security control. The daemon itself only ever acts on a fixed
//! set of addresses.

/// Well-known paths, addresses and timeouts
pub mod config;

/// Descriptor passing over Unix domain sockets
pub mod fd_passing;

/// Unix domain socket setup and connection helpers
#[cfg(unix)]
pub mod platform_socket;

/// Wire protocol frames and status codes
pub mod protocol;

// Re-export commonly used types for convenience
pub use config::{DEFAULT_SOCKET_PATH, PRIVILEGED_ADDRESSES};
pub use protocol::{
    BindRequest, BindStatus, GenericStatus, Handshake, Instruction, ProtocolError,
    UNIMPLEMENTED_STATUS,
};
