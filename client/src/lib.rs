//! cfdevd Client Library
//!
//! The unprivileged half of the cfdevd pair. A [`DaemonClient`] opens one
//! connection per call to the daemon socket, exchanges handshakes, sends a
//! single instruction and decodes the answer.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddrV4;
//!
//! use cfdevd_client::{ClientConfig, DaemonClient};
//!
//! # fn main() -> Result<(), cfdevd_client::ClientError> {
//! let client = DaemonClient::new(ClientConfig::new());
//!
//! client.add_ip_aliases()?;
//! let listener = client.bind_tcp(SocketAddrV4::new([10, 144, 0, 2].into(), 443))?;
//! println!("listening on {}", listener.local_addr()?);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;

pub use client::*;
pub use error::ClientError;
// Re-export the request types callers need
pub use cfdevd_common::{BindRequest, BindStatus, Handshake, Instruction};
