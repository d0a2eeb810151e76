//! The privileged bind executor.
//!
//! A Bind request is decoded, checked against the allow-list, bound by the
//! daemon and then handed to the client as an `SCM_RIGHTS` descriptor. The
//! daemon drops its copy right after the transfer.

use std::{
    io,
    net::{SocketAddrV4, TcpListener},
    os::fd::{AsRawFd, OwnedFd},
};

use cfdevd_common::{
    fd_passing,
    protocol::{BindRequest, BindStatus, ProtocolError, BIND_REQUEST_LEN},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, Interest},
    net::UnixStream,
};

use crate::{AllowList, Context};

/// Performs the OS-level bind + listen
pub trait SocketBinder: Send + Sync {
    fn bind_tcp(&self, addr: SocketAddrV4) -> io::Result<TcpListener>;
}

/// Binds through the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsBinder;

impl SocketBinder for OsBinder {
    fn bind_tcp(&self, addr: SocketAddrV4) -> io::Result<TcpListener> {
        TcpListener::bind(addr)
    }
}

/// What the executor decided for one request
#[derive(Debug)]
pub enum BindOutcome {
    /// A live listener to hand to the client
    Bound(TcpListener),
    /// No descriptor; only the status is answered
    Refused(BindStatus),
}

impl BindOutcome {
    pub fn status(&self) -> BindStatus {
        match self {
            BindOutcome::Bound(_) => BindStatus::Success,
            BindOutcome::Refused(status) => *status,
        }
    }
}

/// Decides and performs a bind. The OS is only touched for TCP requests whose
/// address is on the allow-list.
pub fn execute(request: &BindRequest, allow_list: &AllowList, binder: &dyn SocketBinder) -> BindOutcome {
    if request.udp {
        tracing::warn!("Refusing UDP bind request for {}", request.addr);
        return BindOutcome::Refused(BindStatus::Unsupported);
    }

    if !allow_list.contains(*request.addr.ip()) {
        tracing::warn!("Denied bind request for non allow-listed address {}", request.addr);
        return BindOutcome::Refused(BindStatus::Denied);
    }

    if !fd_passing::is_supported() {
        tracing::warn!("Descriptor passing unavailable, cannot serve bind for {}", request.addr);
        return BindOutcome::Refused(BindStatus::Unsupported);
    }

    match binder.bind_tcp(request.addr) {
        Ok(listener) => {
            tracing::info!("Bound {} for client", request.addr);
            BindOutcome::Bound(listener)
        }
        Err(e) => {
            let status = BindStatus::from_io_error(&e);
            tracing::warn!("Bind to {} failed: {} ({})", request.addr, e, status);
            BindOutcome::Refused(status)
        }
    }
}

/// Reads the Bind payload, executes it and answers on the same connection
pub(crate) async fn handle(stream: &mut UnixStream, ctx: &Context) -> Result<(), ProtocolError> {
    let mut payload = [0u8; BIND_REQUEST_LEN];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(ProtocolError::from_read)?;
    let request = BindRequest::decode(&payload)?;
    tracing::debug!("Bind request: {:?}", request);

    let outcome = execute(&request, &ctx.allow_list, ctx.binder.as_ref());
    respond(stream, outcome).await?;
    Ok(())
}

/// Writes the 8-byte status, attaching the listener descriptor on success
pub(crate) async fn respond(stream: &mut UnixStream, outcome: BindOutcome) -> io::Result<()> {
    let listener = match outcome {
        BindOutcome::Bound(listener) => OwnedFd::from(listener),
        BindOutcome::Refused(status) => {
            stream.write_all(&status.to_bytes()).await?;
            return stream.flush().await;
        }
    };

    let status = BindStatus::Success.to_bytes();
    let socket = stream.as_raw_fd();
    let sent = stream
        .async_io(Interest::WRITABLE, || {
            fd_passing::send_with_fd(socket, &status, Some(listener.as_raw_fd()))
        })
        .await?;

    // The descriptor went out with the first byte; the rest is plain data
    if sent < status.len() {
        stream.write_all(&status[sent..]).await?;
    }
    stream.flush().await?;

    drop(listener);
    tracing::debug!("Listener descriptor transferred, local copy closed");
    Ok(())
}
