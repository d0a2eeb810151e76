//! Descriptor passing over Unix domain sockets.
//!
//! A descriptor travels as `SCM_RIGHTS` ancillary data attached to a regular
//! payload, so the receiver gets both the status bytes and the descriptor from
//! the same `recvmsg` call.

use std::io;
#[cfg(unix)]
use std::io::{IoSlice, IoSliceMut};
#[cfg(unix)]
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[cfg(unix)]
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Whether this platform can hand descriptors across a local socket
pub const fn is_supported() -> bool {
    cfg!(unix)
}

/// Sends `payload`, attaching `fd` as ancillary data when given.
///
/// Returns the number of payload bytes written. The descriptor is duplicated
/// into the peer by the kernel; the caller still owns its copy.
#[cfg(unix)]
pub fn send_with_fd(socket: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let iov = [IoSlice::new(payload)];

    let sent = match fd {
        Some(fd) => {
            let fds = [fd];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(socket, &iov, &cmsg, MsgFlags::empty(), None)?
        }
        None => sendmsg::<()>(socket, &iov, &[], MsgFlags::empty(), None)?,
    };

    Ok(sent)
}

/// Received descriptors are close-on-exec. Where the kernel can set the flag
/// atomically it is requested with the receive itself.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android", target_os = "freebsd"))
))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn mark_cloexec(_fd: &OwnedFd) -> io::Result<()> {
    Ok(())
}

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android", target_os = "freebsd"))
))]
fn mark_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Receives into `buf`, collecting at most one descriptor from the ancillary
/// data. Extra descriptors are closed. The descriptor returned is
/// close-on-exec, so child processes of the receiver never inherit it.
#[cfg(unix)]
pub fn recv_with_fd(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_buf), RECV_FLAGS)?;

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // SAFETY: the kernel just installed this descriptor in our table
                // and nothing else refers to it.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                if received.is_none() {
                    received = Some(owned);
                } else {
                    tracing::warn!("Dropping unexpected extra descriptor {}", fd);
                }
            }
        }
    }

    if let Some(fd) = &received {
        mark_cloexec(fd)?;
    }

    Ok((msg.bytes, received))
}

/// Fills `buf`, stopping early only when the peer closes. Returns how many
/// bytes arrived and the descriptor attached to any of the chunks; callers
/// decide what a short read means.
#[cfg(unix)]
pub fn recv_until_full_with_fd(
    socket: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut filled = 0;
    let mut received = None;

    while filled < buf.len() {
        let (n, fd) = match recv_with_fd(socket, &mut buf[filled..]) {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if received.is_none() {
            received = fd;
        }
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok((filled, received))
}

#[cfg(not(unix))]
pub fn send_with_fd(_socket: i32, _payload: &[u8], _fd: Option<i32>) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "descriptor passing is not available on this platform",
    ))
}
