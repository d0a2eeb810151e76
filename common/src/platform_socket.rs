use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    time::Duration,
};

/// Adopts a listener created by the host service manager, if there is one.
///
/// On Linux this follows the systemd protocol (`LISTEN_PID`/`LISTEN_FDS`, first
/// descriptor is 3). On macOS it asks launchd for the `Listeners` socket.
pub fn activated_listener() -> io::Result<Option<UnixListener>> {
    #[cfg(target_os = "linux")]
    {
        systemd_listener()
    }

    #[cfg(target_os = "macos")]
    {
        launchd_listener("Listeners")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
fn systemd_listener() -> io::Result<Option<UnixListener>> {
    use std::os::fd::{BorrowedFd, FromRawFd};

    const SD_LISTEN_FDS_START: i32 = 3;

    // LISTEN_* stay in the environment; they name our pid, so children
    // ignore them.
    let count = listen_fds_for(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    );
    if count == 0 {
        return Ok(None);
    }
    if count > 1 {
        tracing::warn!("{} activated sockets passed, using the first one", count);
    }

    // SAFETY: systemd guarantees descriptors LISTEN_FDS_START.. are open when
    // LISTEN_PID names us. The borrow only lives for the type check.
    ensure_unix_stream(unsafe { BorrowedFd::borrow_raw(SD_LISTEN_FDS_START) })?;

    // SAFETY: as above, and nothing else in this process owns descriptor 3.
    let listener = unsafe { UnixListener::from_raw_fd(SD_LISTEN_FDS_START) };
    Ok(Some(listener))
}

/// How many descriptors systemd handed to process `pid`
#[cfg(target_os = "linux")]
fn listen_fds_for(listen_pid: Option<&str>, listen_fds: Option<&str>, pid: u32) -> usize {
    let pid_matches = listen_pid.and_then(|p| p.trim().parse::<u32>().ok()) == Some(pid);
    if !pid_matches {
        return 0;
    }

    listen_fds
        .and_then(|n| n.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Rejects an inherited descriptor that is not a listening-capable Unix
/// stream socket
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn ensure_unix_stream(fd: std::os::fd::BorrowedFd<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{
        getsockname, getsockopt, sockopt, AddressFamily, SockType, SockaddrLike, SockaddrStorage,
    };

    let kind = getsockopt(&fd, sockopt::SockType)?;
    let addr: SockaddrStorage = getsockname(fd.as_raw_fd())?;

    if kind != SockType::Stream || addr.family() != Some(AddressFamily::Unix) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "activated descriptor {} is not a Unix stream socket",
                fd.as_raw_fd()
            ),
        ));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn launchd_listener(name: &str) -> io::Result<Option<UnixListener>> {
    use std::{
        ffi::CString,
        os::fd::{AsFd, FromRawFd},
    };

    extern "C" {
        fn launch_activate_socket(
            name: *const libc::c_char,
            fds: *mut *mut libc::c_int,
            cnt: *mut libc::size_t,
        ) -> libc::c_int;
    }

    let name = CString::new(name)?;
    let mut fds: *mut libc::c_int = std::ptr::null_mut();
    let mut count: libc::size_t = 0;

    // SAFETY: launch_activate_socket writes a malloc'd array of `count`
    // descriptors into `fds` on success; both out-pointers are valid.
    let result = unsafe { launch_activate_socket(name.as_ptr(), &mut fds, &mut count) };

    // ESRCH: not launched by launchd. ENOENT: no such socket in the plist.
    if result == libc::ESRCH || result == libc::ENOENT {
        return Ok(None);
    }
    if result != 0 {
        return Err(io::Error::from_raw_os_error(result));
    }

    // SAFETY: on success `fds` points at `count` descriptors that we now own.
    // The array itself is released with free().
    let listener = unsafe {
        let slice = std::slice::from_raw_parts(fds, count);
        let first = slice.first().copied();
        for &extra in slice.iter().skip(1) {
            libc::close(extra);
        }
        libc::free(fds as *mut libc::c_void);
        first.map(|fd| UnixListener::from_raw_fd(fd))
    };

    if let Some(listener) = &listener {
        ensure_unix_stream(listener.as_fd())?;
    }
    Ok(listener)
}

/// Create the daemon's listening socket at `socket_path`.
///
/// A stale socket file is removed first. The socket gets `mode` permission
/// bits; when running as root via sudo, ownership moves to the invoking user.
pub fn bind_listener(socket_path: &Path, mode: u32) -> io::Result<UnixListener> {
    tracing::info!("Setting up Unix socket server: {}", socket_path.display());

    // Check if socket file already exists
    if socket_path.exists() {
        tracing::warn!("Existing socket file found, removing it...");
        std::fs::remove_file(socket_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Could not remove existing socket file '{}': {}. You may need to stop the \
                     existing daemon or remove the file manually.",
                    socket_path.display(),
                    e
                ),
            )
        })?;
        tracing::info!("Old socket file removed successfully");
    } else {
        tracing::debug!("No existing socket file found");
    }

    // Check parent directory
    if let Some(parent) = socket_path.parent() {
        let metadata = std::fs::metadata(parent).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Cannot access parent directory '{}': {}", parent.display(), e),
            )
        })?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Parent path '{}' exists but is not a directory", parent.display()),
            ));
        }
    }

    tracing::debug!("Binding to socket...");
    let listener = UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());

        let detailed_error = match e.kind() {
            io::ErrorKind::PermissionDenied => {
                format!(
                    "Permission denied creating socket '{}'. The daemon normally runs as root.",
                    socket_path.display()
                )
            }
            io::ErrorKind::AddrInUse => {
                format!(
                    "Socket '{}' is in use. Another daemon instance may be running.",
                    socket_path.display()
                )
            }
            _ => {
                format!(
                    "Unexpected error binding to socket '{}': {}",
                    socket_path.display(),
                    e
                )
            }
        };
        io::Error::new(e.kind(), detailed_error)
    })?;

    // The socket permissions are the trust boundary for every command
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode))?;
    tracing::debug!("Socket permissions set to {:o}", mode);

    chown_to_sudo_user(socket_path);

    tracing::info!("Unix socket server setup complete!");
    Ok(listener)
}

/// When running as root via sudo, hand the socket to the invoking user
fn chown_to_sudo_user(socket_path: &Path) {
    if !nix::unistd::geteuid().is_root() {
        tracing::debug!("Running as regular user, no ownership change needed");
        return;
    }

    let Ok(sudo_user) = std::env::var("SUDO_USER") else {
        tracing::debug!("Running as root but SUDO_USER not set, keeping root ownership");
        return;
    };

    match nix::unistd::User::from_name(&sudo_user) {
        Ok(Some(user)) => {
            match nix::unistd::chown(socket_path, Some(user.uid), Some(user.gid)) {
                Ok(()) => {
                    tracing::info!(
                        "Socket ownership changed to {}:{} ({})",
                        user.uid,
                        user.gid,
                        sudo_user
                    );
                }
                Err(e) => tracing::warn!("Failed to change socket ownership: {}", e),
            }
        }
        Ok(None) => tracing::warn!("User '{}' not found", sudo_user),
        Err(e) => tracing::warn!("Failed to look up user '{}': {}", sudo_user, e),
    }
}

/// Connect to the daemon socket with blocking I/O bounded by `timeout`
pub fn connect_socket(socket_path: &Path, timeout: Duration) -> io::Result<UnixStream> {
    tracing::debug!("Attempting to connect to Unix socket: {}", socket_path.display());

    let stream = UnixStream::connect(socket_path).map_err(|e| {
        tracing::debug!("Connection failed: {} (kind: {:?})", e, e.kind());
        e
    })?;

    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    tracing::debug!("Socket configured for blocking I/O with {:?} timeouts", timeout);
    Ok(stream)
}

/// Whether a connect error means nothing is serving the socket
pub fn is_daemon_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn listen_fds_for_another_process_are_ignored() {
        let me = std::process::id();
        let other = (me + 1).to_string();

        assert_eq!(listen_fds_for(Some(&other), Some("1"), me), 0);
        assert_eq!(listen_fds_for(None, Some("1"), me), 0);
        assert_eq!(listen_fds_for(Some("not-a-pid"), Some("1"), me), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn listen_fds_for_this_process_are_counted() {
        let me = std::process::id();
        let pid = me.to_string();

        assert_eq!(listen_fds_for(Some(&pid), Some("1"), me), 1);
        assert_eq!(listen_fds_for(Some(&pid), Some("2"), me), 2);
        assert_eq!(listen_fds_for(Some(&pid), Some("0"), me), 0);
        assert_eq!(listen_fds_for(Some(&pid), Some("many"), me), 0);
        assert_eq!(listen_fds_for(Some(&pid), None, me), 0);
    }

    #[test]
    fn no_activation_outside_a_service_manager() {
        // The test runner is never started with LISTEN_PID naming it.
        assert!(activated_listener().unwrap().is_none());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn only_unix_stream_sockets_are_adopted() {
        use std::{
            net::{TcpListener, UdpSocket},
            os::{fd::AsFd, unix::net::UnixDatagram},
        };

        let dir = tempfile::tempdir().unwrap();
        let unix = UnixListener::bind(dir.path().join("activated.socket")).unwrap();
        ensure_unix_stream(unix.as_fd()).unwrap();

        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = ensure_unix_stream(tcp.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(ensure_unix_stream(udp.as_fd()).is_err());

        let datagram = UnixDatagram::unbound().unwrap();
        assert!(ensure_unix_stream(datagram.as_fd()).is_err());

        let file = tempfile::tempfile().unwrap();
        assert!(ensure_unix_stream(file.as_fd()).is_err());
    }

    #[test]
    fn bind_replaces_stale_socket_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.socket");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind_listener(&path, 0o600).unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn bind_rejects_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("daemon.socket");

        let err = bind_listener(&path, 0o600).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn connect_to_missing_socket_reports_absent_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_socket(&dir.path().join("none.socket"), Duration::from_secs(1))
            .unwrap_err();
        assert!(is_daemon_absent(&err));
    }

    #[test]
    fn connect_after_listener_closed_reports_absent_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.socket");
        drop(bind_listener(&path, 0o600).unwrap());

        let err = connect_socket(&path, Duration::from_secs(1)).unwrap_err();
        assert!(is_daemon_absent(&err));
    }
}
