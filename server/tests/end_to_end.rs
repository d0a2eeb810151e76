//! Runs the daemon on a temporary socket and drives it with the real client.

use std::{
    collections::BTreeSet,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream},
    os::{fd::AsRawFd, unix::net::UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Result};
use cfdevd_client::{ClientConfig, ClientError, DaemonClient};
use cfdevd_common::protocol::{Handshake, HANDSHAKE_LEN, UNIMPLEMENTED_STATUS};
use cfdevd_server::{
    open_listener, AllowList, Daemon, DaemonConfig, LoopbackAliases, OsBinder, ServiceInstaller,
    SocketBinder,
};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::task::JoinHandle;

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

#[derive(Default)]
struct FakeInstaller {
    uninstalls: AtomicUsize,
}

impl ServiceInstaller for FakeInstaller {
    fn uninstall(&self) -> Result<()> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct FakeAliases {
    present: Mutex<BTreeSet<Ipv4Addr>>,
    changes: AtomicUsize,
    broken:  AtomicBool,
}

impl FakeAliases {
    fn present(&self) -> Vec<Ipv4Addr> {
        self.present.lock().unwrap().iter().copied().collect()
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("interface is gone");
        }
        self.changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl LoopbackAliases for FakeAliases {
    fn contains(&self, ip: Ipv4Addr) -> Result<bool> {
        Ok(self.present.lock().unwrap().contains(&ip))
    }

    fn add(&self, ip: Ipv4Addr) -> Result<()> {
        self.check()?;
        self.present.lock().unwrap().insert(ip);
        Ok(())
    }

    fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        self.check()?;
        self.present.lock().unwrap().remove(&ip);
        Ok(())
    }
}

/// Binds through the OS while counting how often it was asked to
#[derive(Default)]
struct CountingBinder {
    calls: AtomicUsize,
}

impl SocketBinder for CountingBinder {
    fn bind_tcp(&self, addr: SocketAddrV4) -> io::Result<TcpListener> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OsBinder.bind_tcp(addr)
    }
}

struct Harness {
    _dir:      tempfile::TempDir,
    socket:    PathBuf,
    installer: Arc<FakeInstaller>,
    aliases:   Arc<FakeAliases>,
    binder:    Arc<CountingBinder>,
    daemon:    Arc<Daemon>,
    task:      JoinHandle<Result<()>>,
}

impl Harness {
    fn start(allow_list: Option<AllowList>, exit_on_uninstall: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cfdevd.socket");
        let config = DaemonConfig::new()
            .with_socket_path(&socket)
            .with_socket_mode(0o600)
            .with_socket_activation(false)
            .with_connection_timeout(Duration::from_millis(500))
            .with_exit_on_uninstall(exit_on_uninstall);
        let bound = open_listener(&config).unwrap();

        let installer = Arc::new(FakeInstaller::default());
        let aliases = Arc::new(FakeAliases::default());
        let binder = Arc::new(CountingBinder::default());

        let mut daemon = Daemon::new(config, installer.clone(), aliases.clone())
            .with_binder(binder.clone());
        if let Some(allow_list) = allow_list {
            daemon = daemon.with_allow_list(allow_list);
        }
        let daemon = Arc::new(daemon);

        let runner = Arc::clone(&daemon);
        let task = tokio::spawn(async move { runner.run(bound.listener).await });

        Self {
            _dir: dir,
            socket,
            installer,
            aliases,
            binder,
            daemon,
            task,
        }
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::new(
            ClientConfig::new()
                .with_socket_path(&self.socket)
                .with_timeout(Duration::from_secs(5))
                .with_tag("end-to-end"),
        )
    }

    async fn call<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(DaemonClient) -> T + Send + 'static,
    {
        let client = self.client();
        tokio::task::spawn_blocking(move || f(client)).await.unwrap()
    }

    async fn stop(self) {
        self.daemon.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("daemon stops")
            .unwrap()
            .unwrap();
    }
}

fn free_port() -> u16 {
    TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Raw connection that has already exchanged handshakes
fn raw_session(socket: &Path) -> UnixStream {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut frame = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut frame).unwrap();
    assert!(Handshake::decode(&frame).unwrap().is_compatible());
    stream.write_all(&Handshake::new("raw").encode()).unwrap();
    stream
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_hands_over_a_working_listener() {
    let harness = Harness::start(Some(AllowList::new([LOCALHOST])), false);

    let exchanged = harness
        .call(|client| {
            let listener = client.bind_tcp(SocketAddrV4::new(LOCALHOST, 0))?;
            let addr = listener.local_addr()?;

            let flags = fcntl(listener.as_raw_fd(), FcntlArg::F_GETFD)?;
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));

            let server = thread::spawn(move || -> io::Result<Vec<u8>> {
                let (mut conn, _) = listener.accept()?;
                let mut buf = [0u8; 4];
                conn.read_exact(&mut buf)?;
                conn.write_all(b"pong")?;
                Ok(buf.to_vec())
            });

            let mut conn = TcpStream::connect(addr)?;
            conn.write_all(b"ping")?;
            let mut reply = [0u8; 4];
            conn.read_exact(&mut reply)?;
            assert_eq!(&reply, b"pong");

            let received = server.join().expect("accept thread")?;
            Ok::<_, anyhow::Error>(received)
        })
        .await
        .unwrap();

    assert_eq!(exchanged, b"ping");
    assert_eq!(harness.binder.calls.load(Ordering::SeqCst), 1);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_outside_allow_list_is_denied_without_binding() {
    let harness = Harness::start(None, false);
    let port = free_port();

    let err = harness
        .call(move |client| client.bind_tcp(SocketAddrV4::new(LOCALHOST, port)))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Denied), "got {err:?}");
    assert_eq!(harness.binder.calls.load(Ordering::SeqCst), 0);
    assert!(TcpStream::connect((LOCALHOST, port)).is_err());
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_bind_is_unsupported() {
    let harness = Harness::start(Some(AllowList::new([LOCALHOST])), false);

    let err = harness
        .call(|client| {
            client.bind(cfdevd_client::BindRequest {
                addr: SocketAddrV4::new(LOCALHOST, 0),
                udp:  true,
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Unsupported), "got {err:?}");
    assert_eq!(harness.binder.calls.load(Ordering::SeqCst), 0);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_of_busy_port_reports_address_in_use() {
    let harness = Harness::start(Some(AllowList::new([LOCALHOST])), false);
    let taken = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = harness
        .call(move |client| client.bind_tcp(SocketAddrV4::new(LOCALHOST, port)))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::AddressInUse), "got {err:?}");
    drop(taken);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_instructions_are_answered_without_side_effects() {
    // Uninstall would stop this daemon and Bind could reach the binder, so
    // any misrouted code shows up below.
    let harness = Harness::start(Some(AllowList::new([LOCALHOST])), true);

    for code in [0u8, 4, 5, 7, 33, 255] {
        let socket = harness.socket.clone();
        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = raw_session(&socket);
            stream.write_all(&[code]).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        })
        .await
        .unwrap();

        assert_eq!(reply, vec![UNIMPLEMENTED_STATUS], "code {code}");
    }

    assert_eq!(harness.installer.uninstalls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.aliases.changes.load(Ordering::SeqCst), 0);
    assert!(harness.aliases.present().is_empty());
    assert_eq!(harness.binder.calls.load(Ordering::SeqCst), 0);
    assert!(!harness.task.is_finished());
    assert!(!harness.daemon.shutdown_handle().is_triggered());

    harness.call(|client| client.probe()).await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_handshake_does_not_affect_later_clients() {
    let harness = Harness::start(None, false);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut stream = UnixStream::connect(&socket).unwrap();
        stream.write_all(b"CFDEV\x01").unwrap();
    })
    .await
    .unwrap();

    let daemon = harness.call(|client| client.probe()).await.unwrap();
    assert!(daemon.is_compatible());
    harness.call(|client| client.add_ip_aliases()).await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_client_does_not_block_others() {
    let harness = Harness::start(None, false);
    let idle = UnixStream::connect(&harness.socket).unwrap();

    harness.call(|client| client.probe()).await.unwrap();
    harness.call(|client| client.remove_ip_aliases()).await.unwrap();

    drop(idle);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_aliases_twice_creates_no_duplicates() {
    let harness = Harness::start(None, false);

    harness.call(|client| client.add_ip_aliases()).await.unwrap();
    harness.call(|client| client.add_ip_aliases()).await.unwrap();

    assert_eq!(
        harness.aliases.present(),
        vec![Ipv4Addr::new(10, 144, 0, 2), Ipv4Addr::new(10, 144, 0, 34)]
    );
    assert_eq!(harness.aliases.changes.load(Ordering::SeqCst), 2);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_absent_aliases_succeeds() {
    let harness = Harness::start(None, false);

    harness.call(|client| client.remove_ip_aliases()).await.unwrap();
    assert_eq!(harness.aliases.changes.load(Ordering::SeqCst), 0);

    harness.call(|client| client.add_ip_aliases()).await.unwrap();
    harness.call(|client| client.remove_ip_aliases()).await.unwrap();
    assert!(harness.aliases.present().is_empty());
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn alias_failure_is_reported_to_client() {
    let harness = Harness::start(None, false);
    harness.aliases.broken.store(true, Ordering::SeqCst);

    let err = harness
        .call(|client| client.add_ip_aliases())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::CommandFailed(_)), "got {err:?}");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uninstall_twice_keeps_serving_when_configured() {
    let harness = Harness::start(None, false);

    harness.call(|client| client.uninstall()).await.unwrap();
    harness.call(|client| client.uninstall()).await.unwrap();

    assert_eq!(harness.installer.uninstalls.load(Ordering::SeqCst), 2);
    assert!(!harness.task.is_finished());
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uninstall_stops_daemon_and_repeat_still_succeeds() {
    let harness = Harness::start(None, true);

    harness.call(|client| client.uninstall()).await.unwrap();

    let Harness { task, installer, socket, _dir, .. } = harness;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("daemon exits after uninstall")
        .unwrap()
        .unwrap();
    assert_eq!(installer.uninstalls.load(Ordering::SeqCst), 1);

    let client = DaemonClient::new(ClientConfig::new().with_socket_path(&socket));
    let (second, add) = tokio::task::spawn_blocking(move || {
        (client.uninstall(), client.add_ip_aliases())
    })
    .await
    .unwrap();

    second.unwrap();
    assert!(matches!(add, Err(ClientError::DaemonUnavailable { .. })));
    assert_eq!(installer.uninstalls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_binds_are_served_independently() {
    let harness = Harness::start(Some(AllowList::new([LOCALHOST])), false);

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let client = harness.client();
            tokio::task::spawn_blocking(move || client.bind_tcp(SocketAddrV4::new(LOCALHOST, 0)))
        })
        .collect();

    let mut ports = BTreeSet::new();
    for call in calls {
        let listener = call.await.unwrap().unwrap();
        ports.insert(listener.local_addr().unwrap().port());
    }

    assert_eq!(ports.len(), 4);
    harness.stop().await;
}
