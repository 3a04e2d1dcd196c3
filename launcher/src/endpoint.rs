use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use utils::FrameError;

/// Pause between connect attempts while the listener's backlog is full.
const CONNECT_RETRY: Duration = Duration::from_millis(20);

/// The OS-local rendezvous point that at most one process can listen on.
///
/// Exclusivity comes from the kernel refusing a second bind; nothing here
/// locks around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Linux abstract-namespace socket. The kernel releases the name when the
    /// holder exits, so a crashed primary never leaves anything behind.
    Abstract(String),
    /// Socket file on disk.
    Path(PathBuf),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint is held by another process")]
    InUse,
    #[error("bind failed: {0}")]
    Bind(io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("no instance is listening")]
    ConnectRefused,
    #[error("primary did not complete the handshake: {0}")]
    Handshake(#[from] FrameError),
    #[error("expected hello from primary, got {0}")]
    UnexpectedGreeting(&'static str),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Abstract(name) => write!(f, "@{name}"),
            Endpoint::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &str) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract socket names are linux-only",
    ))
}

fn set_mode(path: &Path, mode: u32) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        log::warn!("endpoint: chmod {:o} {} failed: {}", mode, path.display(), e);
    }
}

fn into_tokio_stream(socket: Socket) -> io::Result<UnixStream> {
    UnixStream::from_std(StdUnixStream::from(OwnedFd::from(socket)))
}

fn classify_connect_error(e: io::Error) -> EndpointError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => EndpointError::ConnectRefused,
        _ => EndpointError::Io(e),
    }
}

impl Endpoint {
    /// The endpoint for `name`, scoped to the current user.
    pub fn for_session(name: &str) -> Self {
        let scoped = format!("{}.{}", name, crate::paths::effective_uid());
        if cfg!(target_os = "linux") {
            Endpoint::Abstract(scoped)
        } else {
            Endpoint::Path(crate::paths::default_state_dir().join(format!("{scoped}.sock")))
        }
    }

    fn socket_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Abstract(name) => abstract_addr(name),
            Endpoint::Path(p) => SocketAddr::from_pathname(p),
        }
    }

    fn connect_addr(&self) -> io::Result<SockAddr> {
        match self {
            Endpoint::Abstract(name) => {
                abstract_addr(name)?;
                // A leading NUL selects the abstract namespace.
                let mut raw = Vec::with_capacity(name.len() + 1);
                raw.push(0);
                raw.extend_from_slice(name.as_bytes());
                SockAddr::unix(OsStr::from_bytes(&raw))
            }
            Endpoint::Path(p) => SockAddr::unix(p),
        }
    }

    /// Claim the endpoint. `InUse` means someone else holds it, whether that
    /// holder is alive or a leftover socket file from a crash.
    pub fn bind(&self) -> Result<UnixListener, EndpointError> {
        if let Endpoint::Path(p) = self {
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent)?;
                set_mode(parent, 0o700);
            }
        }

        let addr = self.socket_addr()?;
        let listener = StdUnixListener::bind_addr(&addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => EndpointError::InUse,
            _ => EndpointError::Bind(e),
        })?;
        if let Endpoint::Path(p) = self {
            set_mode(p, 0o600);
        }
        listener.set_nonblocking(true)?;
        log::debug!("endpoint: bound {}", self);
        Ok(UnixListener::from_std(listener)?)
    }

    /// Connect with an upper bound on the wait.
    ///
    /// The socket is non-blocking from the start, so giving up leaves nothing
    /// running. A full backlog (`WouldBlock`) queues nothing and is retried
    /// until `timeout` runs out.
    pub async fn connect(&self, timeout: Duration) -> Result<UnixStream, EndpointError> {
        let addr = self.connect_addr()?;
        let deadline = Instant::now() + timeout;
        loop {
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            match socket.connect(&addr) {
                Ok(()) => {
                    log::debug!("endpoint: connected {}", self);
                    return Ok(into_tokio_stream(socket)?);
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    let stream = into_tokio_stream(socket)?;
                    tokio::time::timeout_at(deadline, stream.writable())
                        .await
                        .map_err(|_| EndpointError::ConnectTimeout(timeout))??;
                    if let Some(e) = stream.take_error()? {
                        return Err(classify_connect_error(e));
                    }
                    log::debug!("endpoint: connected {}", self);
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EndpointError::ConnectTimeout(timeout));
                    }
                    log::debug!("endpoint: {} backlog full, retrying", self);
                    tokio::time::sleep_until((now + CONNECT_RETRY).min(deadline)).await;
                }
                Err(e) => return Err(classify_connect_error(e)),
            }
        }
    }

    /// Remove the socket file this process bound. Abstract names need nothing.
    pub fn release(&self) {
        if let Endpoint::Path(p) = self {
            if let Err(e) = fs::remove_file(p) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("endpoint: failed to remove {}: {}", p.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn path_endpoint(dir: &tempfile::TempDir) -> Endpoint {
        Endpoint::Path(dir.path().join("launcher.sock"))
    }

    /// A listener with a one-slot backlog that never accepts, plus the client
    /// sockets that filled that backlog. Both must stay alive for the duration.
    pub(crate) fn saturated_listener(path: &Path) -> (Socket, Vec<Socket>) {
        let addr = SockAddr::unix(path).unwrap();
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(1).unwrap();

        let mut queued = Vec::new();
        for _ in 0..64 {
            let client = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
            client.set_nonblocking(true).unwrap();
            match client.connect(&addr) {
                Ok(()) => queued.push(client),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (listener, queued),
                Err(e) => panic!("unexpected connect error: {e}"),
            }
        }
        panic!("backlog never filled after {} connects", queued.len());
    }

    #[tokio::test]
    async fn second_bind_is_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let ep = path_endpoint(&dir);
        let _first = ep.bind().unwrap();
        assert!(matches!(ep.bind(), Err(EndpointError::InUse)));
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ep = path_endpoint(&dir);
        let err = ep.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EndpointError::ConnectRefused), "{err:?}");
    }

    #[tokio::test]
    async fn stale_socket_file_is_treated_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let ep = path_endpoint(&dir);
        drop(ep.bind().unwrap());

        // The file outlives the listener, as after a crash.
        assert!(dir.path().join("launcher.sock").exists());
        assert!(matches!(ep.bind(), Err(EndpointError::InUse)));
        assert!(matches!(
            ep.connect(Duration::from_secs(1)).await,
            Err(EndpointError::ConnectRefused)
        ));

        ep.release();
        assert!(ep.bind().is_ok());
    }

    #[tokio::test]
    async fn bound_socket_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("run").join("launcher.sock");
        let _listener = Endpoint::Path(sock.clone()).bind().unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(sock.as_path()), 0o600);
        assert_eq!(mode(dir.path().join("run").as_path()), 0o700);

        // A failed chmod is logged, not propagated.
        set_mode(&dir.path().join("gone"), 0o600);
    }

    #[tokio::test]
    async fn connect_reaches_bound_listener() {
        let dir = tempfile::tempdir().unwrap();
        let ep = path_endpoint(&dir);
        let listener = ep.bind().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        ep.connect(Duration::from_secs(1)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn full_backlog_times_out_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.sock");
        let (_listener, _queued) = saturated_listener(&path);

        let started = std::time::Instant::now();
        let err = Endpoint::Path(path)
            .connect(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::ConnectTimeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_connect_reaches_bound_listener() {
        let ep = Endpoint::Abstract(format!("jitsi-meet-launcher-test.{}", uuid::Uuid::new_v4()));
        let listener = ep.bind().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        ep.connect(Duration::from_secs(1)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_name_is_released_with_its_holder() {
        let ep = Endpoint::Abstract(format!("jitsi-meet-launcher-test.{}", uuid::Uuid::new_v4()));
        let held = ep.bind().unwrap();
        assert!(matches!(ep.bind(), Err(EndpointError::InUse)));
        drop(held);
        assert!(ep.bind().is_ok());
    }

    #[test]
    fn session_endpoint_is_user_scoped() {
        let ep = Endpoint::for_session("jitsi-meet-launcher.v1");
        let uid = crate::paths::effective_uid().to_string();
        assert!(ep.to_string().contains(&uid), "{ep}");
    }
}
