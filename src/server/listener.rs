use crate::{
    errors::ServerError,
    server::transport::{CodecFactory, Connection, Stream},
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    fmt, io,
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::{os::unix::net::UnixListener, path::PathBuf};

const BACKLOG: i32 = 128;
#[cfg(not(unix))]
const POLL_STEP: Duration = Duration::from_millis(5);

/// A bound, listening socket that hands out [`Connection`]s.
///
/// The socket is non-blocking internally and [`try_accept`](Self::try_accept)
/// waits for it with `poll(2)`, so it can give up after a timeout; accepted
/// streams are switched back to blocking mode. Callers serialize accepts themselves (the daemon holds an
/// accept lock around every call).
pub struct Listener {
    inner: Inner,
    codec: Option<CodecFactory>,
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Listener");
        match &self.inner {
            Inner::Tcp(l) => s.field("addr", &l.local_addr().ok()),
            #[cfg(unix)]
            Inner::Unix(_, path) => s.field("path", path),
        };
        s.field("encoded", &self.codec.is_some()).finish()
    }
}

impl Listener {
    /// Listens on every IPv4 interface.
    pub fn listen(port: u16) -> Result<Self, ServerError> {
        Self::listen_on(("0.0.0.0", port))
    }

    /// Listens on the first address `addr` resolves to.
    ///
    /// ```no_run
    /// use pool_httpd::Listener;
    ///
    /// let listener = Listener::listen_on("127.0.0.1:8080").unwrap();
    /// ```
    pub fn listen_on<A: ToSocketAddrs + fmt::Debug>(addr: A) -> Result<Self, ServerError> {
        let socket_err = |source| ServerError::SocketCreate {
            addr: format!("{addr:?}"),
            source,
        };
        let addr = addr
            .to_socket_addrs()
            .map_err(socket_err)?
            .next()
            .ok_or_else(|| socket_err(io::ErrorKind::AddrNotAvailable.into()))?;

        let listener = bind_tcp(addr).map_err(|source| ServerError::SocketCreate {
            addr: addr.to_string(),
            source,
        })?;
        tracing::debug!(%addr, "listening");

        Ok(Self {
            inner: Inner::Tcp(listener),
            codec: None,
        })
    }

    /// Listens on a Unix-domain socket, replacing a stale socket file.
    ///
    /// Anything at `path` that is not a socket is left alone and fails with
    /// [`io::ErrorKind::AlreadyExists`].
    #[cfg(unix)]
    pub fn listen_unix(path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        use std::os::unix::fs::FileTypeExt;

        let path = path.into();
        let socket_err = |source| ServerError::SocketCreate {
            addr: path.display().to_string(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(&path).map_err(socket_err)?;
            }
            Ok(_) => return Err(socket_err(io::ErrorKind::AlreadyExists.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(socket_err(err)),
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(socket_err)?;
        let addr = SockAddr::unix(&path).map_err(socket_err)?;
        socket.bind(&addr).map_err(socket_err)?;
        socket.listen(BACKLOG).map_err(socket_err)?;
        socket.set_nonblocking(true).map_err(socket_err)?;
        tracing::debug!(path = %path.display(), "listening");

        Ok(Self {
            inner: Inner::Unix(std::os::fd::OwnedFd::from(socket).into(), path),
            codec: None,
        })
    }

    /// Wraps every accepted connection in a codec built by `factory`.
    pub fn with_codec(mut self, factory: CodecFactory) -> Self {
        self.codec = Some(factory);
        self
    }

    /// Bound address; `None` for Unix-domain listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Inner::Unix(..) => None,
        }
    }

    /// Blocks until a connection arrives.
    pub fn accept(&self) -> io::Result<Connection> {
        loop {
            if let Some(conn) = self.try_accept(Duration::from_secs(3600))? {
                return Ok(conn);
            }
        }
    }

    /// Waits up to `timeout` for a connection; `Ok(None)` when none came.
    pub fn try_accept(&self, timeout: Duration) -> io::Result<Option<Connection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.accept_once() {
                Ok(stream) => {
                    let codec = self.codec.as_ref().map(|factory| factory());
                    return Connection::new(stream, codec).map(Some);
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait_readable(deadline - now)?;
        }
    }

    /// Blocks until the socket is readable or `timeout` passes.
    #[cfg(unix)]
    fn wait_readable(&self, timeout: Duration) -> io::Result<()> {
        use nix::{
            errno::Errno,
            poll::{poll, PollFd, PollFlags, PollTimeout},
        };
        use std::os::fd::AsFd;

        let fd = match &self.inner {
            Inner::Tcp(l) => l.as_fd(),
            Inner::Unix(l, _) => l.as_fd(),
        };
        // Rounded up so a sub-millisecond remainder still sleeps.
        let millis = u16::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(u16::MAX);

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    #[cfg(not(unix))]
    fn wait_readable(&self, timeout: Duration) -> io::Result<()> {
        std::thread::sleep(POLL_STEP.min(timeout));
        Ok(())
    }

    fn accept_once(&self) -> io::Result<Stream> {
        match &self.inner {
            Inner::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                let _ = stream.set_nodelay(true);
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Inner::Unix(l, _) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Inner::Unix(_, path) = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[inline]
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::transport::Line;
    use std::{io::Write, net::TcpStream};

    #[test]
    fn try_accept_times_out() {
        let listener = Listener::listen_on("127.0.0.1:0").unwrap();
        let start = Instant::now();
        assert!(listener.try_accept(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn try_accept_wakes_on_connect() {
        let listener = Listener::listen_on("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            TcpStream::connect(addr).unwrap()
        });

        let start = Instant::now();
        let conn = listener.try_accept(Duration::from_secs(30)).unwrap();
        assert!(conn.is_some());
        assert!(start.elapsed() < Duration::from_secs(10));
        client.join().unwrap();
    }

    #[test]
    fn accepts_blocking_connection() {
        let listener = Listener::listen_on("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping\r\n").unwrap();

        let mut conn = listener.accept().unwrap();
        assert_eq!(conn.peer().ip, "127.0.0.1");
        assert_eq!(conn.read_line(16).unwrap(), Line::Complete(b"ping".to_vec()));
    }

    #[test]
    fn port_in_use_is_socket_create() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        match Listener::listen_on(addr) {
            Err(ServerError::SocketCreate { addr: a, .. }) => assert_eq!(a, addr.to_string()),
            other => panic!("expected SocketCreate, got {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("httpd.sock");
        // Dropping a std listener leaves its socket file behind.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::listen_unix(&path).unwrap();
        assert!(listener.local_addr().is_none());

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client.write_all(b"hi\n").unwrap();

        let mut conn = listener.try_accept(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(conn.peer().ip, "unix");
        assert_eq!(conn.read_line(16).unwrap(), Line::Complete(b"hi".to_vec()));

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    #[cfg(unix)]
    fn unix_socket_keeps_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"keep me").unwrap();

        match Listener::listen_unix(&path) {
            Err(ServerError::SocketCreate { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("expected SocketCreate, got {other:?}"),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }
}
