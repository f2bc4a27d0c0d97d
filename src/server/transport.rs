//! Buffered, optionally encoded byte streams shared by the daemon and the client.

use memchr::memchr;
use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

const READ_CHUNK: usize = 8 * 1024;
const FILE_CHUNK: usize = 64 * 1024;

/// Byte-stream transform layered between a socket and the HTTP code.
///
/// Plaintext goes in through [`add_output`](Self::add_output) and the encoded
/// bytes are drained with [`peek_output`](Self::peek_output) and
/// [`done_output`](Self::done_output). Raw socket bytes go in through
/// [`add_input`](Self::add_input), which appends whatever plaintext they
/// complete. A TLS engine is the intended implementor; none ships with the
/// crate.
pub trait TransportCodec: Send {
    /// Called once before the first byte is exchanged.
    fn setup(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called when the connection is torn down.
    fn reset(&mut self) {}

    fn add_input(&mut self, raw: &[u8], plain: &mut Vec<u8>) -> io::Result<()>;

    fn add_output(&mut self, plain: &[u8]) -> io::Result<()>;

    fn can_output(&self) -> bool;

    fn peek_output(&self) -> &[u8];

    fn done_output(&mut self, n: usize);
}

/// Produces a fresh codec per connection.
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn TransportCodec> + Send + Sync>;

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    /// Address reported for Unix-domain peers.
    pub fn local() -> Self {
        Self {
            ip: "unix".into(),
            port: 0,
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Connected socket of either family.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    pub fn peer(&self) -> PeerAddr {
        match self {
            Stream::Tcp(s) => s.peer_addr().map(PeerAddr::from).unwrap_or_else(|_| PeerAddr {
                ip: "0.0.0.0".into(),
                port: 0,
            }),
            #[cfg(unix)]
            Stream::Unix(_) => PeerAddr::local(),
        }
    }

    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(read)?;
                s.set_write_timeout(write)
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(read)?;
                s.set_write_timeout(write)
            }
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Result of [`Connection::read_line`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line {
    /// Line content without the trailing `\r\n` or `\n`.
    Complete(Vec<u8>),
    /// The line ran past the caller's limit; the stream is no longer in sync.
    TooLong,
    /// The peer closed before a full line arrived.
    Eof,
}

/// A socket with an input buffer and an optional [`TransportCodec`].
pub struct Connection {
    stream: Stream,
    codec: Option<Box<dyn TransportCodec>>,
    inbuf: Vec<u8>,
    pos: usize,
    raw: Box<[u8]>,
    peer: PeerAddr,
    eof: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("encoded", &self.codec.is_some())
            .field("buffered", &(self.inbuf.len() - self.pos))
            .field("eof", &self.eof)
            .finish()
    }
}

impl Connection {
    pub fn new(stream: Stream, mut codec: Option<Box<dyn TransportCodec>>) -> io::Result<Self> {
        if let Some(codec) = codec.as_mut() {
            codec.setup()?;
        }
        Ok(Self {
            peer: stream.peer(),
            stream,
            codec,
            inbuf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            raw: vec![0; READ_CHUNK].into_boxed_slice(),
            eof: false,
        })
    }

    #[inline]
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// `None` blocks forever.
    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        self.stream.set_timeouts(read, write)
    }

    /// Peer has closed and everything it sent has been consumed.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.eof && self.pos == self.inbuf.len()
    }

    #[inline]
    fn consume(&mut self, n: usize) {
        self.pos += n;
        if self.pos == self.inbuf.len() {
            self.inbuf.clear();
            self.pos = 0;
        }
    }

    /// Reads from the socket until at least one plaintext byte is buffered.
    /// Returns `0` once the peer has closed.
    fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.pos > 0 && self.pos * 2 >= self.inbuf.len() {
            self.inbuf.drain(..self.pos);
            self.pos = 0;
        }

        loop {
            let n = match self.stream.read(&mut self.raw) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if n == 0 {
                self.eof = true;
                return Ok(0);
            }

            let before = self.inbuf.len();
            match self.codec.as_mut() {
                Some(codec) => codec.add_input(&self.raw[..n], &mut self.inbuf)?,
                None => self.inbuf.extend_from_slice(&self.raw[..n]),
            }
            // A codec may hold back an incomplete record.
            let added = self.inbuf.len() - before;
            if added > 0 {
                return Ok(added);
            }
        }
    }

    /// Reads one `\n` terminated line of at most `max` bytes.
    pub(crate) fn read_line(&mut self, max: usize) -> io::Result<Line> {
        let mut scanned = 0;
        loop {
            let buf = &self.inbuf[self.pos..];
            if let Some(i) = memchr(b'\n', &buf[scanned..]) {
                let end = scanned + i;
                let content = match buf[..end].last() {
                    Some(b'\r') => &buf[..end - 1],
                    _ => &buf[..end],
                };
                if content.len() > max {
                    self.consume(end + 1);
                    return Ok(Line::TooLong);
                }
                let line = content.to_vec();
                self.consume(end + 1);
                return Ok(Line::Complete(line));
            }

            scanned = buf.len();
            if scanned > max + 1 {
                return Ok(Line::TooLong);
            }
            if self.fill()? == 0 {
                return Ok(Line::Eof);
            }
        }
    }

    /// Appends exactly `n` bytes to `out`.
    pub(crate) fn read_exact_into(&mut self, n: usize, out: &mut Vec<u8>) -> io::Result<()> {
        out.reserve(n);
        let mut left = n;
        while left > 0 {
            if self.pos == self.inbuf.len() && self.fill()? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let avail = &self.inbuf[self.pos..];
            let take = avail.len().min(left);
            out.extend_from_slice(&avail[..take]);
            self.consume(take);
            left -= take;
        }
        Ok(())
    }

    /// Appends everything until the peer closes.
    pub(crate) fn read_to_end_into(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        loop {
            out.extend_from_slice(&self.inbuf[self.pos..]);
            let len = self.inbuf.len() - self.pos;
            self.consume(len);
            if self.fill()? == 0 {
                return Ok(());
            }
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.codec.as_mut() {
            None => self.stream.write_all(data),
            Some(codec) => {
                codec.add_output(data)?;
                while codec.can_output() {
                    let n = self.stream.write(codec.peek_output())?;
                    if n == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    codec.done_output(n);
                }
                Ok(())
            }
        }
    }

    #[inline]
    pub fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    /// Copies up to `len` bytes of `file` to the peer; returns bytes sent.
    pub fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64> {
        let mut buf = vec![0u8; FILE_CHUNK.min(len as usize).max(1)];
        let mut sent = 0u64;
        while sent < len {
            let want = (buf.len() as u64).min(len - sent) as usize;
            let n = match file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.write_all(&buf[..n])?;
            sent += n as u64;
        }
        Ok(sent)
    }

    /// Tears the connection down; errors are irrelevant at this point.
    pub fn close(&mut self) {
        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        let _ = self.stream.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tools::*;
    use std::io::Write as _;

    /// XOR "cipher" that only emits complete frames (4 bytes by default).
    pub(crate) struct XorCodec {
        key: u8,
        frame: usize,
        pending_in: Vec<u8>,
        out: Vec<u8>,
    }

    impl XorCodec {
        pub(crate) fn new(key: u8) -> Self {
            Self {
                key,
                frame: 4,
                pending_in: Vec::new(),
                out: Vec::new(),
            }
        }

        /// Passes every byte through as soon as it arrives.
        pub(crate) fn streaming(key: u8) -> Self {
            Self {
                frame: 1,
                ..Self::new(key)
            }
        }
    }

    impl TransportCodec for XorCodec {
        fn add_input(&mut self, raw: &[u8], plain: &mut Vec<u8>) -> io::Result<()> {
            self.pending_in.extend_from_slice(raw);
            let whole = self.pending_in.len() / self.frame * self.frame;
            plain.extend(self.pending_in.drain(..whole).map(|b| b ^ self.key));
            Ok(())
        }

        fn add_output(&mut self, plain: &[u8]) -> io::Result<()> {
            self.out.extend(plain.iter().map(|b| b ^ self.key));
            Ok(())
        }

        fn can_output(&self) -> bool {
            !self.out.is_empty()
        }

        fn peek_output(&self) -> &[u8] {
            &self.out
        }

        fn done_output(&mut self, n: usize) {
            self.out.drain(..n);
        }
    }

    #[test]
    fn lines() {
        let (mut conn, mut peer) = socket_pair();
        peer.write_all(b"GET / HTTP/1.1\r\nbare\n\r\n0123456789\nlast").unwrap();
        drop(peer);

        #[rustfmt::skip]
        let cases = [
            (64, Line::Complete(b"GET / HTTP/1.1".to_vec())),
            (64, Line::Complete(b"bare".to_vec())),
            (64, Line::Complete(Vec::new())),
            (4,  Line::TooLong),
            (64, Line::Eof),
        ];

        for (max, expected) in cases {
            assert_eq!(conn.read_line(max).unwrap(), expected);
        }
    }

    #[test]
    fn exact_and_rest() {
        let (mut conn, mut peer) = socket_pair();
        peer.write_all(b"headbody-and-the-rest").unwrap();
        drop(peer);

        let mut out = Vec::new();
        conn.read_exact_into(4, &mut out).unwrap();
        assert_eq!(out, b"head");

        out.clear();
        conn.read_to_end_into(&mut out).unwrap();
        assert_eq!(out, b"body-and-the-rest");

        let err = conn.read_exact_into(1, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn codec_round_trip_over_socket() {
        let (server, client) = socket_pair_streams();
        let mut a = Connection::new(Stream::Tcp(server), Some(Box::new(XorCodec::new(0x5a)))).unwrap();
        let mut b = Connection::new(Stream::Tcp(client), Some(Box::new(XorCodec::new(0x5a)))).unwrap();

        // 16 bytes, a multiple of the frame size
        a.write_all(b"hello, codec!!\r\n").unwrap();
        assert_eq!(b.read_line(64).unwrap(), Line::Complete(b"hello, codec!!".to_vec()));
    }

    #[test]
    fn send_file_respects_length() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 1000]).unwrap();
        std::io::Seek::rewind(&mut file).unwrap();

        let (mut conn, mut peer) = socket_pair();
        assert_eq!(conn.send_file(&mut file, 600).unwrap(), 600);
        conn.close();

        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got.len(), 600);
    }
}
