use crate::{
    errors::ErrorKind,
    http::{
        chunked::{read_chunked, ChunkError, ChunkLimits},
        types::{slice_to_usize, HeaderMap, Method, Version},
    },
    limits::ReqLimits,
    server::transport::{Connection, Line, PeerAddr},
};
use memchr::memchr;
use std::collections::BTreeMap;

/// One parsed HTTP request as handed to the handler chain.
///
/// # Wire format
///
/// ```text
/// [METHOD] SP [URI] SP "HTTP/" [VERSION] CRLF
/// ([NAME] ":" [VALUE] CRLF)*
/// CRLF
/// [BODY]
/// ```
///
/// - `[METHOD]`: `GET`, `POST` or `HEAD`, case-insensitive. Others get `501`.
/// - `[URI]`: origin-form (`/path?query`). Absolute-form
///   (`http://host/path`) is reduced to its path.
/// - `[VERSION]`: `1.0` or `1.1`. Other `HTTP/x.y` versions get `505`.
/// - Bare `LF` is accepted wherever `CRLF` is expected.
/// - Header names are case-insensitive and a repeated name keeps the last
///   value. Headers beyond [`ReqLimits::header_count`] are dropped and lines
///   without a colon are ignored.
///
/// ## Body
///
/// Only `POST` carries a body, framed either by `Content-Length` or by
/// `Transfer-Encoding: chunked` (HTTP/1.1 only). A `GET` or `HEAD` that
/// announces a body is rejected with `400`.
///
/// ## Keepalive
///
/// Defaults to on for HTTP/1.1 and off for HTTP/1.0; a `Connection: close` or
/// `Connection: keep-alive` (or `keepalive`) header overrides the default.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    uri: String,
    version: Version,

    headers: HeaderMap,
    keep_alive: bool,
    body: Vec<u8>,

    peer: PeerAddr,
    env: Env,
}

impl Request {
    /// Builds a request by hand, mostly for driving handlers directly.
    pub fn new(method: Method, uri: impl Into<String>, version: Version) -> Self {
        Self {
            method,
            uri: uri.into(),
            version,
            headers: HeaderMap::new(),
            keep_alive: version == Version::Http11,
            body: Vec::new(),
            peer: PeerAddr {
                ip: "0.0.0.0".into(),
                port: 0,
            },
            env: Env::default(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_peer(mut self, peer: PeerAddr) -> Self {
        self.peer = peer;
        self
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request target, possibly rewritten by earlier handlers.
    #[inline(always)]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline(always)]
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    /// The target without its query string.
    #[inline]
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(i) => &self.uri[..i],
            None => &self.uri,
        }
    }

    /// The query string without the leading `?`.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.uri.find('?').map(|i| &self.uri[i + 1..])
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Keepalive as requested by the client.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub const fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    #[inline(always)]
    pub const fn env(&self) -> &Env {
        &self.env
    }

    #[inline(always)]
    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }
}

/// Per-request scratch map shared by the daemon and its handlers.
///
/// The daemon seeds it before dispatch; handlers read and extend it. Well
/// known keys are provided as associated constants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env(BTreeMap<String, String>);

impl Env {
    /// `"1"` when the connection may stay open after this response.
    pub const KEEPALIVE: &'static str = "keepalive";
    pub const METHOD: &'static str = "method";
    pub const IP: &'static str = "ip";
    pub const REFERRER: &'static str = "referrer";
    /// Authenticated user name, set by basic auth.
    pub const USER: &'static str = "user";
    /// Virtual host the request resolved to.
    pub const HOST: &'static str = "host";
    /// Body bytes written by a handler that sent its own response.
    pub const SENTBYTES: &'static str = "sentbytes";
    /// File served, for the access log.
    pub const FILE: &'static str = "file";

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Reads a flag written by [`set_flag`](Self::set_flag).
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true"))
    }

    pub fn set_flag(&mut self, key: &str, on: bool) {
        self.set(key, if on { "1" } else { "0" });
    }

    pub fn number(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

//

/// Reads requests off a connection one at a time.
///
/// Remembers the protocol version of the last request line it understood so
/// an error response can be written in the same version.
#[derive(Debug, Clone)]
pub(crate) struct Parser {
    limits: ReqLimits,
    version: Version,
}

impl Parser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            limits: limits.clone(),
            version: Version::Http11,
        }
    }

    #[inline(always)]
    pub(crate) const fn version(&self) -> Version {
        self.version
    }

    /// `Ok(None)` means the peer closed cleanly between requests.
    pub(crate) fn read(&mut self, conn: &mut Connection) -> Result<Option<Request>, ErrorKind> {
        self.version = Version::Http11;

        let line = loop {
            match conn.read_line(self.limits.line_size)? {
                Line::Complete(line) if line.is_empty() => continue,
                Line::Complete(line) => break line,
                Line::TooLong => return Err(ErrorKind::UriTooLong),
                Line::Eof => return Ok(None),
            }
        };
        let (method, uri, version, mut keep_alive) = self.parse_request_line(&line)?;

        let mut headers = HeaderMap::with_capacity(16);
        loop {
            match conn.read_line(self.limits.line_size)? {
                Line::Complete(line) if line.is_empty() => break,
                Line::Complete(line) => self.parse_header(&line, &mut headers)?,
                Line::TooLong => return Err(ErrorKind::HeaderTooLarge),
                Line::Eof => return Err(ErrorKind::Closed),
            }
        }

        let method = method?;

        if headers.has_token("Connection", "close") {
            keep_alive = false;
        } else if headers.has_token("Connection", "keep-alive")
            || headers.has_token("Connection", "keepalive")
        {
            keep_alive = true;
        }

        let body = self.read_body(conn, method, version, &headers)?;

        Ok(Some(Request {
            method,
            uri,
            version,
            headers,
            keep_alive,
            body,
            peer: conn.peer().clone(),
            env: Env::default(),
        }))
    }

    /// The method is returned unchecked so headers are consumed before a
    /// `501` goes out.
    fn parse_request_line(
        &mut self,
        line: &[u8],
    ) -> Result<(Result<Method, ErrorKind>, String, Version, bool), ErrorKind> {
        let text = simdutf8::basic::from_utf8(line).map_err(|_| ErrorKind::BadRequest)?;

        let mut parts = text.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ErrorKind::BadRequest);
        };

        let (version, keep_alive) = Version::from_bytes(version.as_bytes())?;
        self.version = version;

        let uri = match target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
        {
            Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
            None if target.starts_with('/') => target,
            None => return Err(ErrorKind::BadRequest),
        };

        Ok((
            Method::from_bytes(method.as_bytes()),
            uri.to_string(),
            version,
            keep_alive,
        ))
    }

    #[inline]
    fn parse_header(&self, line: &[u8], headers: &mut HeaderMap) -> Result<(), ErrorKind> {
        let Some(colon) = memchr(b':', line) else {
            return Ok(());
        };
        let name = simdutf8::basic::from_utf8(&line[..colon])
            .map_err(|_| ErrorKind::BadRequest)?
            .trim();
        if name.is_empty() {
            return Ok(());
        }
        let value = String::from_utf8_lossy(&line[colon + 1..]);

        if headers.len() >= self.limits.header_count && !headers.contains(name) {
            return Ok(());
        }
        headers.set(name, value.trim());
        Ok(())
    }

    fn read_body(
        &self,
        conn: &mut Connection,
        method: Method,
        version: Version,
        headers: &HeaderMap,
    ) -> Result<Vec<u8>, ErrorKind> {
        let chunked = headers.has_token("Transfer-Encoding", "chunked");
        let content_length = match headers.get("Content-Length") {
            Some(value) => {
                Some(slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?)
            }
            None => None,
        };

        let mut body = Vec::new();
        match method {
            Method::Get | Method::Head => {
                if chunked || content_length.is_some_and(|len| len > 0) {
                    return Err(ErrorKind::BodyWithGet);
                }
            }
            Method::Post if chunked => {
                if version == Version::Http10 {
                    return Err(ErrorKind::BadRequest);
                }
                self.send_continue(conn, headers)?;
                let limits = ChunkLimits {
                    max_chunk: self.limits.max_chunk_size,
                    max_total: self.limits.max_post_size,
                    line_size: self.limits.line_size,
                };
                read_chunked(conn, limits, &mut body).map_err(|err| match err {
                    ChunkError::TooLarge { limit, got } => {
                        ErrorKind::ChunkSizeExceeded { limit, got }
                    }
                    ChunkError::BodyTooLarge(total) => ErrorKind::BodyTooLarge(total),
                    ChunkError::Malformed => ErrorKind::InvalidChunk,
                    ChunkError::Eof => ErrorKind::Closed,
                    ChunkError::Io(err) => ErrorKind::from(err),
                })?;
            }
            Method::Post => {
                if let Some(len) = content_length {
                    if len > self.limits.max_post_size {
                        return Err(ErrorKind::BodyTooLarge(len));
                    }
                    if len > 0 {
                        self.send_continue(conn, headers)?;
                        conn.read_exact_into(len, &mut body)?;
                    }
                }
            }
        }

        Ok(body)
    }

    #[inline]
    fn send_continue(&self, conn: &mut Connection, headers: &HeaderMap) -> Result<(), ErrorKind> {
        if self.version == Version::Http11 && headers.has_token("Expect", "100-continue") {
            conn.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;
    use std::io::{Read, Write};

    fn parse_with(raw: &[u8], limits: &ReqLimits) -> (Parser, Result<Option<Request>, ErrorKind>) {
        let (mut conn, mut peer) = socket_pair();
        peer.write_all(raw).unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let mut parser = Parser::new(limits);
        let result = parser.read(&mut conn);
        (parser, result)
    }

    fn parse(raw: &str) -> Result<Option<Request>, ErrorKind> {
        parse_with(raw.as_bytes(), &ReqLimits::default()).1
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = vec![
            (
                "GET / HTTP/1.1\r\n\r\n",
                (Method::Get, "/", Version::Http11, vec![], &b""[..], true),
            ),
            (
                "get /a/b?x=1 HTTP/1.1\nHost: example.org\n\n",
                (Method::Get, "/a/b?x=1", Version::Http11, vec![("Host", "example.org")], &b""[..], true),
            ),
            (
                "\r\n\r\nHEAD / HTTP/1.1\r\nConnection: close\r\n\r\n",
                (Method::Head, "/", Version::Http11, vec![("Connection", "close")], &b""[..], false),
            ),
            (
                "GET / HTTP/1.0\r\nconnection: Keep-Alive\r\n\r\n",
                (Method::Get, "/", Version::Http10, vec![("connection", "Keep-Alive")], &b""[..], true),
            ),
            (
                "GET / HTTP/1.0\r\nConnection: keepalive\r\n\r\n",
                (Method::Get, "/", Version::Http10, vec![("Connection", "keepalive")], &b""[..], true),
            ),
            (
                "GET / HTTP/1.0\r\n\r\n",
                (Method::Get, "/", Version::Http10, vec![], &b""[..], false),
            ),
            (
                "GET http://example.org/x?y HTTP/1.1\r\n\r\n",
                (Method::Get, "/x?y", Version::Http11, vec![], &b""[..], true),
            ),
            (
                "GET / HTTP/1.1\r\nX-A:  1 \r\nx-a: 2\r\nbroken line\r\n\r\n",
                (Method::Get, "/", Version::Http11, vec![("X-A", "2")], &b""[..], true),
            ),
            (
                "POST /upload HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"data\": \"value\"}",
                (Method::Post, "/upload", Version::Http11, vec![("Content-Length", "17")],
                 &b"{\"data\": \"value\"}"[..], true),
            ),
            (
                "POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
                (Method::Post, "/c", Version::Http11, vec![("Transfer-Encoding", "chunked")],
                 &b"abcde"[..], true),
            ),
            (
                "GET /zero HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
                (Method::Get, "/zero", Version::Http11, vec![("Content-Length", "0")], &b""[..], true),
            ),
        ];

        for (raw, (method, uri, version, headers, body, keep_alive)) in cases {
            let req = parse(raw).unwrap().unwrap();

            assert_eq!(req.method(), method, "{raw:?}");
            assert_eq!(req.uri(), uri, "{raw:?}");
            assert_eq!(req.version(), version, "{raw:?}");
            assert_eq!(req.headers().iter().collect::<Vec<_>>(), headers, "{raw:?}");
            assert_eq!(req.body(), body, "{raw:?}");
            assert_eq!(req.is_keep_alive(), keep_alive, "{raw:?}");
        }
    }

    #[test]
    fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases = vec![
            ("GET /\r\n\r\n",                                  ErrorKind::BadRequest),
            ("GET / HTTP/1.1 extra\r\n\r\n",                   ErrorKind::BadRequest),
            ("GET nopath HTTP/1.1\r\n\r\n",                    ErrorKind::BadRequest),
            ("GET / FTP/1.0\r\n\r\n",                          ErrorKind::BadRequest),
            ("GET / HTTP/2.0\r\n\r\n",                         ErrorKind::UnsupportedVersion),
            ("PUT / HTTP/1.1\r\n\r\n",                         ErrorKind::UnsupportedMethod("PUT".into())),
            ("GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", ErrorKind::BodyWithGet),
            ("HEAD / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", ErrorKind::BodyWithGet),
            ("POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n",   ErrorKind::InvalidContentLength),
            ("POST / HTTP/1.1\r\nContent-Length: 2000000\r\n\r\n", ErrorKind::BodyTooLarge(2_000_000)),
            ("POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n", ErrorKind::BadRequest),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nq\r\n", ErrorKind::InvalidChunk),
            ("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort",  ErrorKind::Closed),
            ("GET / HTTP/1.1\r\nHost: x\r\n",                  ErrorKind::Closed),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw), Err(expected), "{raw:?}");
        }
    }

    #[test]
    fn error_version_follows_request_line() {
        let limits = ReqLimits::default();
        let (parser, result) = parse_with(b"BREW /pot HTTP/1.0\r\n\r\n", &limits);
        assert_eq!(result, Err(ErrorKind::UnsupportedMethod("BREW".into())));
        assert_eq!(parser.version(), Version::Http10);

        let (parser, _) = parse_with(b"GET / HTTP/3.0\r\n\r\n", &limits);
        assert_eq!(parser.version(), Version::Http11);
    }

    #[test]
    fn check_limits() {
        let limits = ReqLimits {
            header_count: 3,
            line_size: 32,
            max_post_size: 4,
            max_chunk_size: 2,
            ..ReqLimits::default()
        };

        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..5 {
            raw.push_str(&format!("H{i}: {i}\r\n"));
        }
        raw.push_str("h0: again\r\n\r\n");
        let req = parse_with(raw.as_bytes(), &limits).1.unwrap().unwrap();
        assert_eq!(
            req.headers().iter().collect::<Vec<_>>(),
            vec![("H0", "again"), ("H1", "1"), ("H2", "2")]
        );

        #[rustfmt::skip]
        let cases: Vec<(String, ErrorKind)> = vec![
            (format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(40)), ErrorKind::UriTooLong),
            (format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "v".repeat(40)), ErrorKind::HeaderTooLarge),
            ("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n12345".into(), ErrorKind::BodyTooLarge(5)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n".into(),
             ErrorKind::ChunkSizeExceeded { limit: 2, got: 3 }),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n2\r\ncd\r\n1\r\ne\r\n0\r\n\r\n".into(),
             ErrorKind::BodyTooLarge(5)),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse_with(raw.as_bytes(), &limits).1, Err(expected), "{raw:?}");
        }
    }

    #[test]
    fn clean_close_and_pipelining() {
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("\r\n"), Ok(None));

        let (mut conn, mut peer) = socket_pair();
        peer.write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n").unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let mut parser = Parser::new(&ReqLimits::default());
        assert_eq!(parser.read(&mut conn).unwrap().unwrap().uri(), "/1");
        assert_eq!(parser.read(&mut conn).unwrap().unwrap().uri(), "/2");
        assert_eq!(parser.read(&mut conn), Ok(None));
    }

    #[test]
    fn expect_continue() {
        let (mut conn, mut peer) = socket_pair();
        peer.write_all(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let req = Parser::new(&ReqLimits::default())
            .read(&mut conn)
            .unwrap()
            .unwrap();
        assert_eq!(req.body(), b"ok");
        conn.close();

        let mut interim = String::new();
        peer.read_to_string(&mut interim).unwrap();
        assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");
    }

    #[test]
    fn accessors() {
        let mut req = Request::new(Method::Get, "/a/b?c=d", Version::Http11)
            .with_header("Referer", "http://x/");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("c=d"));
        assert_eq!(req.header("referer"), Some("http://x/"));

        req.set_uri("/plain");
        assert_eq!(req.path(), "/plain");
        assert_eq!(req.query(), None);

        req.env_mut().set_flag(Env::KEEPALIVE, true);
        req.env_mut().set(Env::SENTBYTES, "42");
        assert!(req.env().flag(Env::KEEPALIVE));
        assert_eq!(req.env().number(Env::SENTBYTES), Some(42));
        assert!(!req.env().flag(Env::USER));
    }
}
