//! Blocking HTTP/1.1 client with connection reuse.

use crate::{
    errors::{ClientError, ErrorCode},
    http::{
        chunked::{self, ChunkError, ChunkLimits},
        query,
        types::{slice_to_usize, HeaderMap, Method},
    },
    limits::ClientLimits,
    server::transport::{CodecFactory, Connection, Line, Stream},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use url::Url;

/// Chunk size used by [`HttpClientSocket::post_chunked`].
const UPLOAD_CHUNK: usize = 8 * 1024;

/// An HTTP client that keeps its connection open between requests to the
/// same host.
///
/// Transport failures are returned as [`ClientError`] and also remembered:
/// after a failed call [`status`](Self::status) is `0` and
/// [`error_code`](Self::error_code) tells what went wrong.
///
/// ```no_run
/// use pool_httpd::HttpClientSocket;
///
/// let mut client = HttpClientSocket::new();
/// client.set_authentication("ann", "secret");
/// let body = client
///     .post_form("http://127.0.0.1:8080/login", &[("next", "/home")])
///     .unwrap();
/// println!("{} {}", client.status(), String::from_utf8_lossy(&body));
/// ```
pub struct HttpClientSocket {
    limits: ClientLimits,
    codec: Option<CodecFactory>,
    timeout: Option<Duration>,
    proxy: Option<(String, u16)>,
    credentials: Option<String>,
    keepalive: bool,

    cached: Option<Cached>,
    status: u16,
    headers: HeaderMap,
    error: Option<(ErrorCode, String)>,
}

impl std::fmt::Debug for HttpClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientSocket")
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("connected", &self.cached.as_ref().map(|c| &c.endpoint))
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Where the socket actually connects: the target, or the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    secure: bool,
}

struct Cached {
    endpoint: Endpoint,
    conn: Connection,
}

/// A parsed request url.
#[derive(Debug)]
struct Target {
    url: Url,
    host: String,
    port: u16,
    secure: bool,
}

impl Target {
    fn parse(raw: &str, can_encode: bool) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
        let secure = match url.scheme() {
            "http" => false,
            "https" if can_encode => true,
            "https" => return Err(invalid("https needs a transport codec")),
            _ => return Err(invalid("unsupported scheme")),
        };
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.trim_matches(['[', ']']).to_string(),
            _ => return Err(invalid("missing host")),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        Ok(Self {
            url,
            host,
            port,
            secure,
        })
    }

    /// `Host` header value; the port is only named when it is not the default.
    fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Path and query, as sent in the request line.
    fn origin_form(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }
}

enum Body<'a> {
    None,
    Sized(&'a str, &'a [u8]),
    Chunked(&'a str, &'a [u8]),
}

/// Why one attempt on a connection failed.
enum Attempt {
    /// The connection was dead before the server saw the request.
    Stale(ClientError),
    Failed(ClientError),
}

struct Reply {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    reusable: bool,
}

impl Default for HttpClientSocket {
    fn default() -> Self {
        Self::with_limits(ClientLimits::default())
    }
}

impl HttpClientSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ClientLimits) -> Self {
        Self {
            limits,
            codec: None,
            timeout: None,
            proxy: None,
            credentials: None,
            keepalive: true,
            cached: None,
            status: 0,
            headers: HeaderMap::new(),
            error: None,
        }
    }

    /// Enables `https://` urls, with each connection wrapped in a codec
    /// built by `factory`.
    pub fn with_codec(mut self, factory: CodecFactory) -> Self {
        self.codec = Some(factory);
        self
    }

    /// Bounds connecting and every blocking read or write. Zero blocks
    /// forever.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Sends every request through the proxy at `host:port`.
    pub fn set_proxy(&mut self, host: impl Into<String>, port: u16) {
        self.proxy = Some((host.into(), port));
    }

    /// Adds basic credentials to every following request.
    pub fn set_authentication(&mut self, user: &str, pass: &str) {
        self.credentials = Some(STANDARD.encode(format!("{user}:{pass}")));
    }

    /// Whether to ask the server to keep the connection open (default: on).
    pub fn set_keepalive(&mut self, on: bool) {
        self.keepalive = on;
    }

    /// Status of the last response; `0` when the last request failed.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Description of the last failure, cleared by a successful request.
    pub fn last_error(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, text)| text.as_str())
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|(code, _)| *code)
    }

    /// Fetches `url`. Each `(name, value)` in `headers` is sent as given and
    /// can override `Host`.
    pub fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, ClientError> {
        self.request(Method::Get, url, headers, Body::None)
    }

    /// Posts `body` with a `Content-Length`.
    pub fn post(
        &mut self,
        url: &str,
        content_type: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<Vec<u8>, ClientError> {
        self.request(Method::Post, url, headers, Body::Sized(content_type, body))
    }

    /// Posts `body` with `Transfer-Encoding: chunked`.
    pub fn post_chunked(
        &mut self,
        url: &str,
        content_type: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<Vec<u8>, ClientError> {
        self.request(Method::Post, url, headers, Body::Chunked(content_type, body))
    }

    /// Posts `pairs` as an `application/x-www-form-urlencoded` body.
    pub fn post_form(&mut self, url: &str, pairs: &[(&str, &str)]) -> Result<Vec<u8>, ClientError> {
        let form = query::encode_form(pairs.iter().copied());
        self.post(
            url,
            "application/x-www-form-urlencoded",
            form.as_bytes(),
            &[],
        )
    }

    /// Closes a kept connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(mut cached) = self.cached.take() {
            cached.conn.close();
        }
    }

    fn request(
        &mut self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Body<'_>,
    ) -> Result<Vec<u8>, ClientError> {
        match self.perform(method, url, headers, body) {
            Ok(reply) => {
                self.status = reply.status;
                self.headers = reply.headers;
                self.error = None;
                Ok(reply.body)
            }
            Err(err) => {
                tracing::debug!(%url, %err, "request failed");
                self.disconnect();
                self.status = 0;
                self.headers = HeaderMap::new();
                self.error = Some((err.code(), err.to_string()));
                Err(err)
            }
        }
    }

    fn perform(
        &mut self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Body<'_>,
    ) -> Result<Reply, ClientError> {
        let target = Target::parse(url, self.codec.is_some())?;
        let request = self.encode(method, &target, headers, &body);
        let endpoint = match &self.proxy {
            Some((host, port)) => Endpoint {
                host: host.clone(),
                port: *port,
                secure: target.secure,
            },
            None => Endpoint {
                host: target.host.clone(),
                port: target.port,
                secure: target.secure,
            },
        };

        loop {
            let (mut conn, reused) = match self.cached.take() {
                Some(cached) if cached.endpoint == endpoint => (cached.conn, true),
                other => {
                    if let Some(mut old) = other {
                        old.conn.close();
                    }
                    (self.connect(&endpoint)?, false)
                }
            };
            conn.set_timeouts(self.timeout, self.timeout)?;

            match self.exchange(&mut conn, &request) {
                Ok(reply) => {
                    if reply.reusable {
                        self.cached = Some(Cached { endpoint, conn });
                    } else {
                        conn.close();
                    }
                    return Ok(reply);
                }
                Err(Attempt::Stale(err)) if reused => {
                    tracing::debug!(host = %endpoint.host, port = endpoint.port, %err, "kept connection went stale, reconnecting");
                    conn.close();
                }
                Err(Attempt::Stale(err) | Attempt::Failed(err)) => {
                    conn.close();
                    return Err(err);
                }
            }
        }
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<Connection, ClientError> {
        let fail = |source: io::Error| ClientError::ConnectFail {
            host: endpoint.host.clone(),
            port: endpoint.port,
            source,
        };

        let stream = match self.timeout {
            None => TcpStream::connect((endpoint.host.as_str(), endpoint.port)).map_err(fail)?,
            Some(timeout) => {
                let mut last = io::Error::new(io::ErrorKind::NotFound, "host has no addresses");
                let mut stream = None;
                for addr in (endpoint.host.as_str(), endpoint.port)
                    .to_socket_addrs()
                    .map_err(fail)?
                {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(err) => last = err,
                    }
                }
                stream.ok_or(last).map_err(fail)?
            }
        };
        stream.set_nodelay(true).map_err(fail)?;

        let codec = match endpoint.secure {
            true => self.codec.as_ref().map(|factory| factory()),
            false => None,
        };
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "connected");
        Connection::new(Stream::Tcp(stream), codec).map_err(fail)
    }

    fn encode(
        &self,
        method: Method,
        target: &Target,
        headers: &[(&str, &str)],
        body: &Body<'_>,
    ) -> Vec<u8> {
        let request_target = match self.proxy {
            Some(_) => target.url.as_str().to_string(),
            None => target.origin_form(),
        };

        let mut head = format!("{} {} HTTP/1.1\r\n", method.as_str(), request_target);
        let overridden = |name: &str| headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
        if !overridden("Host") {
            head.push_str(&format!("Host: {}\r\n", target.host_header()));
        }
        if method == Method::Get {
            head.push_str("Accept-Encoding: \r\n");
        }
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(credentials) = &self.credentials {
            head.push_str(&format!("Authorization: Basic {credentials}\r\n"));
        }
        head.push_str(match self.keepalive {
            true => "Connection: keep-alive\r\n",
            false => "Connection: close\r\n",
        });

        let payload = match body {
            Body::None => None,
            Body::Sized(content_type, data) => {
                head.push_str(&format!(
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                    data.len()
                ));
                Some(data.to_vec())
            }
            Body::Chunked(content_type, data) => {
                head.push_str(&format!(
                    "Content-Type: {content_type}\r\nTransfer-Encoding: chunked\r\n"
                ));
                Some(chunked::encode(data, UPLOAD_CHUNK))
            }
        };
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(payload) = payload {
            out.extend_from_slice(&payload);
        }
        out
    }

    fn exchange(&self, conn: &mut Connection, request: &[u8]) -> Result<Reply, Attempt> {
        conn.write_all(request)
            .and_then(|_| conn.flush())
            .map_err(|err| Attempt::Stale(err.into()))?;

        let mut first = true;
        let (status, keep_version, headers) = loop {
            let (status, http11) = match self.read_status(conn) {
                Ok(status) => status,
                Err(err) if first && is_stale(&err) => return Err(Attempt::Stale(err.into())),
                Err(err) => return Err(Attempt::Failed(err.into())),
            };
            first = false;
            let headers = self.read_headers(conn).map_err(Attempt::Failed)?;
            if status != 100 {
                break (status, http11, headers);
            }
        };

        let mut body = Vec::new();
        let mut reusable = self.keepalive
            && match keep_version {
                true => !headers.has_token("Connection", "close"),
                false => headers.has_token("Connection", "keep-alive"),
            };

        if matches!(status, 204 | 304) {
            // no body
        } else if headers.has_token("Transfer-Encoding", "chunked") {
            let limits = ChunkLimits {
                max_chunk: self.limits.max_chunk_size,
                max_total: usize::MAX,
                line_size: self.limits.line_size,
            };
            chunked::read_chunked(conn, limits, &mut body).map_err(|err| {
                Attempt::Failed(match err {
                    ChunkError::TooLarge { limit, got } => {
                        ClientError::MaxChunksizeExceeded { limit, got }
                    }
                    ChunkError::Io(err) => err.into(),
                    other => ClientError::Protocol(other.to_string()),
                })
            })?;
        } else if let Some(len) = headers.get("Content-Length") {
            let len = slice_to_usize(len.trim().as_bytes()).ok_or_else(|| {
                Attempt::Failed(ClientError::Protocol(format!("bad Content-Length {len:?}")))
            })?;
            conn.read_exact_into(len, &mut body).map_err(|err| {
                Attempt::Failed(match err.kind() {
                    io::ErrorKind::UnexpectedEof => {
                        ClientError::Protocol("connection closed inside response body".into())
                    }
                    _ => err.into(),
                })
            })?;
        } else {
            conn.read_to_end_into(&mut body)
                .map_err(|err| Attempt::Failed(err.into()))?;
            reusable = false;
        }

        Ok(Reply {
            status,
            headers,
            body,
            reusable,
        })
    }

    /// Reads `HTTP/1.x NNN reason`; returns the status and whether the
    /// server speaks 1.1.
    fn read_status(&self, conn: &mut Connection) -> Result<(u16, bool), StatusError> {
        let line = match conn.read_line(self.limits.line_size)? {
            Line::Complete(line) => line,
            Line::TooLong => return Err(StatusError::Protocol("status line too long")),
            Line::Eof => return Err(StatusError::Eof),
        };

        let http11 = match line.get(..9) {
            Some(b"HTTP/1.1 ") => true,
            Some(b"HTTP/1.0 ") => false,
            _ => return Err(StatusError::Protocol("malformed status line")),
        };
        let status = line
            .get(9..12)
            .and_then(slice_to_usize)
            .and_then(|n| u16::try_from(n).ok())
            .filter(|n| (100..1000).contains(n))
            .ok_or(StatusError::Protocol("malformed status code"))?;
        Ok((status, http11))
    }

    fn read_headers(&self, conn: &mut Connection) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::with_capacity(16);
        let mut seen = 0;
        loop {
            let line = match conn.read_line(self.limits.line_size)? {
                Line::Complete(line) => line,
                Line::TooLong => return Err(ClientError::Protocol("header line too long".into())),
                Line::Eof => {
                    return Err(ClientError::Protocol(
                        "connection closed inside response head".into(),
                    ))
                }
            };
            if line.is_empty() {
                return Ok(headers);
            }

            seen += 1;
            if seen > self.limits.header_count {
                continue;
            }
            let Some(colon) = memchr::memchr(b':', &line) else {
                continue;
            };
            let name = String::from_utf8_lossy(&line[..colon]);
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            headers.set(name.trim(), value.trim());
        }
    }
}

enum StatusError {
    Eof,
    Protocol(&'static str),
    Io(io::Error),
}

impl From<io::Error> for StatusError {
    fn from(err: io::Error) -> Self {
        StatusError::Io(err)
    }
}

impl From<StatusError> for ClientError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::Eof => ClientError::Protocol("connection closed before the status line".into()),
            StatusError::Protocol(msg) => ClientError::Protocol(msg.into()),
            StatusError::Io(err) => err.into(),
        }
    }
}

fn is_stale(err: &StatusError) -> bool {
    match err {
        StatusError::Eof => true,
        StatusError::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
        ),
        StatusError::Protocol(_) => false,
    }
}
