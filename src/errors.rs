use crate::http::types::Version;
use std::{fmt, io, path::PathBuf};

/// Errors the request parser can hit before a handler ever sees the request.
///
/// Every variant that maps to a status code has a canned response in
/// [`ErrorKind::as_http`]; transport failures (`Timeout`, `Closed`, `Io`) have
/// none and simply end the connection.
#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum ErrorKind {
    #[error("Malformed request line")]
    BadRequest,
    #[error("Request line too long")]
    UriTooLong,
    #[error("Header line too long")]
    HeaderTooLarge,
    #[error("Entity too large (content-size={0})")]
    BodyTooLarge(usize),
    #[error("Chunk too large (limit={limit}, chunk-size={got})")]
    ChunkSizeExceeded { limit: usize, got: usize },
    #[error("GET request with body data")]
    BodyWithGet,
    #[error("Unknown method {0}")]
    UnsupportedMethod(String),
    #[error("Unsupported protocol version")]
    UnsupportedVersion,
    #[error("Invalid Content-Length")]
    InvalidContentLength,
    #[error("Invalid chunked encoding")]
    InvalidChunk,

    #[error("Read timed out")]
    Timeout,
    #[error("Connection closed mid-request")]
    Closed,
    #[error("{0}")]
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:literal, $len:literal => $body:literal; )*) => {
        /// Canned close-delimited response for a parser error, written in the
        /// request's protocol version.
        pub(crate) fn as_http(&self, version: Version) -> Option<&'static [u8]> {
            let bytes = match (self, version) {
                $(
                    (Self::$name { .. }, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status_code, "\r\n",
                        "Connection: close\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $len, "\r\n",
                        "\r\n",
                        $body
                    ),
                    (Self::$name { .. }, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status_code, "\r\n",
                        "Connection: close\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $len, "\r\n",
                        "\r\n",
                        $body
                    ),
                )*
                _ => return None,
            };
            Some(bytes.as_bytes())
        }

        /// Status code the canned response carries.
        pub(crate) const fn status(&self) -> Option<u16> {
            match self {
                $( Self::$name { .. } => Some(status_number($status_code)), )*
                _ => None,
            }
        }
    };
}

impl ErrorKind {
    http_errors! {
        BadRequest: "400 Bad Request", "38"
            => "<html><h1>400 Bad Request</h1></html>\n";
        UriTooLong: "414 URI Too Long", "39"
            => "<html><h1>414 URI Too Long</h1></html>\n";
        HeaderTooLarge: "431 Request Header Fields Too Large", "58"
            => "<html><h1>431 Request Header Fields Too Large</h1></html>\n";
        BodyTooLarge: "413 Request Entity Too Large", "49"
            => "<html><h1>POST object size too large</h1></html>\n";
        ChunkSizeExceeded: "413 Request Entity Too Large", "43"
            => "<html><h1>Chunk size too large</h1></html>\n";
        BodyWithGet: "400 Bad Request", "61"
            => "<html><h1>GET request with POST body not allowed</h1></html>\n";
        UnsupportedMethod: "501 Not Implemented", "42"
            => "<html><h1>501 Not Implemented</h1></html>\n";
        UnsupportedVersion: "505 HTTP Version Not Supported", "53"
            => "<html><h1>505 HTTP Version Not Supported</h1></html>\n";
        InvalidContentLength: "400 Bad Request", "38"
            => "<html><h1>400 Bad Request</h1></html>\n";
        InvalidChunk: "400 Bad Request", "38"
            => "<html><h1>400 Bad Request</h1></html>\n";
    }

    /// Whether the error only means the peer went away or stalled.
    #[inline]
    pub(crate) const fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout | Self::Closed | Self::Io(_))
    }
}

const fn status_number(line: &str) -> u16 {
    let b = line.as_bytes();
    (b[0] - b'0') as u16 * 100 + (b[1] - b'0') as u16 * 10 + (b[2] - b'0') as u16
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::Closed,
            _ => ErrorKind::Io(IoError(err)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Failures surfaced by the daemon's lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding or listening on the requested address failed.
    #[error("could not create socket on {addr}: {source}")]
    SocketCreate {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// `build` was called before a listener was attached.
    #[error("no listener configured; call `listener` before `build`")]
    NotListening,
    /// The worker bounds allow no valid pool size.
    #[error("thread bounds min {min} / max {max}: min must be at least 1 and not above max")]
    ThreadBounds { min: usize, max: usize },
    #[error("daemon already started")]
    AlreadyStarted,
    /// The OS refused to create a worker or supervisor thread.
    #[error("could not spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of a client failure, kept after the error itself
/// has been returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    ConnectFail,
    Timeout,
    MaxChunksizeExceeded,
    Protocol,
    Io,
}

/// Failures of [`HttpClientSocket`](crate::HttpClientSocket) requests.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("could not connect to {host}:{port}: {source}")]
    ConnectFail {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("chunk of {got} bytes exceeds the {limit} byte limit")]
    MaxChunksizeExceeded { limit: usize, got: usize },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(io::Error),
}

impl ClientError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::ConnectFail { .. } => ErrorCode::ConnectFail,
            Self::Timeout => ErrorCode::Timeout,
            Self::MaxChunksizeExceeded { .. } => ErrorCode::MaxChunksizeExceeded,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Io(_) => ErrorCode::Io,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
            _ => ClientError::Io(err),
        }
    }
}

/// Failures loading a [`DaemonConfig`](crate::config::DaemonConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}
