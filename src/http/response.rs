use crate::{
    http::types::{HeaderMap, StatusCode, Version},
    limits::RespLimits,
};
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use write::WriteBuffer;

/// Serializer for one response head (and body, when it is known up front).
///
/// ```text
/// HTTP/[VERSION] SP [STATUS] SP [REASON] CRLF
/// ([NAME] ": " [VALUE] CRLF)*
/// ["Connection: " ("close" | "keep-alive") CRLF]
/// "Content-Length: " [N] CRLF
/// CRLF
/// [BODY]
/// ```
///
/// The `Connection` header is only written when the outcome differs from
/// the version's default, and `Content-Length` is always computed here; both
/// are skipped if passed in through [`header`](Self::header) or
/// [`headers`](Self::headers).
///
/// # Panics
/// Calls out of order (`header` before `status`, anything after a
/// finalizing call) panic in `debug` builds.
#[derive(Debug)]
pub(crate) struct Response {
    buffer: Vec<u8>,
    version: Version,
    keep_alive: bool,
    head_only: bool,
    state: ResponseState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    Clean,
    Headers,
    Complete,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            buffer: Vec::with_capacity(limits.default_capacity),
            version: Version::Http11,
            keep_alive: true,
            head_only: false,
            state: ResponseState::Clean,
        }
    }

    /// Prepares for the next response on the connection.
    #[inline(always)]
    pub(crate) fn reset(
        &mut self,
        limits: &RespLimits,
        version: Version,
        keep_alive: bool,
        head_only: bool,
    ) {
        if self.buffer.capacity() > limits.max_capacity {
            self.buffer = Vec::with_capacity(limits.default_capacity);
        } else {
            self.buffer.clear();
        }

        self.version = version;
        self.keep_alive = keep_alive;
        self.head_only = head_only;
        self.state = ResponseState::Clean;
    }

    #[inline(always)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    #[track_caller]
    pub(crate) fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Clean,
            "Must be first and called only once"
        );

        self.buffer
            .extend_from_slice(status.into_first_line(self.version));
        if matches!(status, StatusCode::NoContent | StatusCode::NotModified) {
            self.head_only = true;
        }
        self.state = ResponseState::Headers;
        self
    }

    #[inline]
    #[track_caller]
    pub(crate) fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before any body method"
        );

        let start = self.buffer.len();
        name.write_to(&mut self.buffer);
        let name = &self.buffer[start..];
        if name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"connection")
        {
            self.buffer.truncate(start);
            return self;
        }

        self.buffer.extend_from_slice(b": ");
        value.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    #[inline]
    #[track_caller]
    pub(crate) fn headers(&mut self, headers: &HeaderMap) -> &mut Self {
        for (name, value) in headers.iter() {
            self.header(name, value);
        }
        self
    }

    /// Finalizes the head with `Content-Length: len`; the caller streams the body.
    #[inline]
    #[track_caller]
    pub(crate) fn head(&mut self, len: u64) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        if let Some(value) = self.connection_header() {
            self.buffer.extend_from_slice(b"Connection: ");
            self.buffer.extend_from_slice(value.as_bytes());
            self.buffer.extend_from_slice(b"\r\n");
        }
        self.buffer.extend_from_slice(b"Content-Length: ");
        len.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b"\r\n\r\n");
        self.state = ResponseState::Complete;
        self
    }

    /// Finalizes the response with `data` as body (dropped for `HEAD`).
    #[inline]
    #[track_caller]
    pub(crate) fn body(&mut self, data: &[u8]) -> &mut Self {
        self.head(data.len() as u64);
        if !self.head_only {
            self.buffer.extend_from_slice(data);
        }
        self
    }

    /// Whether [`body`](Self::body) will actually write the body bytes.
    #[inline(always)]
    pub(crate) const fn sends_body(&self) -> bool {
        !self.head_only
    }

    #[inline(always)]
    const fn connection_header(&self) -> Option<&'static str> {
        match (self.version, self.keep_alive) {
            (Version::Http11, true) => None,
            (Version::Http11, false) => Some("close"),
            (Version::Http10, true) => Some("keep-alive"),
            (Version::Http10, false) => Some("close"),
        }
    }
}

/// Formats a timestamp as an RFC 7231 `HTTP-date`.
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// let t = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
/// assert_eq!(pool_httpd::http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
/// ```
pub fn http_date(at: SystemTime) -> String {
    DateTime::<Utc>::from(at)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub(crate) mod write {
    /// Values that can be written into a response head without a `String`
    /// round-trip.
    pub(crate) trait WriteBuffer {
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            (**self).write_to(buffer)
        }
    }

    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }

    impl WriteBuffer for String {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }

    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }

    macro_rules! impl_write_buffer_number {
        ($($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    write_u64(*self as u64, buffer)
                }
            })*
        };
    }

    impl_write_buffer_number!(u16, u32, u64, usize);

    #[inline]
    fn write_u64(mut n: u64, buffer: &mut Vec<u8>) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        buffer.extend_from_slice(&digits[i..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(resp: &Response) -> &str {
        std::str::from_utf8(resp.buffer()).unwrap()
    }

    fn fresh(version: Version, keep_alive: bool, head_only: bool) -> Response {
        let limits = RespLimits::default();
        let mut resp = Response::new(&limits);
        resp.reset(&limits, version, keep_alive, head_only);
        resp
    }

    #[test]
    fn connection_header() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
            (Version::Http11, false, "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok"),
            (Version::Http10, true,  "HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nok"),
            (Version::Http10, false, "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok"),
        ];

        for (version, keep_alive, expected) in cases {
            let mut resp = fresh(version, keep_alive, false);
            resp.status(StatusCode::Ok).body(b"ok");
            assert_eq!(text(&resp), expected);
        }
    }

    #[test]
    fn managed_headers_are_skipped() {
        let headers: HeaderMap = [
            ("Content-Type", "text/html"),
            ("content-length", "999"),
            ("Connection", "upgrade"),
            ("X-Id", "7"),
        ]
        .into_iter()
        .collect();

        let mut resp = fresh(Version::Http11, true, false);
        resp.status(StatusCode::NotFound)
            .headers(&headers)
            .header("X-Len", 12u64)
            .body(b"<html></html>");

        assert_eq!(
            text(&resp),
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nX-Id: 7\r\nX-Len: 12\r\n\
             Content-Length: 13\r\n\r\n<html></html>"
        );
    }

    #[test]
    fn head_requests_and_bodyless_statuses() {
        let mut resp = fresh(Version::Http11, true, true);
        resp.status(StatusCode::Ok).body(b"hidden");
        assert_eq!(text(&resp), "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n");
        assert!(!resp.sends_body());

        let mut resp = fresh(Version::Http11, true, false);
        resp.status(StatusCode::NotModified).body(b"");
        assert_eq!(text(&resp), "HTTP/1.1 304 Not Modified\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn streamed_head() {
        let mut resp = fresh(Version::Http10, false, false);
        resp.status(StatusCode::Ok).header("Content-Type", "text/plain").head(1_048_576);
        assert_eq!(
            text(&resp),
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\nContent-Length: 1048576\r\n\r\n"
        );
    }

    #[test]
    fn dates() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(0);
        assert_eq!(http_date(t), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Must be called after status() and before any body method")]
    fn header_before_status() {
        let mut resp = fresh(Version::Http11, true, false);
        resp.header("X", "y");
    }
}
