//! The request handler chain.
//!
//! A chain is an ordered list of links, each a URI pattern plus a
//! [`Handler`]. Dispatch walks the links in registration order and runs every
//! handler whose pattern matches the request's *current* uri, so a link that
//! rewrites the uri changes which later links match. The first handler that
//! returns something other than [`Outcome::Continue`] ends the walk.
//!
//! # Patterns
//!
//! - `*` at the end of a pattern matches any remainder, slashes included.
//! - `*` elsewhere matches a run of characters without `/`.
//! - `?` matches one character other than `/`.
//!
//! ```
//! use pool_httpd::handlers::glob_match;
//!
//! assert!(glob_match("/old/*", "/old/a/b.txt"));
//! assert!(glob_match("/*/data", "/x/data"));
//! assert!(!glob_match("/*/data", "/x/y/data"));
//! ```

use crate::{
    events::{Event, EventClass},
    http::{
        request::{Env, Request},
        response::Response,
        types::{HeaderMap, Method, StatusCode},
    },
    server::{
        daemon::Services,
        transport::{Connection, PeerAddr},
    },
};
use std::{
    error::Error,
    fmt,
    fs::File,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    time::SystemTime,
};

pub mod auth;
pub mod fileshare;
pub mod rewrite;
pub mod serverpage;
pub mod vhost;

/// Error a handler may return; the daemon answers `500`.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// What a handler did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not handled here; the next matching link runs.
    Continue,
    /// The daemon writes `status`, `headers` and `body`.
    Final(StatusCode, Vec<u8>, HeaderMap),
    /// The handler wrote the full response itself through the [`Exchange`].
    AlreadySent(StatusCode),
}

impl Outcome {
    /// A `Final` outcome with `Content-Type: text/html`.
    pub fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        let mut headers = HeaderMap::with_capacity(1);
        headers.set("Content-Type", "text/html");
        Outcome::Final(status, body.into(), headers)
    }

    #[inline]
    pub const fn is_continue(&self) -> bool {
        matches!(self, Outcome::Continue)
    }
}

/// A link's behaviour.
///
/// Any `Fn(&mut Request, &mut Exchange<'_>) -> Result<Outcome, HandlerError>`
/// closure is a handler.
pub trait Handler: Send + Sync + 'static {
    fn run(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Exchange<'_>) -> Result<Outcome, HandlerError> + Send + Sync + 'static,
{
    #[inline]
    fn run(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        self(req, ex)
    }
}

/// Turns a closure into a [`Handler`], letting the compiler infer its
/// argument and return types.
///
/// ```
/// use pool_httpd::{handlers::handler_fn, Outcome, StatusCode};
///
/// let hello = handler_fn(|req, _ex| {
///     Ok(Outcome::html(StatusCode::Ok, format!("<p>{}</p>", req.path())))
/// });
/// # let _ = hello;
/// ```
#[inline(always)]
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&mut Request, &mut Exchange<'_>) -> Result<Outcome, HandlerError> + Send + Sync + 'static,
{
    f
}

/// Result of walking the whole chain.
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    Final(StatusCode, Vec<u8>, HeaderMap),
    AlreadySent(StatusCode),
    /// Every matching link returned `Continue`.
    Unhandled,
    /// A handler returned an error or panicked.
    Failed(String),
}

struct Link {
    pattern: String,
    handler: Box<dyn Handler>,
}

/// Ordered, append-only list of handlers.
#[derive(Default)]
pub struct HandlerChain {
    links: Vec<Link>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.links.iter().map(|l| &l.pattern))
            .finish()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a link that runs `handler` for uris matching `pattern`.
    pub fn add(&mut self, pattern: impl Into<String>, handler: impl Handler) {
        self.links.push(Link {
            pattern: pattern.into(),
            handler: Box::new(handler),
        });
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn dispatch(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Dispatch {
        for link in &self.links {
            if !glob_match(&link.pattern, req.path()) {
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| link.handler.run(req, ex)));
            match result {
                Ok(Ok(Outcome::Continue)) => continue,
                Ok(Ok(Outcome::Final(status, body, headers))) => {
                    return Dispatch::Final(status, body, headers)
                }
                Ok(Ok(Outcome::AlreadySent(status))) => return Dispatch::AlreadySent(status),
                Ok(Err(err)) => {
                    return Dispatch::Failed(format!("Handler for {} failed: {err}", link.pattern))
                }
                Err(panic) => {
                    let what = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    tracing::error!(pattern = %link.pattern, panic = %what, "handler panicked");
                    return Dispatch::Failed(format!(
                        "Handler for {} panicked: {what}",
                        link.pattern
                    ));
                }
            }
        }
        Dispatch::Unhandled
    }
}

/// Access to the connection and daemon services while a handler runs.
pub struct Exchange<'a> {
    conn: &'a mut Connection,
    services: &'a Services,
    response: &'a mut Response,
}

impl fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("peer", self.conn.peer())
            .finish_non_exhaustive()
    }
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        conn: &'a mut Connection,
        services: &'a Services,
        response: &'a mut Response,
    ) -> Self {
        Self {
            conn,
            services,
            response,
        }
    }

    #[inline]
    pub fn peer(&self) -> &PeerAddr {
        self.conn.peer()
    }

    /// Current time from the daemon's clock.
    #[inline]
    pub fn now(&self) -> SystemTime {
        self.services.context.now()
    }

    pub fn context(&self) -> &crate::Context {
        &self.services.context
    }

    /// Writes a response head announcing `len` body bytes.
    ///
    /// `Connection` follows `env["keepalive"]` and `Content-Length` is
    /// computed; both are ignored if present in `headers`.
    pub fn send_head(
        &mut self,
        req: &Request,
        status: StatusCode,
        headers: &HeaderMap,
        len: u64,
    ) -> io::Result<()> {
        self.response.reset(
            &self.services.resp_limits,
            req.version(),
            req.env().flag(Env::KEEPALIVE),
            req.method() == Method::Head,
        );
        self.response.status(status).headers(headers).head(len);
        self.conn.write_all(self.response.buffer())
    }

    /// Writes raw body bytes after [`send_head`](Self::send_head).
    pub fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.conn.write_all(data)
    }

    /// Streams up to `len` bytes of `file`; returns the bytes sent.
    pub fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64> {
        self.conn.send_file(file, len)
    }

    /// Whether an event of `class` would reach anyone.
    #[inline]
    pub fn wants(&self, class: EventClass) -> bool {
        self.services.events.wants(class)
    }

    pub fn emit(&self, event: &Event) {
        self.services.events.emit(event);
    }

    /// Reports an ERROR event attributed to this connection's peer.
    pub fn error_event(&self, text: impl fmt::Display) {
        self.services.events.emit_with(EventClass::ERROR, || {
            Event::error(self.now(), self.conn.peer().ip.clone(), text.to_string())
        });
    }

    /// Contents of the default document registered for `status`.
    pub fn default_document(&self, status: StatusCode) -> Option<Vec<u8>> {
        self.services.default_document(status)
    }

    /// `status` with the registered default document as body, or `fallback`.
    pub fn error_page(&self, status: StatusCode, fallback: &str) -> Outcome {
        match self.default_document(status) {
            Some(body) => Outcome::html(status, body),
            None => Outcome::html(status, fallback),
        }
    }
}

/// Whether `pattern` matches all of `text`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob_captures(pattern, text).is_some()
}

/// Matches like [`glob_match`] and returns what each `*` matched.
///
/// ```
/// use pool_httpd::handlers::glob_captures;
///
/// assert_eq!(glob_captures("/u/*/p/*", "/u/ann/p/a/b"), Some(vec!["ann", "a/b"]));
/// assert_eq!(glob_captures("/u/*", "/x"), None);
/// ```
pub fn glob_captures<'t>(pattern: &str, text: &'t str) -> Option<Vec<&'t str>> {
    let mut caps = Vec::new();
    match_from(pattern.as_bytes(), text, 0, &mut caps).then_some(caps)
}

fn match_from<'t>(pat: &[u8], text: &'t str, pos: usize, caps: &mut Vec<&'t str>) -> bool {
    let rest = &text.as_bytes()[pos..];
    match pat.first() {
        None => rest.is_empty(),
        Some(b'*') if pat.len() == 1 => {
            caps.push(&text[pos..]);
            true
        }
        Some(b'*') => {
            // Longest segment-local run first.
            let run = memchr::memchr(b'/', rest).unwrap_or(rest.len());
            for take in (0..=run).rev() {
                let end = pos + take;
                if !text.is_char_boundary(end) {
                    continue;
                }
                let mark = caps.len();
                caps.push(&text[pos..end]);
                if match_from(&pat[1..], text, end, caps) {
                    return true;
                }
                caps.truncate(mark);
            }
            false
        }
        Some(b'?') => match text[pos..].chars().next() {
            Some(c) if c != '/' => match_from(&pat[1..], text, pos + c.len_utf8(), caps),
            _ => false,
        },
        Some(&b) => rest.first() == Some(&b) && match_from(&pat[1..], text, pos + 1, caps),
    }
}
