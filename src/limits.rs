//! Daemon limits and timeouts
//!
//! Every knob has a default that matches a small embedded deployment: a
//! handful of worker threads, generous socket timeouts and a one megabyte
//! POST ceiling. Override only the fields you need with struct update syntax.
//!
//! # Examples
//!
//! ```no_run
//! use pool_httpd::{handlers::handler_fn, HttpDaemon, Listener, Outcome, StatusCode};
//! use pool_httpd::limits::{ConnLimits, DaemonLimits, ReqLimits};
//! use std::time::Duration;
//!
//! let daemon = HttpDaemon::builder()
//!     .listener(Listener::listen(8080).unwrap())
//!     .handler("*", handler_fn(|_, _| Ok(Outcome::html(StatusCode::Ok, "<html>up</html>"))))
//!     .daemon_limits(DaemonLimits {
//!         min_threads: 4,
//!         max_threads: 16,
//!         ..DaemonLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         socket_read_timeout: Duration::from_secs(5),
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         max_post_size: 16 * 1024 * 1024,
//!         ..ReqLimits::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! daemon.start().unwrap();
//! ```

use std::time::Duration;

/// Worker pool sizing and supervisor cadence.
///
/// # Worker lifecycle
/// ```text
///  [------------]  lock acquired   [------------]  connection   [-----------]
///  [ wait lock  ] ===============> [ try accept ] ============> [ serve req ]
///  [------------]                  [------------]               [-----------]
///        /\   timeout: check queue       || timeout                   ||
///        \\==============================//<===========================//
/// ```
///
/// Only one worker waits in `accept` at a time; the others queue on the
/// accept lock. The supervisor wakes every `supervise_interval`, grows the
/// pool while every worker is busy and retires one worker at a time once
/// the pool has been idle for long enough.
#[derive(Debug, Clone)]
pub struct DaemonLimits {
    /// Workers started by [`HttpDaemon::start`](crate::HttpDaemon::start) (default: `2`).
    ///
    /// The pool never shrinks below this.
    pub min_threads: usize,
    /// Hard upper bound on the pool (default: `4`).
    pub max_threads: usize,

    /// How long a worker sits in `accept` (and waits for the accept lock)
    /// before checking its queue for a `die` command (default: `2 seconds`).
    ///
    /// This bounds how quickly [`shutdown`](crate::HttpDaemon::shutdown)
    /// completes.
    pub accept_timeout: Duration,
    /// How long a worker queues for the accept lock before re-checking its
    /// queue (default: `5 seconds`).
    pub lock_timeout: Duration,
    /// Supervisor wake-up period (default: `5 seconds`).
    pub supervise_interval: Duration,
    /// Supervisor rounds without retiring a worker after the pool changed
    /// size (default: `5`).
    pub min_rounds: usize,
    /// Idle workers beyond `load` before the supervisor retires one (default: `2`).
    pub min_overhead: usize,
    /// Keepalive is refused once `keepalive_trigger * load > workers` (default: `2`).
    pub keepalive_trigger: usize,
    /// Upper bound `shutdown` waits for workers to drain (default: `30 seconds`).
    pub shutdown_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for DaemonLimits {
    fn default() -> Self {
        Self {
            min_threads: 2,
            max_threads: 4,
            accept_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(5),
            supervise_interval: Duration::from_secs(5),
            min_rounds: 5,
            min_overhead: 2,
            keepalive_trigger: 2,
            shutdown_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Per-connection timeouts and lifetime.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum wait for the next byte from the peer (default: `30 seconds`).
    ///
    /// An idle keepalive connection is closed when this expires.
    pub socket_read_timeout: Duration,
    /// Maximum duration of a single socket write (default: `30 seconds`).
    pub socket_write_timeout: Duration,
    /// Requests served on one connection before it is closed (default: `1000`).
    pub max_requests_per_connection: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(30),
            max_requests_per_connection: 1000,

            _priv: (),
        }
    }
}

/// Request admission limits.
///
/// Requests that break these are answered with a canned error page and the
/// connection is closed:
///
/// | Violation | Status |
/// |-----------|--------|
/// | `Content-Length` above `max_post_size` | `413` |
/// | chunk above `max_chunk_size` | `413` |
/// | request line above `line_size` | `414` |
/// | header line above `line_size` | `431` |
///
/// Headers beyond `header_count` are read and dropped.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Largest accepted POST body in bytes (default: `1 MiB`).
    pub max_post_size: usize,
    /// Largest single chunk of a chunked body (default: `512 KiB`).
    pub max_chunk_size: usize,
    /// Headers kept per request (default: `48`).
    pub header_count: usize,
    /// Longest request or header line in bytes (default: `8 KiB`).
    pub line_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_post_size: 1024 * 1024,
            max_chunk_size: 512 * 1024,
            header_count: 48,
            line_size: 8 * 1024,

            _priv: (),
        }
    }
}

/// Response buffer management.
///
/// ```rust
/// # use pool_httpd::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<()> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity for response heads and small bodies (default: `1024 B`)
    pub default_capacity: usize,
    /// Capacity above which the buffer is reallocated between requests (default: `64 KiB`)
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 64 * 1024,

            _priv: (),
        }
    }
}

/// Limits applied by [`HttpClientSocket`](crate::HttpClientSocket) when reading responses.
#[derive(Debug, Clone)]
pub struct ClientLimits {
    /// Largest chunk accepted in a chunked response (default: `512 KiB`).
    pub max_chunk_size: usize,
    /// Response headers kept (default: `48`).
    pub header_count: usize,
    /// Longest status or header line (default: `8 KiB`).
    pub line_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            max_chunk_size: 512 * 1024,
            header_count: 48,
            line_size: 8 * 1024,

            _priv: (),
        }
    }
}
