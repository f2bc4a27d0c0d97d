//! pool_httpd - Embeddable multi-threaded HTTP/1.x daemon
//!
//! A blocking, thread-per-connection HTTP server for embedding in larger
//! programs, with a matching keepalive-aware client.
//!
//! # Model
//!
//! - **Worker pool** - a bounded set of OS threads; one waits in `accept`
//!   while the rest queue on the accept lock, and a supervisor grows and
//!   shrinks the pool with the load
//! - **Handler chain** - an ordered list of uri patterns and [`Handler`]s;
//!   links can rewrite the request and pass it on, or answer it
//! - **Events** - access, error and lifecycle notifications delivered to
//!   [`EventHandler`](events::EventHandler)s, such as the NCSA
//!   [`AccessLogger`](events::logger::AccessLogger)
//! - **Client** - [`HttpClientSocket`] reuses its connection across
//!   requests to the same host and decodes chunked responses
//!
//! HTTP/1.0 and HTTP/1.1 are served, with keepalive, chunked request
//! bodies and the `GET`, `HEAD` and `POST` methods.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use pool_httpd::{handlers::handler_fn, HttpDaemon, Listener, Outcome, StatusCode};
//!
//! let daemon = HttpDaemon::builder()
//!     .listener(Listener::listen(8080).unwrap())
//!     .handler("*", handler_fn(|req, _ex| {
//!         Ok(Outcome::html(StatusCode::Ok, format!("<h1>{}</h1>", req.path())))
//!     }))
//!     .build()
//!     .unwrap();
//!
//! daemon.start().unwrap();
//! std::thread::park();
//! ```
//! A virtual-hosted file server behind basic auth, with a log:
//! ```no_run
//! use pool_httpd::{
//!     events::logger::{AccessLogger, Rotation},
//!     handlers::{auth::{BasicAuth, ValueAuth}, fileshare::FileShare, vhost::VirtualHost},
//!     HttpDaemon, Listener,
//! };
//!
//! let vhosts = VirtualHost::new()
//!     .host("*", "default")
//!     .host("docs.example", "docs");
//! let logger = AccessLogger::open(
//!     Some("/var/log/httpd/access.log"),
//!     Some("/var/log/httpd/error.log"),
//!     Rotation::default(),
//! )
//! .unwrap();
//!
//! let daemon = HttpDaemon::builder()
//!     .listener(Listener::listen(8080).unwrap())
//!     .handler("*", vhosts)
//!     .handler("/docs/private/*", BasicAuth::new("Docs", ValueAuth::new().user("ann", "secret")))
//!     .handler("*", FileShare::new("/srv/www").unwrap())
//!     .event_handler(logger)
//!     .build()
//!     .unwrap();
//!
//! daemon.start().unwrap();
//! ```
//! Talking to it:
//! ```no_run
//! use pool_httpd::HttpClientSocket;
//!
//! let mut client = HttpClientSocket::new();
//! let body = client.get("http://127.0.0.1:8080/index.html", &[]).unwrap();
//! assert_eq!(client.status(), 200);
//! # let _ = body;
//! ```

pub mod http {
    pub mod chunked;
    pub mod query;
    pub mod request;
    pub(crate) mod response;
    pub mod types;
}
pub mod server {
    pub(crate) mod connection;
    pub mod daemon;
    pub mod listener;
    pub mod transport;
    pub(crate) mod worker;
}
pub mod sync {
    pub mod eventq;
    pub mod lock;
    pub mod pool;
}
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod limits;

pub use crate::{
    client::HttpClientSocket,
    context::{Context, ManualClock, ProcessRegistry, RealClock, SystemClock},
    errors::{ClientError, ConfigError, ErrorCode, ServerError},
    handlers::{Exchange, Handler, HandlerChain, HandlerError, Outcome},
    http::{
        chunked, query,
        request::{Env, Request},
        response::http_date,
        types::{HeaderMap, Method, StatusCode, Version},
    },
    server::{daemon::HttpDaemon, listener::Listener, transport::PeerAddr},
};
