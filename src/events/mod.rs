//! Access, error and lifecycle notifications.
//!
//! The daemon builds an [`Event`] only when some registered handler wants its
//! [`EventClass`], then hands it to every such handler in registration
//! order.

use std::{fmt, ops, time::SystemTime};

pub mod logger;

/// Set of event classes, used as a subscription mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventClass(u8);

impl EventClass {
    pub const NONE: Self = Self(0);
    pub const ACCESS: Self = Self(1);
    pub const ERROR: Self = Self(2);
    pub const INFO: Self = Self(4);
    pub const ALL: Self = Self(1 | 2 | 4);

    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline(always)]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for EventClass {
    type Output = Self;

    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for EventClass {
    #[inline(always)]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (class, name) in [
            (Self::ACCESS, "ACCESS"),
            (Self::ERROR, "ERROR"),
            (Self::INFO, "INFO"),
        ] {
            if self.contains(class) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// One served request, as written to an access log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessRecord {
    pub method: String,
    /// `"1.0"` or `"1.1"`.
    pub httpver: String,
    pub uri: String,
    pub file: String,
    pub ip: String,
    pub user: String,
    pub referrer: String,
    pub useragent: String,
    pub status: u16,
    pub bytes: u64,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    ThreadStarted,
    ThreadStopped,
    ConnectionAccepted,
    ConnectionClosed,
}

impl InfoKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadStarted => "threadstarted",
            Self::ThreadStopped => "threadstopped",
            Self::ConnectionAccepted => "connectionaccepted",
            Self::ConnectionClosed => "connectionclosed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRecord {
    pub kind: InfoKind,
    pub thread: String,
    /// Open connections, for the connection events.
    pub load: Option<usize>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Access(AccessRecord),
    Error { ip: String, text: String },
    Info(InfoRecord),
}

/// A timestamped notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub at: SystemTime,
    pub kind: EventKind,
}

impl Event {
    pub fn access(at: SystemTime, record: AccessRecord) -> Self {
        Self {
            at,
            kind: EventKind::Access(record),
        }
    }

    pub fn error(at: SystemTime, ip: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            at,
            kind: EventKind::Error {
                ip: ip.into(),
                text: text.into(),
            },
        }
    }

    pub fn info(at: SystemTime, kind: InfoKind, thread: impl Into<String>) -> Self {
        Self {
            at,
            kind: EventKind::Info(InfoRecord {
                kind,
                thread: thread.into(),
                load: None,
                ip: None,
            }),
        }
    }

    /// Adds the load and peer to a connection event.
    pub fn with_connection(mut self, load: usize, ip: impl Into<String>) -> Self {
        if let EventKind::Info(info) = &mut self.kind {
            info.load = Some(load);
            info.ip = Some(ip.into());
        }
        self
    }

    #[inline]
    pub const fn class(&self) -> EventClass {
        match self.kind {
            EventKind::Access(_) => EventClass::ACCESS,
            EventKind::Error { .. } => EventClass::ERROR,
            EventKind::Info(_) => EventClass::INFO,
        }
    }
}

/// Observer of daemon events.
///
/// Called from worker threads concurrently; implementations synchronize
/// their own state.
pub trait EventHandler: Send + Sync + 'static {
    /// Classes this handler receives (default: all).
    fn mask(&self) -> EventClass {
        EventClass::ALL
    }

    fn handle(&self, event: &Event);
}

/// Ordered, append-only list of [`EventHandler`]s.
#[derive(Default)]
pub struct EventHandlerChain {
    handlers: Vec<Box<dyn EventHandler>>,
    mask: EventClass,
}

impl fmt::Debug for EventHandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerChain")
            .field("handlers", &self.handlers.len())
            .field("mask", &self.mask)
            .finish()
    }
}

impl EventHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: impl EventHandler) {
        self.mask |= handler.mask();
        self.handlers.push(Box::new(handler));
    }

    /// Union of the handlers' masks.
    #[inline(always)]
    pub const fn mask(&self) -> EventClass {
        self.mask
    }

    #[inline(always)]
    pub const fn wants(&self, class: EventClass) -> bool {
        self.mask.intersects(class)
    }

    /// Delivers `event` to every handler whose mask matches it.
    pub fn emit(&self, event: &Event) {
        let class = event.class();
        for handler in &self.handlers {
            if handler.mask().intersects(class) {
                handler.handle(event);
            }
        }
    }

    /// Builds and delivers an event only if someone listens for `class`.
    #[inline]
    pub fn emit_with(&self, class: EventClass, build: impl FnOnce() -> Event) {
        if self.wants(class) {
            self.emit(&build());
        }
    }
}

/// Forwards events to `tracing`.
///
/// Access lines go to the `pool_httpd::access` target at `INFO`, error
/// events at `WARN` and lifecycle events at `DEBUG`.
#[derive(Debug, Clone, Copy)]
pub struct TracingEvents {
    mask: EventClass,
}

impl TracingEvents {
    pub const fn new(mask: EventClass) -> Self {
        Self { mask }
    }
}

impl Default for TracingEvents {
    fn default() -> Self {
        Self::new(EventClass::ALL)
    }
}

impl EventHandler for TracingEvents {
    fn mask(&self) -> EventClass {
        self.mask
    }

    fn handle(&self, event: &Event) {
        match &event.kind {
            EventKind::Access(r) => tracing::info!(
                target: "pool_httpd::access",
                ip = %r.ip,
                user = %r.user,
                method = %r.method,
                uri = %r.uri,
                status = r.status,
                bytes = r.bytes,
                "request"
            ),
            EventKind::Error { ip, text } => tracing::warn!(ip = %ip, "{text}"),
            EventKind::Info(info) => tracing::debug!(
                thread = %info.thread,
                load = ?info.load,
                ip = ?info.ip,
                "{}",
                info.kind.as_str()
            ),
        }
    }
}
