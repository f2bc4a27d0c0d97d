//! Process-wide services handed to the daemon explicitly.
//!
//! The daemon never reads the wall clock or names threads on its own; both
//! go through a [`Context`] so tests can pin time and observe which worker
//! threads are alive.

use crossbeam::sync::ShardedLock;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, SystemTime},
};

/// Source of wall-clock time.
pub trait SystemClock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl SystemClock for RealClock {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, at: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl SystemClock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of named threads started by the daemon.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    next_id: AtomicUsize,
    live: ShardedLock<Vec<String>>,
}

impl ProcessRegistry {
    /// Reserves a fresh name of the form `{prefix}-{n}`.
    pub fn thread_name(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    pub fn register(&self, name: &str) {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    pub fn unregister(&self, name: &str) {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = live.iter().position(|n| n == name) {
            live.remove(pos);
        }
    }

    /// Names of registered threads, oldest first.
    pub fn live_threads(&self) -> Vec<String> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Bundle of the services the daemon depends on.
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn SystemClock>,
    pub registry: Arc<ProcessRegistry>,
}

impl Context {
    pub fn new(clock: Arc<dyn SystemClock>) -> Self {
        Self {
            clock,
            registry: Arc::new(ProcessRegistry::default()),
        }
    }

    #[inline]
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Arc::new(RealClock))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("now", &self.clock.now())
            .field("registry", &self.registry)
            .finish()
    }
}
