use crate::{
    context::Context,
    errors::ServerError,
    events::{Event, EventClass, EventHandler, EventHandlerChain, InfoKind},
    handlers::{Handler, HandlerChain},
    http::types::StatusCode,
    limits::{ConnLimits, DaemonLimits, ReqLimits, RespLimits},
    server::{listener::Listener, worker},
    sync::{
        eventq::{EventQueue, Priority},
        lock::TimedLock,
        pool::{LoadCounter, WorkerPool},
    },
};
use crossbeam::sync::ShardedLock;
use std::{
    collections::HashMap,
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

/// Mailbox message for workers and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Die,
}

/// What handlers can reach through an [`Exchange`](crate::Exchange).
pub(crate) struct Services {
    pub(crate) events: EventHandlerChain,
    pub(crate) context: Context,
    pub(crate) resp_limits: RespLimits,
    system_path: Option<PathBuf>,
    defaults: ShardedLock<HashMap<u16, PathBuf>>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("events", &self.events)
            .field("system_path", &self.system_path)
            .finish_non_exhaustive()
    }
}

impl Services {
    pub(crate) fn new(
        events: EventHandlerChain,
        context: Context,
        resp_limits: RespLimits,
        system_path: Option<PathBuf>,
        defaults: HashMap<u16, PathBuf>,
    ) -> Self {
        Self {
            events,
            context,
            resp_limits,
            system_path,
            defaults: ShardedLock::new(defaults),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(
            EventHandlerChain::new(),
            Context::default(),
            RespLimits::default(),
            None,
            HashMap::new(),
        )
    }

    #[cfg(test)]
    pub(crate) fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_events(mut self, events: EventHandlerChain) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn set_default_document(&self, status: StatusCode, path: &Path) {
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.as_u16(), path.to_path_buf());
    }

    /// Reads the document registered for `status`.
    ///
    /// Relative paths resolve against the system path. A document that
    /// cannot be read counts as unregistered.
    pub(crate) fn default_document(&self, status: StatusCode) -> Option<Vec<u8>> {
        let path = self
            .defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&status.as_u16())?
            .clone();
        let path = match &self.system_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        };

        match fs::read(&path) {
            Ok(body) => Some(body),
            Err(err) => {
                tracing::warn!(path = %path.display(), %status, %err, "default document unreadable");
                None
            }
        }
    }

    /// Emits a lifecycle event if anyone listens for INFO.
    pub(crate) fn info(&self, kind: InfoKind, thread: &str, connection: Option<(usize, &str)>) {
        self.events.emit_with(EventClass::INFO, || {
            let event = Event::info(self.context.now(), kind, thread);
            match connection {
                Some((load, ip)) => event.with_connection(load, ip),
                None => event,
            }
        });
    }
}

/// State shared by the daemon handle and every worker thread.
pub(crate) struct Shared {
    pub(crate) listener: Listener,
    pub(crate) tcplock: TimedLock,
    pub(crate) chain: HandlerChain,
    pub(crate) services: Services,
    pub(crate) load: LoadCounter,
    pub(crate) pool: Arc<WorkerPool<Command>>,

    pub(crate) limits: DaemonLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
}

impl Shared {
    /// Live workers, with exited ones pruned first.
    pub(crate) fn live_workers(&self) -> usize {
        self.pool.gc();
        self.pool.len()
    }
}

/// A multi-threaded HTTP/1.x daemon.
///
/// Requests run through an ordered [`HandlerChain`] on a pool of worker
/// threads. Only one worker waits in `accept` at a time; the rest queue on
/// the accept lock. A supervisor thread grows the pool while every worker is
/// busy and retires idle workers one at a time.
///
/// ```no_run
/// use pool_httpd::{handlers::fileshare::FileShare, HttpDaemon, Listener};
///
/// let daemon = HttpDaemon::builder()
///     .listener(Listener::listen(8080).unwrap())
///     .handler("*", FileShare::new("/srv/www").unwrap())
///     .build()
///     .unwrap();
///
/// daemon.start().unwrap();
/// // ... until told to stop
/// daemon.shutdown();
/// ```
pub struct HttpDaemon {
    shared: Arc<Shared>,
    stop: Arc<EventQueue<Command>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl fmt::Debug for HttpDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDaemon")
            .field("listener", &self.shared.listener)
            .field("chain", &self.shared.chain)
            .field("load", &self.shared.load.get())
            .field("workers", &self.shared.pool.len())
            .finish()
    }
}

impl HttpDaemon {
    #[inline(always)]
    pub fn builder() -> HttpDaemonBuilder {
        HttpDaemonBuilder::default()
    }

    /// Spawns `min_threads` workers and the supervisor.
    ///
    /// # Errors
    /// [`ServerError::AlreadyStarted`] on a second call, and
    /// [`ServerError::Spawn`] when the OS refuses a thread.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }

        for _ in 0..self.shared.limits.min_threads {
            spawn_worker(&self.shared)?;
        }

        let name = "httpdsupervisor".to_string();
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || supervise(&shared, &stop))
            .map_err(|source| ServerError::Spawn { name, source })?;
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            addr = ?self.shared.listener.local_addr(),
            workers = self.shared.limits.min_threads,
            handlers = self.shared.chain.len(),
            "daemon started"
        );
        Ok(())
    }

    /// Connections currently open.
    #[inline]
    pub fn get_load(&self) -> usize {
        self.shared.load.get()
    }

    /// Worker threads currently alive.
    pub fn workers(&self) -> usize {
        self.shared.live_workers()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.local_addr()
    }

    pub fn context(&self) -> &Context {
        &self.shared.services.context
    }

    /// Serves the contents of `path` as the body for `status` where the
    /// daemon or a handler falls back to a canned page.
    pub fn set_default_document(&self, status: StatusCode, path: impl AsRef<Path>) {
        self.shared
            .services
            .set_default_document(status, path.as_ref());
    }

    /// Delivers `event` to every event handler whose mask matches it.
    pub fn event_handle(&self, event: &Event) {
        self.shared.services.events.emit(event);
    }

    /// Stops the supervisor, tells every worker to exit and waits for the
    /// pool to drain, bounded by `shutdown_timeout`.
    ///
    /// Idle workers notice within one `accept_timeout`; a worker in the
    /// middle of a request finishes it first. Returns whether the pool
    /// emptied in time. Later calls return `true` immediately.
    pub fn shutdown(&self) -> bool {
        if !self.started.load(Ordering::Acquire) || self.stopped.swap(true, Ordering::AcqRel) {
            return true;
        }

        self.stop.send(Command::Die, Priority::Urgent);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            if handle.join().is_err() {
                tracing::error!("supervisor panicked");
            }
        }

        self.shared.pool.broadcast(Command::Die, Priority::Urgent);
        let drained = self.shared.pool.drain(self.shared.limits.shutdown_timeout);
        match drained {
            true => tracing::info!("daemon stopped"),
            false => tracing::warn!(
                workers = self.shared.pool.len(),
                "workers still busy after shutdown timeout"
            ),
        }
        drained
    }
}

impl Drop for HttpDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn spawn_worker(shared: &Arc<Shared>) -> Result<(), ServerError> {
    let name = shared.services.context.registry.thread_name("httpdworker");
    let inner = Arc::clone(shared);
    shared
        .pool
        .spawn(name.clone(), move |me| worker::run(&inner, me))
        .map(|_| ())
        .map_err(|source| ServerError::Spawn { name, source })
}

fn supervise(shared: &Arc<Shared>, stop: &EventQueue<Command>) {
    let limits = &shared.limits;
    let mut state = Supervisor::default();

    while stop.wait_event_timeout(limits.supervise_interval).is_none() {
        let load = shared.load.get();
        let workers = shared.live_workers();

        match state.round(load, workers, limits) {
            Action::Grow => {
                if let Err(err) = spawn_worker(shared) {
                    tracing::warn!(%err, "could not grow worker pool");
                } else {
                    tracing::info!(load, workers = workers + 1, "worker pool grown");
                }
            }
            Action::Shrink => match shared.pool.oldest() {
                Some(oldest) => {
                    oldest.queue().send(Command::Die, Priority::Urgent);
                    tracing::info!(load, workers, thread = %oldest.name(), "retiring worker");
                }
                None => tracing::debug!("pool emptied before shrink"),
            },
            Action::Nothing => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Grow,
    Shrink,
    Nothing,
}

/// Pool sizing decisions, one per supervisor round.
#[derive(Debug, Default)]
struct Supervisor {
    /// Rounds left before a shrink is considered.
    hold: usize,
    last_skim: usize,
}

impl Supervisor {
    fn round(&mut self, load: usize, workers: usize, limits: &DaemonLimits) -> Action {
        if load + 1 >= workers && workers < limits.max_threads {
            self.hold = limits.min_rounds;
            return Action::Grow;
        }

        if self.hold > 0 {
            self.hold -= 1;
            return Action::Nothing;
        }

        if workers > limits.min_threads
            && workers.saturating_sub(load) > limits.min_overhead
            && workers != self.last_skim
        {
            self.last_skim = workers;
            self.hold = limits.min_rounds;
            return Action::Shrink;
        }
        Action::Nothing
    }
}

/// Builder for [`HttpDaemon`].
///
/// Handlers and event handlers are fixed once [`build`](Self::build) runs.
#[derive(Default)]
pub struct HttpDaemonBuilder {
    listener: Option<Listener>,
    chain: HandlerChain,
    events: EventHandlerChain,
    defaults: HashMap<u16, PathBuf>,
    system_path: Option<PathBuf>,
    context: Option<Context>,

    daemon_limits: Option<DaemonLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl HttpDaemonBuilder {
    /// Sets the socket the daemon accepts on.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Appends a link to the handler chain.
    ///
    /// Links run in the order they are added, for every uri `pattern`
    /// matches (see [`handlers`](crate::handlers) for the pattern syntax).
    #[inline(always)]
    pub fn handler(mut self, pattern: impl Into<String>, handler: impl Handler) -> Self {
        self.chain.add(pattern, handler);
        self
    }

    /// Appends an observer of access, error and lifecycle events.
    #[inline(always)]
    pub fn event_handler(mut self, handler: impl EventHandler) -> Self {
        self.events.add(handler);
        self
    }

    /// Registers the body served for `status` in place of a canned page.
    #[inline(always)]
    pub fn default_document(mut self, status: StatusCode, path: impl Into<PathBuf>) -> Self {
        self.defaults.insert(status.as_u16(), path.into());
        self
    }

    /// Base directory for relative default document paths.
    #[inline(always)]
    pub fn system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_path = Some(path.into());
        self
    }

    /// Clock and thread registry (default: the real clock and a fresh registry).
    #[inline(always)]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    #[inline(always)]
    pub fn daemon_limits(mut self, limits: DaemonLimits) -> Self {
        self.daemon_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// # Errors
    /// [`ServerError::NotListening`] when no listener was set, and
    /// [`ServerError::ThreadBounds`] when `min_threads` is zero or above
    /// `max_threads`.
    pub fn build(self) -> Result<HttpDaemon, ServerError> {
        let listener = self.listener.ok_or(ServerError::NotListening)?;
        let limits = self.daemon_limits.unwrap_or_default();
        if limits.min_threads == 0 || limits.min_threads > limits.max_threads {
            return Err(ServerError::ThreadBounds {
                min: limits.min_threads,
                max: limits.max_threads,
            });
        }
        let services = Services::new(
            self.events,
            self.context.unwrap_or_default(),
            self.response_limits.unwrap_or_default(),
            self.system_path,
            self.defaults,
        );

        let shared = Shared {
            listener,
            tcplock: TimedLock::new(),
            chain: self.chain,
            services,
            load: LoadCounter::default(),
            pool: WorkerPool::new(),
            limits,
            conn_limits: self.connection_limits.unwrap_or_default(),
            req_limits: self.request_limits.unwrap_or_default(),
        };

        Ok(HttpDaemon {
            shared: Arc::new(shared),
            stop: Arc::new(EventQueue::new()),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{tests::Recorder, EventKind},
        handlers::{
            auth::{BasicAuth, ValueAuth},
            fileshare::FileShare,
            handler_fn,
            rewrite::Rewrite,
        },
        http::request::Env,
        limits::DaemonLimits,
        Outcome,
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpStream,
        time::{Duration, Instant},
    };

    fn quick() -> DaemonLimits {
        DaemonLimits {
            accept_timeout: Duration::from_millis(200),
            lock_timeout: Duration::from_millis(200),
            supervise_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
            ..DaemonLimits::default()
        }
    }

    fn local() -> Listener {
        Listener::listen_on("127.0.0.1:0").unwrap()
    }

    fn connect(daemon: &HttpDaemon) -> TcpStream {
        let stream = TcpStream::connect(daemon.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Reads one response with a `Content-Length` body.
    fn read_response(reader: &mut BufReader<TcpStream>) -> (u16, Vec<(String, String)>, Vec<u8>) {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let status = line[9..12].parse().unwrap();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(": ").unwrap();
            headers.push((name.to_ascii_lowercase(), value.to_string()));
        }

        let len = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map_or(0, |(_, v)| v.parse().unwrap());
        let mut body = vec![0; len];
        reader.read_exact(&mut body).unwrap();
        (status, headers, body)
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn supervisor_rounds() {
        let limits = DaemonLimits {
            min_threads: 2,
            max_threads: 6,
            min_rounds: 2,
            min_overhead: 2,
            ..DaemonLimits::default()
        };
        let mut state = Supervisor::default();

        #[rustfmt::skip]
        let rounds = [
            // load, workers, action
            (1, 2, Action::Grow),
            (0, 3, Action::Nothing),
            (0, 3, Action::Nothing),
            (0, 3, Action::Shrink),
            (0, 2, Action::Nothing),
            (0, 2, Action::Nothing),
            (0, 2, Action::Nothing),
            (5, 6, Action::Nothing),
            (5, 5, Action::Grow),
            (0, 6, Action::Nothing),
            (0, 6, Action::Nothing),
            (0, 6, Action::Shrink),
            (0, 5, Action::Nothing),
            (0, 5, Action::Nothing),
            (0, 5, Action::Shrink),
        ];

        for (i, (load, workers, expected)) in rounds.into_iter().enumerate() {
            assert_eq!(state.round(load, workers, &limits), expected, "round {i}");
        }
    }

    #[test]
    fn build_without_listener() {
        assert!(matches!(
            HttpDaemon::builder().build(),
            Err(ServerError::NotListening)
        ));
    }

    #[test]
    fn build_rejects_thread_bounds() {
        #[rustfmt::skip]
        let cases = [
            // (min, max, accepted)
            (3, 1, false),
            (0, 4, false),
            (0, 0, false),
            (1, 1, true),
            (2, 8, true),
        ];

        for (min, max, accepted) in cases {
            let built = HttpDaemon::builder()
                .listener(local())
                .daemon_limits(DaemonLimits {
                    min_threads: min,
                    max_threads: max,
                    ..quick()
                })
                .build();
            match built {
                Ok(daemon) => {
                    assert!(accepted, "min {min} max {max} should be rejected");
                    daemon.start().unwrap();
                    assert!(daemon.workers() <= max);
                    daemon.shutdown();
                }
                Err(ServerError::ThreadBounds { min: m, max: x }) => {
                    assert!(!accepted, "min {min} max {max} should build");
                    assert_eq!((m, x), (min, max));
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    }

    #[test]
    fn start_twice() {
        let daemon = HttpDaemon::builder()
            .listener(local())
            .daemon_limits(quick())
            .build()
            .unwrap();
        daemon.start().unwrap();
        assert!(matches!(daemon.start(), Err(ServerError::AlreadyStarted)));
        assert!(daemon.shutdown());
    }

    #[test]
    fn keepalive_serves_every_request() {
        let daemon = HttpDaemon::builder()
            .listener(local())
            .handler("*", handler_fn(|req, _| {
                Ok(Outcome::html(StatusCode::Ok, req.uri().to_string()))
            }))
            .daemon_limits(quick())
            .build()
            .unwrap();
        daemon.start().unwrap();

        let stream = connect(&daemon);
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        for i in 0..20 {
            write!(writer, "GET /r/{i} HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let (status, headers, body) = read_response(&mut reader);
            assert_eq!(status, 200);
            assert_eq!(body, format!("/r/{i}").as_bytes());
            assert_eq!(header(&headers, "connection"), None, "request {i}");
        }

        writer.write_all(b"GET /last HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        let (_, headers, _) = read_response(&mut reader);
        assert_eq!(header(&headers, "connection"), Some("close"));
        let mut rest = Vec::new();
        assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);
    }

    #[test]
    fn chain_order_decides() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("new")).unwrap();
        fs::write(dir.path().join("new/file.txt"), "fresh").unwrap();

        let run = |rewrite_first: bool| {
            let rewrite = Rewrite::new("/old/*", "/new/$1");
            let share = FileShare::new(dir.path()).unwrap();
            let builder = HttpDaemon::builder().listener(local()).daemon_limits(quick());
            let builder = match rewrite_first {
                true => builder.handler(rewrite.pattern().to_string(), rewrite).handler("/new/*", share),
                false => builder.handler("/new/*", share).handler(rewrite.pattern().to_string(), rewrite),
            };
            let daemon = builder.build().unwrap();
            daemon.start().unwrap();

            let mut stream = connect(&daemon);
            stream.write_all(b"GET /old/file.txt HTTP/1.0\r\n\r\n").unwrap();
            let (status, _, body) = read_response(&mut BufReader::new(stream));
            (status, body)
        };

        assert_eq!(run(true), (200, b"fresh".to_vec()));
        assert_eq!(run(false), (404, b"<html><h1>404 Not Found</h1></html>\n".to_vec()));
    }

    #[test]
    fn load_follows_open_connections() {
        for k in [1, 8, 64] {
            let daemon = HttpDaemon::builder()
                .listener(local())
                .daemon_limits(DaemonLimits {
                    min_threads: k,
                    max_threads: k + 1,
                    ..quick()
                })
                .build()
                .unwrap();
            assert_eq!(daemon.get_load(), 0);
            daemon.start().unwrap();

            let streams: Vec<_> = (0..k).map(|_| connect(&daemon)).collect();
            wait_for("all accepted", || daemon.get_load() == k);

            drop(streams);
            wait_for("all closed", || daemon.get_load() == 0);
            assert!(daemon.shutdown());
        }
    }

    #[test]
    fn basic_auth_gate() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_page = Arc::clone(&seen);

        let daemon = HttpDaemon::builder()
            .listener(local())
            .handler("/private/*", BasicAuth::new("Staff", ValueAuth::new().user("ann", "pw")))
            .handler("/private/*", handler_fn(move |req, _| {
                let user = req.env().get(Env::USER).unwrap_or("").to_string();
                seen_by_page.lock().unwrap().push(user.clone());
                Ok(Outcome::html(StatusCode::Ok, format!("hello {user}")))
            }))
            .daemon_limits(quick())
            .build()
            .unwrap();
        daemon.start().unwrap();

        let ask = |auth: Option<&str>| {
            let mut stream = connect(&daemon);
            let auth = auth
                .map(|a| format!("Authorization: Basic {}\r\n", STANDARD.encode(a)))
                .unwrap_or_default();
            write!(stream, "GET /private/x HTTP/1.0\r\n{auth}\r\n").unwrap();
            read_response(&mut BufReader::new(stream))
        };

        let (status, headers, _) = ask(None);
        assert_eq!(status, 401);
        assert_eq!(header(&headers, "www-authenticate"), Some("Basic realm=\"Staff\""));

        let (status, _, body) = ask(Some("ann:pw"));
        assert_eq!(status, 200);
        assert_eq!(body, b"hello ann");

        let (status, headers, _) = ask(Some("ann:nope"));
        assert_eq!(status, 401);
        assert!(header(&headers, "www-authenticate").unwrap().contains("Staff"));

        assert_eq!(*seen.lock().unwrap(), vec!["ann".to_string()]);
    }

    #[test]
    fn shutdown_is_prompt() {
        let context = Context::default();
        let recorder = Recorder::only(EventClass::INFO);
        let limits = quick();
        let daemon = HttpDaemon::builder()
            .listener(local())
            .context(context.clone())
            .event_handler(recorder.clone())
            .daemon_limits(limits.clone())
            .build()
            .unwrap();
        daemon.start().unwrap();
        wait_for("workers registered", || context.registry.live_threads().len() == 2);
        assert!(context.registry.live_threads()[0].starts_with("httpdworker-"));

        let started = Instant::now();
        assert!(daemon.shutdown());
        assert!(
            started.elapsed() < limits.accept_timeout * 2 + Duration::from_millis(500),
            "shutdown took {:?}",
            started.elapsed()
        );
        assert_eq!(daemon.get_load(), 0);
        assert_eq!(daemon.workers(), 0);
        assert!(context.registry.live_threads().is_empty());

        let stopped = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(&e.kind, EventKind::Info(i) if i.kind == InfoKind::ThreadStopped))
            .count();
        assert_eq!(stopped, 2);
        assert!(daemon.shutdown());
    }

    #[test]
    fn supervisor_grows_under_load() {
        let daemon = HttpDaemon::builder()
            .listener(local())
            .daemon_limits(DaemonLimits {
                min_threads: 1,
                max_threads: 3,
                ..quick()
            })
            .build()
            .unwrap();
        daemon.start().unwrap();

        let _held = connect(&daemon);
        wait_for("accepted", || daemon.get_load() == 1);
        wait_for("pool grown", || daemon.workers() == 3);
        assert!(daemon.workers() <= 3);
    }

    #[test]
    fn default_documents_resolve_against_system_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("missing.html"), "<p>nothing here</p>").unwrap();

        let daemon = HttpDaemon::builder()
            .listener(local())
            .system_path(dir.path())
            .default_document(StatusCode::NotFound, "missing.html")
            .daemon_limits(quick())
            .build()
            .unwrap();
        daemon.start().unwrap();

        let mut stream = connect(&daemon);
        stream.write_all(b"GET /nope HTTP/1.1\r\n\r\n").unwrap();
        let (status, headers, body) = read_response(&mut BufReader::new(stream));
        assert_eq!(status, 404);
        assert_eq!(body, b"<p>nothing here</p>");
        assert_eq!(header(&headers, "content-type"), Some("text/html"));
        assert_eq!(header(&headers, "connection"), Some("close"));
    }
}
