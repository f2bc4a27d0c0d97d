use crate::{
    errors::ErrorKind,
    events::{AccessRecord, Event, EventClass},
    handlers::{Dispatch, Exchange},
    http::{
        request::{Env, Parser, Request},
        response::Response,
        types::{HeaderMap, Method, StatusCode},
    },
    server::{daemon::Shared, transport::Connection},
};

const NOT_FOUND: &str = "<html><h1>404 Not Found</h1></html>\n";
const INTERNAL_ERROR: &str = "<html><h1>500 Internal Server Error</h1></html>\n";

/// One accepted connection, served request by request on the calling thread.
pub(crate) struct HttpConnection<'a> {
    shared: &'a Shared,
    conn: Connection,
    parser: Parser,
    response: Response,
    served: usize,
}

impl<'a> HttpConnection<'a> {
    #[inline]
    pub(crate) fn new(shared: &'a Shared, conn: Connection) -> Self {
        Self {
            shared,
            conn,
            parser: Parser::new(&shared.req_limits),
            response: Response::new(&shared.services.resp_limits),
            served: 0,
        }
    }

    /// Serves until the peer leaves, keepalive ends or an error closes the
    /// connection. Returns the number of requests served.
    pub(crate) fn run(mut self) -> usize {
        let limits = &self.shared.conn_limits;
        if let Err(err) = self.conn.set_timeouts(
            Some(limits.socket_read_timeout),
            Some(limits.socket_write_timeout),
        ) {
            tracing::debug!(%err, "could not set socket timeouts");
        }

        loop {
            let req = match self.parser.read(&mut self.conn) {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(err) => {
                    self.reject(err);
                    break;
                }
            };

            self.served += 1;
            if !self.serve(req) || self.served >= limits.max_requests_per_connection {
                break;
            }
        }

        self.conn.close();
        self.served
    }

    /// Answers a request the parser refused; transport failures just close.
    fn reject(&mut self, err: ErrorKind) {
        if err.is_transport() {
            tracing::debug!(peer = %self.conn.peer().ip, %err, "connection dropped");
            return;
        }

        tracing::debug!(peer = %self.conn.peer().ip, status = err.status(), %err, "bad request");
        self.error_event(&err.to_string());
        if let Some(raw) = err.as_http(self.parser.version()) {
            let _ = self.conn.write_all(raw);
        }
    }

    /// Runs `req` through the chain and writes the response. Returns
    /// whether the connection stays open.
    fn serve(&mut self, mut req: Request) -> bool {
        let shared = self.shared;
        let services = &shared.services;

        let mut keep_alive = req.is_keep_alive();
        if self.served >= shared.conn_limits.max_requests_per_connection {
            keep_alive = false;
        } else if keep_alive {
            let load = shared.load.get();
            let workers = shared.pool.len();
            if shared.limits.keepalive_trigger * load > workers {
                tracing::debug!(load, workers, "keepalive refused under load");
                keep_alive = false;
            }
        }
        seed_env(&mut req, keep_alive);
        let uri = req.uri().to_string();

        let dispatch = {
            let mut ex = Exchange::new(&mut self.conn, services, &mut self.response);
            shared.chain.dispatch(&mut req, &mut ex)
        };

        let (status, bytes, keep_alive) = match dispatch {
            Dispatch::Final(status, body, headers) => {
                let keep_alive = req.env().flag(Env::KEEPALIVE);
                self.write(&req, status, &headers, &body, keep_alive)
            }
            Dispatch::AlreadySent(status) => (
                status,
                req.env().number(Env::SENTBYTES).unwrap_or(0),
                req.env().flag(Env::KEEPALIVE),
            ),
            Dispatch::Unhandled => {
                let body = services
                    .default_document(StatusCode::NotFound)
                    .unwrap_or_else(|| NOT_FOUND.into());
                self.write(&req, StatusCode::NotFound, &html(), &body, false)
            }
            Dispatch::Failed(text) => {
                tracing::warn!(%uri, "{text}");
                self.error_event(&text);
                let body = INTERNAL_ERROR.as_bytes();
                self.write(&req, StatusCode::InternalServerError, &html(), body, false)
            }
        };

        self.access_event(&req, uri, status, bytes);
        keep_alive
    }

    /// Writes a complete response; a failed write ends keepalive.
    fn write(
        &mut self,
        req: &Request,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        keep_alive: bool,
    ) -> (StatusCode, u64, bool) {
        self.response.reset(
            &self.shared.services.resp_limits,
            req.version(),
            keep_alive,
            req.method() == Method::Head,
        );
        self.response.status(status).headers(headers).body(body);
        let sent = match self.response.sends_body() {
            true => body.len() as u64,
            false => 0,
        };

        match self.conn.write_all(self.response.buffer()) {
            Ok(()) => (status, sent, keep_alive),
            Err(err) => {
                tracing::debug!(peer = %self.conn.peer().ip, %err, "response write failed");
                (status, 0, false)
            }
        }
    }

    fn error_event(&self, text: &str) {
        let services = &self.shared.services;
        services.events.emit_with(EventClass::ERROR, || {
            Event::error(services.context.now(), self.conn.peer().ip.clone(), text)
        });
    }

    fn access_event(&self, req: &Request, uri: String, status: StatusCode, bytes: u64) {
        let services = &self.shared.services;
        services.events.emit_with(EventClass::ACCESS, || {
            let env = req.env();
            let get = |key| env.get(key).unwrap_or("").to_string();
            Event::access(
                services.context.now(),
                AccessRecord {
                    method: req.method().as_str().to_string(),
                    httpver: req.version().as_str().to_string(),
                    uri,
                    file: get(Env::FILE),
                    ip: get(Env::IP),
                    user: get(Env::USER),
                    referrer: get(Env::REFERRER),
                    useragent: req.header("User-Agent").unwrap_or("").to_string(),
                    status: status.as_u16(),
                    bytes,
                },
            )
        });
    }
}

fn seed_env(req: &mut Request, keep_alive: bool) {
    let method = req.method().as_str();
    let ip = req.peer().ip.clone();
    let referrer = req.header("Referer").unwrap_or("").to_string();

    let env = req.env_mut();
    env.set_flag(Env::KEEPALIVE, keep_alive);
    env.set(Env::METHOD, method);
    env.set(Env::IP, ip);
    env.set(Env::REFERRER, referrer);
}

#[inline]
fn html() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(1);
    headers.set("Content-Type", "text/html");
    headers
}
