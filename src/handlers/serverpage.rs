//! Dynamic pages computed from the request arguments.

use super::{Exchange, Handler, HandlerError, Outcome};
use crate::http::{
    query::Query,
    request::{Env, Request},
    types::{HeaderMap, Method, StatusCode},
};
use std::fmt;

const PROCESSING_ERROR: &str =
    "<html><body><h1>Processing Error</h1>serverpage execution error.</body></html>";

/// Most arguments a page receives; more is an error.
pub const MAX_ARGS: usize = 256;

/// Page body generator.
///
/// `headers` arrives with `Content-Type: text/html` preset. Returning `None`
/// reports a failure and the client gets `500`.
pub trait Page: Send + Sync + 'static {
    fn execute(
        &self,
        env: &mut Env,
        args: &[(String, String)],
        out: &mut Vec<u8>,
        headers: &mut HeaderMap,
    ) -> Option<StatusCode>;
}

impl<F> Page for F
where
    F: Fn(&mut Env, &[(String, String)], &mut Vec<u8>, &mut HeaderMap) -> Option<StatusCode>
        + Send
        + Sync
        + 'static,
{
    #[inline]
    fn execute(
        &self,
        env: &mut Env,
        args: &[(String, String)],
        out: &mut Vec<u8>,
        headers: &mut HeaderMap,
    ) -> Option<StatusCode> {
        self(env, args, out, headers)
    }
}

/// Closure to [`Page`] with inferred argument types.
#[inline(always)]
pub fn page_fn<F>(f: F) -> F
where
    F: Fn(&mut Env, &[(String, String)], &mut Vec<u8>, &mut HeaderMap) -> Option<StatusCode>
        + Send
        + Sync
        + 'static,
{
    f
}

/// Link that runs a [`Page`].
///
/// Arguments come from the query string of a GET, or from the body of a
/// POST sent as `application/x-www-form-urlencoded`.
///
/// ```
/// use pool_httpd::{handlers::serverpage::{page_fn, ServerPage}, StatusCode};
///
/// let hello = ServerPage::new(page_fn(|_env, args, out, _headers| {
///     let name = args.iter().find(|(k, _)| k == "name").map_or("world", |(_, v)| v);
///     out.extend_from_slice(format!("<p>hello {name}</p>").as_bytes());
///     Some(StatusCode::Ok)
/// }));
/// # let _ = hello;
/// ```
pub struct ServerPage {
    page: Box<dyn Page>,
}

impl fmt::Debug for ServerPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPage").finish_non_exhaustive()
    }
}

impl ServerPage {
    pub fn new(page: impl Page) -> Self {
        Self {
            page: Box::new(page),
        }
    }
}

/// Decoded arguments of `req`.
pub fn request_args(req: &Request) -> Result<Vec<(String, String)>, HandlerError> {
    let args = match req.method() {
        Method::Get | Method::Head => Query::parse(req.query().unwrap_or(""), MAX_ARGS)?,
        Method::Post => {
            let form = req
                .header("Content-Type")
                .and_then(|ct| ct.split(';').next())
                .is_some_and(|ct| ct.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"));
            match form {
                true => Query::parse(&String::from_utf8_lossy(req.body()), MAX_ARGS)?,
                false => Vec::new(),
            }
        }
    };
    Ok(args)
}

impl Handler for ServerPage {
    fn run(&self, req: &mut Request, _ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        let args = request_args(req)?;

        let mut out = Vec::new();
        let mut headers = HeaderMap::with_capacity(2);
        headers.set("Content-Type", "text/html");

        match self.page.execute(req.env_mut(), &args, &mut out, &mut headers) {
            Some(status) => Ok(Outcome::Final(status, out, headers)),
            None => Ok(Outcome::html(StatusCode::InternalServerError, PROCESSING_ERROR)),
        }
    }
}
