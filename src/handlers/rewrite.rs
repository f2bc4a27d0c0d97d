use super::{glob_captures, Exchange, Handler, HandlerError, Outcome};
use crate::http::request::Request;

/// Rewrites uris matching a glob into a template.
///
/// Each `*` in `from` captures what it matched; `$1` to `$9` in `to` are
/// replaced by those captures. The query string is kept.
///
/// ```
/// use pool_httpd::handlers::rewrite::Rewrite;
///
/// let r = Rewrite::new("/old/*", "/new/$1");
/// assert_eq!(r.apply("/old/a/b.txt").as_deref(), Some("/new/a/b.txt"));
/// assert_eq!(r.apply("/other"), None);
/// ```
#[derive(Debug, Clone)]
pub struct Rewrite {
    from: String,
    to: String,
}

impl Rewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Pattern to register the link with.
    pub fn pattern(&self) -> &str {
        &self.from
    }

    /// The rewritten path, if `path` matches.
    pub fn apply(&self, path: &str) -> Option<String> {
        let caps = glob_captures(&self.from, path)?;
        let mut out = String::with_capacity(self.to.len() + path.len());

        let mut chars = self.to.chars().peekable();
        while let Some(c) = chars.next() {
            let index = match (c, chars.peek()) {
                ('$', Some(d @ '1'..='9')) => *d as usize - '1' as usize,
                _ => {
                    out.push(c);
                    continue;
                }
            };
            chars.next();
            out.push_str(caps.get(index).copied().unwrap_or(""));
        }
        Some(out)
    }
}

impl Handler for Rewrite {
    fn run(&self, req: &mut Request, _ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        if let Some(path) = self.apply(req.path()) {
            let uri = match req.query() {
                Some(query) => format!("{path}?{query}"),
                None => path,
            };
            tracing::trace!(from = %req.uri(), to = %uri, "rewrite");
            req.set_uri(uri);
        }
        Ok(Outcome::Continue)
    }
}
