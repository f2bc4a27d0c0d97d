use super::{Exchange, Handler, HandlerError, Outcome};
use crate::http::{
    request::{Env, Request},
    types::StatusCode,
};
use std::collections::BTreeMap;

/// Prefixes the uri with a per-host directory.
///
/// With `www.foo.com -> foo.com`, `GET /favicon.ico` with `Host:
/// www.foo.com:8080` continues down the chain as `/foo.com/favicon.ico`.
/// Unknown or missing hosts use the `*` entry; without one the request is
/// answered `404`.
///
/// Register it with the pattern `*` ahead of the links it feeds.
#[derive(Debug, Clone, Default)]
pub struct VirtualHost {
    hosts: BTreeMap<String, String>,
}

impl VirtualHost {
    pub const DEFAULT: &'static str = "*";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, name: impl Into<String>, root: impl Into<String>) -> Self {
        self.hosts.insert(name.into(), root.into());
        self
    }

    /// Root for `host` after port stripping and default fallback.
    pub fn resolve<'a>(&'a self, host: &'a str) -> Option<(&'a str, &'a str)> {
        let bare = strip_port(host);
        let name = match self.hosts.contains_key(bare) {
            true if !bare.is_empty() => bare,
            _ => Self::DEFAULT,
        };
        self.hosts.get(name).map(|root| (name, root.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VirtualHost {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            hosts: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl Handler for VirtualHost {
    fn run(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        let host = req.header("Host").unwrap_or("").trim().to_string();

        let Some((name, root)) = self.resolve(&host) else {
            let bare = strip_port(&host);
            ex.error_event(format_args!("Could not resolve request for host '{bare}'"));
            let fallback = format!(
                "<html><body><h1>404 Site Not Found</h1>Either this server is misconfigured \
                 or the DNS entry for {} is not pointing the right way.</body></html>\n",
                escape_html(bare)
            );
            return Ok(ex.error_page(StatusCode::NotFound, &fallback));
        };

        let uri = req.uri();
        let sep = if uri.starts_with('/') { "" } else { "/" };
        let rewritten = format!("/{root}{sep}{uri}");
        req.set_uri(rewritten);
        req.env_mut().set(Env::HOST, name);
        Ok(Outcome::Continue)
    }
}

/// `host[:port]` or `[v6]:port` without the port; a bare IPv6 address is
/// returned whole.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{tests::Recorder, EventHandlerChain},
        http::types::Method,
        server::daemon::Services,
        tools::*,
        Version,
    };

    fn request(host: Option<&str>) -> Request {
        let req = Request::new(Method::Get, "/index.html?x=1", Version::Http11);
        match host {
            Some(host) => req.with_header("Host", host),
            None => req,
        }
    }

    #[test]
    fn resolves_with_default() {
        let vhost: VirtualHost = [("*", "default"), ("known.example", "known"), ("[::1]", "v6")]
            .into_iter()
            .collect();
        let services = Services::for_tests();

        #[rustfmt::skip]
        let cases = [
            (Some("known.example"),      "/known/index.html?x=1",   "known.example"),
            (Some("known.example:8080"), "/known/index.html?x=1",   "known.example"),
            (Some("[::1]:8080"),         "/v6/index.html?x=1",      "[::1]"),
            (Some("[::1]"),              "/v6/index.html?x=1",      "[::1]"),
            (Some("[::2]:8080"),         "/default/index.html?x=1", "*"),
            (Some("unknown.example"),    "/default/index.html?x=1", "*"),
            (Some(""),                   "/default/index.html?x=1", "*"),
            (None,                       "/default/index.html?x=1", "*"),
        ];

        for (host, uri, name) in cases {
            let mut req = request(host);
            let (outcome, wire) = run_handler(&vhost, &mut req, &services);
            assert_eq!(outcome.unwrap(), Outcome::Continue, "{host:?}");
            assert!(wire.is_empty());
            assert_eq!(req.uri(), uri, "{host:?}");
            assert_eq!(req.env().get(Env::HOST), Some(name), "{host:?}");
        }
    }

    #[test]
    fn no_default_is_site_not_found() {
        let recorder = Recorder::default();
        let mut events = EventHandlerChain::new();
        events.add(recorder.clone());
        let services = Services::for_tests().with_events(events);

        let vhost = VirtualHost::new().host("known.example", "known");
        let mut req = request(Some("other.example:81"));
        let (outcome, _) = run_handler(&vhost, &mut req, &services);

        match outcome.unwrap() {
            Outcome::Final(status, body, _) => {
                assert_eq!(status, StatusCode::NotFound);
                let body = String::from_utf8(body).unwrap();
                assert!(body.starts_with("<html><body><h1>404 Site Not Found</h1>"));
                assert!(body.contains("DNS entry for other.example is"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(req.uri(), "/index.html?x=1");
        assert_eq!(
            recorder.errors(),
            vec!["Could not resolve request for host 'other.example'".to_string()]
        );
    }

    #[test]
    fn strips_ports() {
        #[rustfmt::skip]
        let cases = [
            ("example.org",        "example.org"),
            ("example.org:8080",   "example.org"),
            ("[::1]:8080",         "[::1]"),
            ("[::1]",              "[::1]"),
            ("::1",                "::1"),
            ("",                   ""),
        ];

        for (host, bare) in cases {
            assert_eq!(strip_port(host), bare, "{host}");
        }
    }

    #[test]
    fn site_not_found_escapes_host() {
        let services = Services::for_tests();
        let vhost = VirtualHost::new().host("known.example", "known");
        let mut req = request(Some("<script>x</script>"));
        let (outcome, _) = run_handler(&vhost, &mut req, &services);

        match outcome.unwrap() {
            Outcome::Final(_, body, _) => {
                let body = String::from_utf8(body).unwrap();
                assert!(!body.contains("<script>"), "{body}");
                assert!(body.contains("DNS entry for &lt;script&gt;x&lt;/script&gt; is"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
