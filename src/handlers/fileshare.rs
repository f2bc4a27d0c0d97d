//! Static files under a root directory.

use super::{Exchange, Handler, HandlerError, Outcome};
use crate::{
    http::{
        query::url_decode,
        request::{Env, Request},
        response::http_date,
        types::{HeaderMap, Method, StatusCode},
    },
};
use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

const ILLEGAL_URI: &str = "<html><body><h1>Illegal URI</h1></body></html>\n";
const NOT_FOUND: &str = "<html><h1>404 Not Found</h1></html>\n";
const EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Takes over files with a given extension inside a [`FileShare`].
pub trait FileTypeHandler: Send + Sync + 'static {
    fn run(
        &self,
        path: &Path,
        req: &mut Request,
        ex: &mut Exchange<'_>,
    ) -> Result<Outcome, HandlerError>;
}

impl<F> FileTypeHandler for F
where
    F: Fn(&Path, &mut Request, &mut Exchange<'_>) -> Result<Outcome, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn run(
        &self,
        path: &Path,
        req: &mut Request,
        ex: &mut Exchange<'_>,
    ) -> Result<Outcome, HandlerError> {
        self(path, req, ex)
    }
}

/// Extension to MIME type table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeDb(HashMap<String, String>);

impl MimeDb {
    pub const SYSTEM_PATH: &'static str = "/etc/mime.types";

    /// The system table when readable and non-empty, else [`builtin`](Self::builtin).
    pub fn load() -> Self {
        match fs::read_to_string(Self::SYSTEM_PATH) {
            Ok(text) => {
                let db = Self::parse(&text);
                if db.0.is_empty() {
                    Self::builtin()
                } else {
                    db
                }
            }
            Err(_) => Self::builtin(),
        }
    }

    /// Parses `mime.types` lines: a type followed by its extensions.
    pub fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        for line in text.lines() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(mime) = words.next() else { continue };
            for ext in words {
                map.insert(ext.to_string(), mime.to_string());
            }
        }
        Self(map)
    }

    pub fn builtin() -> Self {
        #[rustfmt::skip]
        let table = [
            ("html", "text/html"),          ("htm", "text/html"),
            ("js", "application/x-javascript"),
            ("gif", "image/gif"),           ("png", "image/png"),
            ("jpg", "image/jpeg"),          ("jpeg", "image/jpeg"),
            ("css", "text/css"),            ("xml", "application/xml"),
            ("txt", "text/plain"),          ("gz", "application/gzip"),
            ("tar", "application/tar"),     ("rpm", "application/x-rpm"),
            ("cpp", "text/plain"),          ("h", "text/plain"),
            ("c", "text/plain"),
        ];
        Self(
            table
                .into_iter()
                .map(|(e, m)| (e.to_string(), m.to_string()))
                .collect(),
        )
    }

    pub fn lookup(&self, ext: &str) -> Option<&str> {
        self.0.get(ext).map(String::as_str)
    }

    pub fn insert(&mut self, ext: impl Into<String>, mime: impl Into<String>) {
        self.0.insert(ext.into(), mime.into());
    }
}

/// Serves `root + uri` for matching requests.
///
/// Directories are served through their `index.html`. Paths that escape
/// the root, even through symlinks, are refused with `500`.
pub struct FileShare {
    root: PathBuf,
    mime: MimeDb,
    filetypes: HashMap<String, Box<dyn FileTypeHandler>>,
}

impl fmt::Debug for FileShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileShare")
            .field("root", &self.root)
            .field("filetypes", &self.filetypes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FileShare {
    /// Fails when `root` cannot be resolved.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
            mime: MimeDb::load(),
            filetypes: HashMap::new(),
        })
    }

    pub fn with_mime_db(mut self, mime: MimeDb) -> Self {
        self.mime = mime;
        self
    }

    /// Routes files ending in `.{ext}` to `handler`.
    pub fn with_filetype(mut self, ext: impl Into<String>, handler: impl FileTypeHandler) -> Self {
        self.filetypes.insert(ext.into(), Box::new(handler));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn illegal(&self, ex: &Exchange<'_>, text: String) -> Outcome {
        ex.error_event(text);
        Outcome::html(StatusCode::InternalServerError, ILLEGAL_URI)
    }

    fn resolve(&self, uri: &str) -> Result<Option<PathBuf>, String> {
        let decoded = url_decode(uri);
        if decoded.contains("/..") {
            return Err(format!("Illegal URI: {uri}"));
        }

        let joined = self.root.join(decoded.trim_start_matches('/'));
        let real = match joined.canonicalize() {
            Ok(real) => real,
            Err(_) => return Ok(None),
        };
        if !real.starts_with(&self.root) {
            return Err(format!(
                "Illegal URI: {uri} (root {}, resolved {})",
                self.root.display(),
                real.display()
            ));
        }

        if real.is_dir() {
            let index = real.join("index.html");
            return Ok(index.is_file().then_some(index));
        }
        Ok(Some(real))
    }
}

impl Handler for FileShare {
    fn run(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        let uri = req.path().to_string();
        if uri.find("//").is_some_and(|i| i > 0) || uri.contains("/..") {
            return Ok(self.illegal(ex, format!("Illegal URI: {uri}")));
        }

        let path = match self.resolve(&uri) {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(ex.error_page(StatusCode::NotFound, NOT_FOUND)),
            Err(text) => return Ok(self.illegal(ex, text)),
        };

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if let Some(handler) = self.filetypes.get(ext) {
            return handler.run(&path, req, ex);
        }

        let mut file = File::open(&path)?;
        let meta = file.metadata()?;
        let len = meta.len();
        let now = ex.now();

        let mut headers = HeaderMap::with_capacity(4);
        headers.set(
            "Content-Type",
            self.mime.lookup(ext).unwrap_or("application/octet-stream"),
        );
        headers.set("Date", http_date(now));
        if let Ok(modified) = meta.modified() {
            headers.set("Last-Modified", http_date(modified));
        }
        headers.set("Expires", http_date(now + EXPIRES_IN));

        ex.send_head(req, StatusCode::Ok, &headers, len)?;
        let sent = match req.method() {
            Method::Head => 0,
            _ => ex.send_file(&mut file, len)?,
        };

        let env = req.env_mut();
        env.set(Env::SENTBYTES, sent.to_string());
        env.set(Env::FILE, path.display().to_string());
        Ok(Outcome::AlreadySent(StatusCode::Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{tests::Recorder, EventHandlerChain},
        server::daemon::Services,
        tools::*,
        Version,
    };
    use std::time::SystemTime;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<p>docs</p>").unwrap();
        fs::write(dir.path().join("run.page"), "ignored").unwrap();
        dir
    }

    fn share(dir: &tempfile::TempDir) -> FileShare {
        FileShare::new(dir.path()).unwrap().with_mime_db(MimeDb::builtin())
    }

    fn get(uri: &str) -> Request {
        let mut req = Request::new(Method::Get, uri, Version::Http11);
        req.env_mut().set_flag(Env::KEEPALIVE, true);
        req
    }

    #[test]
    fn streams_files_with_dates() {
        let dir = site();
        let services = Services::for_tests();
        let mut req = get("/hello.txt?cache=no");

        let (outcome, wire) = run_handler(&share(&dir), &mut req, &services);
        assert_eq!(outcome.unwrap(), Outcome::AlreadySent(StatusCode::Ok));

        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nDate: "));
        assert!(wire.contains("\r\nLast-Modified: "));
        assert!(wire.contains("\r\nExpires: "));
        assert!(wire.ends_with("Content-Length: 11\r\n\r\nhello world"));
        assert!(!wire.contains("Connection:"));
        assert_eq!(req.env().number(Env::SENTBYTES), Some(11));
        assert!(req.env().get(Env::FILE).unwrap().ends_with("hello.txt"));
    }

    #[test]
    fn expires_one_hour_after_clock() {
        let dir = site();
        let clock = std::sync::Arc::new(crate::ManualClock::new(
            SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777),
        ));
        let services = Services::for_tests().with_context(crate::Context::new(clock));

        let (_, wire) = run_handler(&share(&dir), &mut get("/hello.txt"), &services);
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.contains("Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(wire.contains("Expires: Sun, 06 Nov 1994 09:49:37 GMT\r\n"));
    }

    #[test]
    fn head_and_index() {
        let dir = site();
        let services = Services::for_tests();

        let mut req = Request::new(Method::Head, "/hello.txt", Version::Http10);
        let (_, wire) = run_handler(&share(&dir), &mut req, &services);
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(wire.ends_with("Connection: close\r\nContent-Length: 11\r\n\r\n"));
        assert_eq!(req.env().number(Env::SENTBYTES), Some(0));

        let (_, wire) = run_handler(&share(&dir), &mut get("/docs"), &services);
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.contains("Content-Type: text/html\r\n"));
        assert!(wire.ends_with("<p>docs</p>"));
    }

    #[test]
    fn refuses_escapes() {
        let dir = site();
        let recorder = Recorder::default();
        let mut events = EventHandlerChain::new();
        events.add(recorder.clone());
        let services = Services::for_tests().with_events(events);

        #[rustfmt::skip]
        let cases = [
            "/../etc/passwd",
            "/docs//index.html",
            "/%2e%2e/secret",
        ];

        for uri in cases {
            let (outcome, wire) = run_handler(&share(&dir), &mut get(uri), &services);
            assert_eq!(
                outcome.unwrap(),
                Outcome::html(StatusCode::InternalServerError, ILLEGAL_URI),
                "{uri}"
            );
            assert!(wire.is_empty());
        }
        assert_eq!(recorder.errors().len(), 3);
        assert!(recorder.errors()[0].starts_with("Illegal URI: /../etc/passwd"));
    }

    #[test]
    #[cfg(unix)]
    fn refuses_symlink_out_of_root() {
        let dir = site();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();

        let (outcome, _) = run_handler(&share(&dir), &mut get("/link"), &Services::for_tests());
        assert_eq!(
            outcome.unwrap(),
            Outcome::html(StatusCode::InternalServerError, ILLEGAL_URI)
        );
    }

    #[test]
    fn missing_files() {
        let dir = site();
        let services = Services::for_tests();
        let (outcome, _) = run_handler(&share(&dir), &mut get("/nope.txt"), &services);
        assert_eq!(outcome.unwrap(), Outcome::html(StatusCode::NotFound, NOT_FOUND));

        let page = dir.path().join("404.html");
        fs::write(&page, "<h1>custom</h1>").unwrap();
        services.set_default_document(StatusCode::NotFound, &page);
        let (outcome, _) = run_handler(&share(&dir), &mut get("/nope.txt"), &services);
        assert_eq!(outcome.unwrap(), Outcome::html(StatusCode::NotFound, "<h1>custom</h1>"));
    }

    #[test]
    fn filetype_handlers_take_over() {
        struct Named;

        impl FileTypeHandler for Named {
            fn run(
                &self,
                path: &Path,
                _: &mut Request,
                _: &mut Exchange<'_>,
            ) -> Result<Outcome, HandlerError> {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                Ok(Outcome::html(StatusCode::Ok, name))
            }
        }

        let dir = site();
        let share = share(&dir).with_filetype("page", Named);

        let (outcome, _) = run_handler(&share, &mut get("/run.page"), &Services::for_tests());
        assert_eq!(outcome.unwrap(), Outcome::html(StatusCode::Ok, "run.page"));
    }

    #[test]
    fn mime_types_file() {
        let db = MimeDb::parse("# comment\ntext/html html htm\napplication/json json\nbare/type\n");
        assert_eq!(db.lookup("htm"), Some("text/html"));
        assert_eq!(db.lookup("json"), Some("application/json"));
        assert_eq!(db.lookup("type"), None);
        assert_eq!(MimeDb::builtin().lookup("jpeg"), Some("image/jpeg"));
    }
}
