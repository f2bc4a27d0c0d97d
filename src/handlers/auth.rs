//! HTTP Basic authentication.
//!
//! [`BasicAuth`] gates every uri its link pattern matches. Credentials are
//! checked by an [`Authenticator`]; on success the user name is stored in
//! `env["user"]` for later links and the access log.

use super::{Exchange, Handler, HandlerError, Outcome};
use crate::{
    context::{RealClock, SystemClock},
    http::{
        request::{Env, Request},
        types::{HeaderMap, StatusCode},
    },
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crossbeam::sync::ShardedLock;
use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

const PLEASE_AUTHENTICATE: &str = "<html><body><H1>Please Authenticate</H1></body></html>\n";

/// How often [`PwFileAuth`] looks at its file's modification time.
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Source of truth for user names and passwords.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, user: &str, password: &str) -> bool;

    /// Extra attributes stored for `user`.
    fn user_info(&self, _user: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Compares a presented password with a stored one.
///
/// Stored values may be hashes in any scheme; the verifier owns the scheme.
pub trait PasswordVerifier: Send + Sync + 'static {
    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// Stored passwords are cleartext.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainVerifier;

impl PasswordVerifier for PlainVerifier {
    #[inline]
    fn verify(&self, password: &str, stored: &str) -> bool {
        password == stored
    }
}

impl<F> PasswordVerifier for F
where
    F: Fn(&str, &str) -> bool + Send + Sync + 'static,
{
    fn verify(&self, password: &str, stored: &str) -> bool {
        self(password, stored)
    }
}

/// Link that answers `401` unless the request carries valid credentials.
pub struct BasicAuth {
    realm: String,
    auth: Box<dyn Authenticator>,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

impl BasicAuth {
    pub fn new(realm: impl Into<String>, auth: impl Authenticator) -> Self {
        Self {
            realm: realm.into(),
            auth: Box::new(auth),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn challenge(&self, status: StatusCode, body: Vec<u8>) -> Outcome {
        let mut headers = HeaderMap::with_capacity(2);
        headers.set("WWW-Authenticate", format!("Basic realm=\"{}\"", self.realm));
        headers.set("Content-Type", "text/html");
        Outcome::Final(status, body, headers)
    }
}

/// Splits a `Basic` authorization value into user and password.
///
/// Everything up to the first space is skipped. A decoded value without a
/// colon is all user name.
pub fn parse_credentials(header: &str) -> Option<(String, String)> {
    let token = match header.find(' ') {
        Some(i) => header[i + 1..].trim(),
        None => header.trim(),
    };
    let decoded = STANDARD.decode(token).ok()?;
    let decoded = String::from_utf8_lossy(&decoded);

    Some(match decoded.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (decoded.into_owned(), String::new()),
    })
}

impl Handler for BasicAuth {
    fn run(&self, req: &mut Request, ex: &mut Exchange<'_>) -> Result<Outcome, HandlerError> {
        let Some(header) = req.header("Authorization") else {
            return Ok(self.challenge(StatusCode::Unauthorized, PLEASE_AUTHENTICATE.into()));
        };

        let (user, pass) = parse_credentials(header).unwrap_or_default();
        if !user.is_empty() && self.auth.authenticate(&user, &pass) {
            req.env_mut().set(Env::USER, user);
            return Ok(Outcome::Continue);
        }

        if !user.is_empty() {
            ex.error_event(format_args!(
                "Authentication failed for user {user} in realm \"{}\" ({})",
                self.realm,
                req.uri()
            ));
        }
        let body = ex
            .default_document(StatusCode::Unauthorized)
            .unwrap_or_else(|| PLEASE_AUTHENTICATE.into());
        Ok(self.challenge(StatusCode::Unauthorized, body))
    }
}

/// In-memory user table.
pub struct ValueAuth {
    users: HashMap<String, UserRecord>,
    verifier: Box<dyn PasswordVerifier>,
}

#[derive(Debug, Clone, Default)]
struct UserRecord {
    password: String,
    info: BTreeMap<String, String>,
}

impl Default for ValueAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ValueAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueAuth")
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

impl ValueAuth {
    /// Empty table with cleartext passwords.
    pub fn new() -> Self {
        Self::with_verifier(PlainVerifier)
    }

    pub fn with_verifier(verifier: impl PasswordVerifier) -> Self {
        Self {
            users: HashMap::new(),
            verifier: Box::new(verifier),
        }
    }

    pub fn user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(
            name.into(),
            UserRecord {
                password: password.into(),
                info: BTreeMap::new(),
            },
        );
        self
    }

    /// Attaches an attribute to an existing user; unknown users are ignored.
    pub fn info(mut self, name: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(record) = self.users.get_mut(name) {
            record.info.insert(key.into(), value.into());
        }
        self
    }
}

impl Authenticator for ValueAuth {
    fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|r| self.verifier.verify(password, &r.password))
    }

    fn user_info(&self, user: &str) -> BTreeMap<String, String> {
        self.users
            .get(user)
            .map(|r| r.info.clone())
            .unwrap_or_default()
    }
}

/// Password file of `user:hash[:field...]` lines.
///
/// Extra fields are exposed by [`user_info`](Authenticator::user_info)
/// under the names given to [`fields`](Self::fields). The file is re-read
/// when its modification time advances, looked at no more than once per
/// [`RECHECK_INTERVAL`].
pub struct PwFileAuth {
    path: PathBuf,
    fields: Vec<String>,
    verifier: Box<dyn PasswordVerifier>,
    clock: Arc<dyn SystemClock>,
    table: ShardedLock<PwTable>,
    checked: Mutex<SystemTime>,
}

#[derive(Debug, Default)]
struct PwTable {
    modified: Option<SystemTime>,
    users: HashMap<String, (String, Vec<String>)>,
}

impl fmt::Debug for PwFileAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PwFileAuth")
            .field("path", &self.path)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl PwFileAuth {
    /// Loads `path` with cleartext passwords and the real clock.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let clock: Arc<dyn SystemClock> = Arc::new(RealClock);
        let path = path.as_ref().to_path_buf();
        let table = PwTable::load(&path)?;
        Ok(Self {
            path,
            fields: Vec::new(),
            verifier: Box::new(PlainVerifier),
            checked: Mutex::new(clock.now()),
            clock,
            table: ShardedLock::new(table),
        })
    }

    pub fn with_verifier(mut self, verifier: impl PasswordVerifier) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    /// Names for the fields after the hash, in file order.
    pub fn fields<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.fields = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn SystemClock>) -> Self {
        *self.checked.get_mut().unwrap_or_else(PoisonError::into_inner) = clock.now();
        self.clock = clock;
        self
    }

    fn refresh(&self) {
        let now = self.clock.now();
        {
            let mut checked = self.checked.lock().unwrap_or_else(PoisonError::into_inner);
            match now.duration_since(*checked) {
                Ok(elapsed) if elapsed > RECHECK_INTERVAL => *checked = now,
                _ => return,
            }
        }

        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let current = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .modified;
        if modified.is_none() || modified <= current {
            return;
        }

        match PwTable::load(&self.path) {
            Ok(table) => {
                tracing::info!(path = %self.path.display(), users = table.users.len(), "password file reloaded");
                *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "password file reload failed")
            }
        }
    }
}

impl PwTable {
    fn load(path: &Path) -> io::Result<Self> {
        let modified = fs::metadata(path)?.modified().ok();
        let text = fs::read_to_string(path)?;

        let users = text
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line.split(':');
                let user = parts.next()?.trim();
                let hash = parts.next()?.trim();
                let extra = parts.map(str::to_string).collect();
                Some((user.to_string(), (hash.to_string(), extra)))
            })
            .collect();

        Ok(Self { modified, users })
    }
}

impl Authenticator for PwFileAuth {
    fn authenticate(&self, user: &str, password: &str) -> bool {
        self.refresh();
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .users
            .get(user)
            .is_some_and(|(hash, _)| self.verifier.verify(password, hash))
    }

    fn user_info(&self, user: &str) -> BTreeMap<String, String> {
        self.refresh();
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let Some((_, extra)) = table.users.get(user) else {
            return BTreeMap::new();
        };
        self.fields
            .iter()
            .zip(extra)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
