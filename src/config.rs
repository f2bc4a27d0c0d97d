//! TOML configuration for a stand-alone daemon.
//!
//! ```toml
//! listen = "0.0.0.0:8080"          # or "unix:/run/httpd.sock"
//! system_path = "/srv/system"
//!
//! [threads]
//! min = 2
//! max = 8
//!
//! [timeouts]                        # seconds, fractions allowed
//! accept = 2.0
//! read = 30
//!
//! [default_documents]
//! 404 = "errors/404.html"           # relative to system_path
//!
//! [vhosts]
//! "*" = "default"
//! "docs.example" = "docs"
//!
//! [log]
//! access = "/var/log/httpd/access.log"
//! error = "/var/log/httpd/error.log"
//! rotate_size = 10485760
//!
//! [[share]]
//! path = "*"
//! root = "/srv/www"
//! ```
//!
//! Every section is optional except `listen`. Omitted values keep the
//! defaults of [`limits`](crate::limits).

use crate::{
    errors::{ConfigError, ServerError},
    events::logger::Rotation,
    handlers::vhost::VirtualHost,
    http::types::StatusCode,
    limits::{ConnLimits, DaemonLimits, ReqLimits},
    server::listener::Listener,
};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// `host:port`, or `unix:` followed by a socket path.
    pub listen: String,
    #[serde(default)]
    pub system_path: Option<PathBuf>,
    #[serde(default)]
    pub threads: Threads,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub request: RequestSection,
    /// Status code to document path.
    #[serde(default)]
    pub default_documents: BTreeMap<String, PathBuf>,
    /// Host name to site root; `*` is the fallback site.
    #[serde(default)]
    pub vhosts: BTreeMap<String, String>,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default, rename = "share")]
    pub shares: Vec<Share>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Threads {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub min_rounds: Option<usize>,
    pub min_overhead: Option<usize>,
    pub keepalive_trigger: Option<usize>,
}

/// All values in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    pub accept: Option<f64>,
    pub lock: Option<f64>,
    pub supervise: Option<f64>,
    pub shutdown: Option<f64>,
    pub read: Option<f64>,
    pub write: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSection {
    pub max_post_size: Option<usize>,
    pub max_chunk_size: Option<usize>,
    pub header_count: Option<usize>,
    pub line_size: Option<usize>,
    pub max_per_connection: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    pub access: Option<PathBuf>,
    pub error: Option<PathBuf>,
    /// Bytes; `0` disables rotation.
    pub rotate_size: Option<u64>,
    pub keep: Option<usize>,
}

/// One [`FileShare`](crate::handlers::fileshare::FileShare) mount.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Share {
    /// Chain pattern, e.g. `/files/*`.
    pub path: String,
    pub root: PathBuf,
}

impl FromStr for DaemonConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

impl DaemonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = text.parse::<DaemonConfig>()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".into()));
        }

        let limits = self.daemon_limits();
        if limits.min_threads == 0 {
            return Err(ConfigError::Invalid("threads.min must be at least 1".into()));
        }
        if limits.min_threads > limits.max_threads {
            return Err(ConfigError::Invalid(format!(
                "threads.min ({}) exceeds threads.max ({})",
                limits.min_threads, limits.max_threads
            )));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("accept", t.accept),
            ("lock", t.lock),
            ("supervise", t.supervise),
            ("shutdown", t.shutdown),
            ("read", t.read),
            ("write", t.write),
        ] {
            if let Some(secs) = value {
                if Duration::try_from_secs_f64(secs).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "timeouts.{name} is not a valid duration: {secs}"
                    )));
                }
            }
        }

        self.default_documents().map(drop)
    }

    pub fn daemon_limits(&self) -> DaemonLimits {
        let d = DaemonLimits::default();
        let (th, t) = (&self.threads, &self.timeouts);
        DaemonLimits {
            min_threads: th.min.unwrap_or(d.min_threads),
            // A lone `min` above the default max raises the max with it.
            max_threads: th.max.unwrap_or(d.max_threads.max(th.min.unwrap_or(0))),
            accept_timeout: secs(t.accept, d.accept_timeout),
            lock_timeout: secs(t.lock, d.lock_timeout),
            supervise_interval: secs(t.supervise, d.supervise_interval),
            min_rounds: th.min_rounds.unwrap_or(d.min_rounds),
            min_overhead: th.min_overhead.unwrap_or(d.min_overhead),
            keepalive_trigger: th.keepalive_trigger.unwrap_or(d.keepalive_trigger),
            shutdown_timeout: secs(t.shutdown, d.shutdown_timeout),
            ..d
        }
    }

    pub fn connection_limits(&self) -> ConnLimits {
        let d = ConnLimits::default();
        ConnLimits {
            socket_read_timeout: secs(self.timeouts.read, d.socket_read_timeout),
            socket_write_timeout: secs(self.timeouts.write, d.socket_write_timeout),
            max_requests_per_connection: self
                .request
                .max_per_connection
                .unwrap_or(d.max_requests_per_connection),
            ..d
        }
    }

    pub fn request_limits(&self) -> ReqLimits {
        let d = ReqLimits::default();
        let r = &self.request;
        ReqLimits {
            max_post_size: r.max_post_size.unwrap_or(d.max_post_size),
            max_chunk_size: r.max_chunk_size.unwrap_or(d.max_chunk_size),
            header_count: r.header_count.unwrap_or(d.header_count),
            line_size: r.line_size.unwrap_or(d.line_size),
            ..d
        }
    }

    pub fn rotation(&self) -> Rotation {
        let d = Rotation::default();
        Rotation {
            max_size: self.log.rotate_size.unwrap_or(d.max_size),
            keep: self.log.keep.unwrap_or(d.keep),
        }
    }

    /// `[default_documents]` with the keys checked as status codes.
    pub fn default_documents(&self) -> Result<Vec<(StatusCode, PathBuf)>, ConfigError> {
        self.default_documents
            .iter()
            .map(|(code, path)| {
                code.parse::<u16>()
                    .ok()
                    .and_then(StatusCode::from_u16)
                    .map(|status| (status, path.clone()))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("default_documents: unknown status {code:?}"))
                    })
            })
            .collect()
    }

    /// The `[vhosts]` table as a handler; `None` when it is empty.
    pub fn virtual_host(&self) -> Option<VirtualHost> {
        (!self.vhosts.is_empty()).then(|| self.vhosts.iter().collect())
    }

    /// Binds the `listen` address.
    pub fn listener(&self) -> Result<Listener, ServerError> {
        match self.listen.strip_prefix("unix:") {
            #[cfg(unix)]
            Some(path) => Listener::listen_unix(path),
            #[cfg(not(unix))]
            Some(path) => Err(ServerError::SocketCreate {
                addr: path.to_string(),
                source: std::io::ErrorKind::Unsupported.into(),
            }),
            None => Listener::listen_on(self.listen.as_str()),
        }
    }
}

fn secs(value: Option<f64>, default: Duration) -> Duration {
    value
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}
