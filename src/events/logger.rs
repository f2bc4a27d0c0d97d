//! NCSA-style access and error logs with size-based rotation.

use super::{AccessRecord, Event, EventClass, EventHandler, EventKind};
use chrono::{DateTime, Utc};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

/// When a log file is rotated and how many old files are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Rotate once a write would push the file past this size. `0` never rotates.
    pub max_size: u64,
    /// Rotated files kept as `name.1` .. `name.{keep}`.
    pub keep: usize,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

/// Writes access events to one file and error events to another.
///
/// Either file may be omitted; the handler's mask only covers the classes
/// it has a file for. Lines are timestamped with the event's own time.
#[derive(Debug)]
pub struct AccessLogger {
    access: Option<LogFile>,
    error: Option<LogFile>,
}

impl AccessLogger {
    pub fn open(
        access: Option<impl AsRef<Path>>,
        error: Option<impl AsRef<Path>>,
        rotation: Rotation,
    ) -> io::Result<Self> {
        Ok(Self {
            access: access
                .map(|p| LogFile::open(p.as_ref(), rotation))
                .transpose()?,
            error: error
                .map(|p| LogFile::open(p.as_ref(), rotation))
                .transpose()?,
        })
    }
}

impl EventHandler for AccessLogger {
    fn mask(&self) -> EventClass {
        let mut mask = EventClass::NONE;
        if self.access.is_some() {
            mask |= EventClass::ACCESS;
        }
        if self.error.is_some() {
            mask |= EventClass::ERROR;
        }
        mask
    }

    fn handle(&self, event: &Event) {
        let (file, line) = match (&event.kind, &self.access, &self.error) {
            (EventKind::Access(record), Some(file), _) => {
                (file, format_access(record, &access_stamp(event.at)))
            }
            (EventKind::Error { ip, text }, _, Some(file)) => {
                (file, format_error(ip, text, &error_stamp(event.at)))
            }
            _ => return,
        };

        if let Err(err) = file.write_line(&line) {
            tracing::warn!(path = %file.path.display(), %err, "log write failed");
        }
    }
}

/// `10/Oct/2000:13:55:36 +0000`
pub fn access_stamp(at: SystemTime) -> String {
    DateTime::<Utc>::from(at)
        .format("%d/%b/%Y:%H:%M:%S %z")
        .to_string()
}

/// `Wed Oct 11 14:32:52 2000`
pub fn error_stamp(at: SystemTime) -> String {
    DateTime::<Utc>::from(at)
        .format("%a %b %d %H:%M:%S %Y")
        .to_string()
}

/// Combined log format line, without the trailing newline.
pub fn format_access(r: &AccessRecord, stamp: &str) -> String {
    let uri = match r.uri.find('?') {
        Some(i) => &r.uri[..i],
        None => &r.uri,
    };
    let user = if r.user.is_empty() { "-" } else { &r.user };

    format!(
        "{} - {} [{}] \"{} {} HTTP/{}\" {} {} \"{}\" \"{}\"",
        r.ip, user, stamp, r.method, uri, r.httpver, r.status, r.bytes, r.referrer, r.useragent
    )
}

pub fn format_error(ip: &str, text: &str, stamp: &str) -> String {
    format!("[{stamp}] [error] [client {ip}] {text}")
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    rotation: Rotation,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl LogFile {
    fn open(path: &Path, rotation: Rotation) -> io::Result<Self> {
        let (file, size) = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            rotation,
            state: Mutex::new(FileState { file, size }),
        })
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let len = line.len() as u64 + 1;

        if self.rotation.max_size > 0
            && state.size > 0
            && state.size + len > self.rotation.max_size
        {
            self.rotate()?;
            let (file, size) = open_append(&self.path)?;
            *state = FileState { file, size };
        }

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        state.file.write_all(&buf)?;
        state.size += len;
        Ok(())
    }

    /// `name.{keep-1}` -> `name.{keep}` .. `name` -> `name.1`
    fn rotate(&self) -> io::Result<()> {
        if self.rotation.keep == 0 {
            return fs::remove_file(&self.path);
        }

        let numbered = |n: usize| {
            let mut name = self.path.clone().into_os_string();
            name.push(format!(".{n}"));
            PathBuf::from(name)
        };

        for n in (1..self.rotation.keep).rev() {
            let from = numbered(n);
            if from.exists() {
                fs::rename(&from, numbered(n + 1))?;
            }
        }
        fs::rename(&self.path, numbered(1))
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}
