//! Fault-event inbox: `<data-dir>/events/*.json`.
//!
//! Each file holds one JSON [`FaultEvent`]. The scheduler turns events into
//! fault messages and removes the file once the message has been sent,
//! spooled or dropped. Files starting with `.` are staging files.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use phonehome_core::{FaultEvent, PropertyStore};

use crate::error::{io_err, DaemonError};
use crate::paths::inbox_dir;

#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_props(props: &PropertyStore) -> Self {
        Self::new(inbox_dir(&props.data_dir()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues `event` for the daemon, returning the file written.
    pub fn submit(&self, event: &FaultEvent) -> Result<PathBuf, DaemonError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let name = format!("{}.json", sanitize(&event.uuid));
        let staging = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);

        let body = serde_json::to_vec_pretty(event)?;
        let written = fs::write(&staging, body)
            .map_err(|e| io_err(&staging, e))
            .and_then(|()| fs::rename(&staging, &path).map_err(|e| io_err(&path, e)));
        if let Err(err) = written {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        tracing::debug!("queued fault event {}", path.display());
        Ok(path)
    }

    /// Event files, oldest first. A missing directory is an empty inbox.
    pub fn pending(&self) -> Result<Vec<PathBuf>, DaemonError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.dir, e)),
        };

        let mut events: Vec<(Option<SystemTime>, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            let is_event = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"));
            if !is_event {
                continue;
            }
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            events.push((modified, path));
        }
        events.sort();
        Ok(events.into_iter().map(|(_, path)| path).collect())
    }

    pub fn read(path: &Path) -> Result<FaultEvent, DaemonError> {
        let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| DaemonError::Event {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Removes a handled event file.
    pub fn consume(&self, path: &Path) -> Result<(), DaemonError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

fn sanitize(uuid: &str) -> String {
    let name: String = uuid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() {
        uuid_fallback()
    } else {
        name
    }
}

fn uuid_fallback() -> String {
    format!(
        "event-{}",
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    )
}
