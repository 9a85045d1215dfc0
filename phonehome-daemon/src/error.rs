use std::path::PathBuf;

use phonehome_core::PhoneHomeError;
use thiserror::Error;

/// Error surface for the scheduler, event inbox and runtime wiring.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    PhoneHome(#[from] PhoneHomeError),

    #[error("malformed fault event {path}: {source}")]
    Event {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{task} task failed: {message}")]
    Task { task: &'static str, message: String },
}

impl DaemonError {
    /// `true` when the scheduler must stop instead of carrying on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaemonError::PhoneHome(err) if err.is_fatal())
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
