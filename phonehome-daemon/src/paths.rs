use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG: &str = "etc/phonehome/phonehome.yaml";
pub const LOG_FILE: &str = "phonehome.log";
pub const INBOX_DIR: &str = "events";

/// Longest uninterrupted sleep; shutdown is checked between slices.
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Property file location under `root` (or `/`).
pub fn default_config(root: Option<&Path>) -> PathBuf {
    root.unwrap_or_else(|| Path::new("/")).join(DEFAULT_CONFIG)
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn log_path(data_dir: &Path) -> PathBuf {
    logs_dir(data_dir).join(LOG_FILE)
}

pub fn inbox_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(INBOX_DIR)
}
