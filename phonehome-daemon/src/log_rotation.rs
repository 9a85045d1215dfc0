//! Size-based rotation of the daemon log file.
//!
//! `phonehome.log` is rotated once it reaches 10 MiB, keeping at most 5
//! copies: `phonehome.log` → `phonehome.log.1` → … → `phonehome.log.5`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Size at which the live log is rotated (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept beside the live log.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotates `log_path` when it is at least `max_bytes` long.
///
/// The oldest copy is deleted, every `<name>.<n>` moves to `<name>.<n+1>`,
/// the live file becomes `<name>.1` and a fresh empty log is created.
/// Returns `Ok(false)` when the file is under the threshold or missing.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    Ok(true)
}

/// Rotates the daemon log with the standard limits. Failures are logged.
pub fn rotate_log(log_path: &Path) {
    match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
        Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
        Ok(false) => {}
        Err(err) => tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed"),
    }
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(crate::paths::LOG_FILE);
    base.with_file_name(format!("{name}.{n}"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL: u64 = 64;

    fn write_log(path: &Path, len: usize, fill: u8) {
        fs::write(path, vec![fill; len]).unwrap();
    }

    #[test]
    fn small_or_missing_logs_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("phonehome.log");
        assert!(!rotate_if_needed(&log, SMALL, 5).unwrap());

        write_log(&log, 10, b'a');
        assert!(!rotate_if_needed(&log, SMALL, 5).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_backup() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("phonehome.log");
        write_log(&log, SMALL as usize, b'a');

        assert!(rotate_if_needed(&log, SMALL, 5).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap().len(), SMALL as usize);
    }

    #[test]
    fn backups_shift_and_are_capped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("phonehome.log");

        for round in 0..4u8 {
            write_log(&log, SMALL as usize, b'0' + round);
            rotate_if_needed(&log, SMALL, 3).unwrap();
        }

        // Newest content in .1, oldest surviving round in .3.
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap()[0], b'3');
        assert_eq!(fs::read(numbered_path(&log, 3)).unwrap()[0], b'1');
        assert!(!numbered_path(&log, 4).exists());
    }
}
