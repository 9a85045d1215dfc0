//! Durable retry queue for undelivered messages.
//!
//! # Layout
//!
//! ```text
//! <data-dir>/messages/            (mode 0700)
//!   heartbeat.xml                 last heartbeat sent; mtime = when
//!   audit.xml                     last audit sent; mtime = when
//!   fault-<uuid>.xml              undelivered, retried every cycle
//!   .<id>.tmp                     staging file, renamed into place
//! ```
//!
//! Periodic kinds live under a fixed name and are never pending; every
//! other kind gets a fresh `<kind>-<uuid>` id per message.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::{set_file_mtime, FileTime};

use phonehome_core::error::io_err;
use phonehome_core::{Message, MessageKind, PhoneHomeError, PropertyStore, Result};

use crate::session::Session;

/// Directory under `data-dir` holding spooled messages.
pub const SPOOL_DIR: &str = "messages";
const EXTENSION: &str = ".xml";

/// A spooled message awaiting redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: String,
    pub kind: MessageKind,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// What [`Spool::resend`] did with a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    Delivered,
    /// Transient failure; the file is untouched.
    Kept,
    /// Rejected as non-retryable; the file was removed.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The spool under the configured `data-dir`.
    pub fn for_props(props: &PropertyStore) -> Self {
        Self::new(props.data_dir().join(SPOOL_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{EXTENSION}"))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        set_dir_permissions(&self.dir)
    }

    /// Atomically writes `bytes` and returns the message id.
    pub fn persist(&self, kind: MessageKind, bytes: &[u8]) -> Result<String> {
        let id = if kind.is_periodic() {
            kind.as_str().to_string()
        } else {
            format!("{kind}-{}", uuid::Uuid::new_v4())
        };
        self.write_atomic(&id, bytes)?;
        tracing::debug!("spooled {id} ({} bytes)", bytes.len());
        Ok(id)
    }

    fn write_atomic(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        let path = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.tmp"));

        if let Err(e) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&tmp, e));
        }
        if let Err(e) = set_file_permissions(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    /// Spooled messages awaiting redelivery, oldest first.
    pub fn list_pending(&self) -> Result<Vec<PendingMessage>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.dir, e)),
        };

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, kind)) = parse_pending_name(&name) else {
                continue;
            };
            let metadata = entry.metadata().map_err(|e| io_err(entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            pending.push(PendingMessage {
                id: id.to_string(),
                kind,
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
        pending.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    pub fn read(&self, id: &str) -> Result<Message> {
        let kind = parse_pending_name(&format!("{id}{EXTENSION}"))
            .map(|(_, kind)| kind)
            .or_else(|| id.parse::<MessageKind>().ok())
            .ok_or_else(|| PhoneHomeError::InvalidRequest(format!("'{id}' is not a spool id")))?;
        let path = self.path_for(id);
        let data = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(Message::new(kind, data))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Attempts delivery of one pending message.
    ///
    /// Success removes the file. A retryable failure leaves it byte-for-byte
    /// intact. Only a server's non-retryable rejection removes it. Any other
    /// error is returned with the file kept.
    pub fn resend(&self, id: &str, session: &Session) -> Result<ResendOutcome> {
        let message = self.read(id)?;
        match session.send(&message) {
            Ok(receipt) => {
                self.remove(id)?;
                tracing::info!("resent {id} ({} bytes, status {})", receipt.bytes, receipt.status);
                Ok(ResendOutcome::Delivered)
            }
            Err(err) if err.is_retryable() => {
                tracing::debug!("keeping {id} for the next cycle: {err}");
                Ok(ResendOutcome::Kept)
            }
            Err(err) if err.is_rejection() => {
                tracing::warn!("discarding {id}: {err}");
                self.remove(id)?;
                Ok(ResendOutcome::Discarded)
            }
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Periodic markers
    // -----------------------------------------------------------------------

    /// Records a delivered, or rejected, periodic message: its body is kept under the
    /// fixed name and the file mtime is set to `at`.
    pub fn ack_success(&self, kind: MessageKind, body: &[u8], at: SystemTime) -> Result<()> {
        if !kind.is_periodic() {
            return Ok(());
        }
        self.write_atomic(kind.as_str(), body)?;
        let path = self.path_for(kind.as_str());
        set_file_mtime(&path, FileTime::from_system_time(at)).map_err(|e| io_err(&path, e))
    }

    /// When `kind` was last delivered, from its marker's mtime.
    pub fn last_sent(&self, kind: MessageKind) -> Result<Option<SystemTime>> {
        let path = self.path_for(kind.as_str());
        match fs::metadata(&path) {
            Ok(metadata) => metadata
                .modified()
                .map(Some)
                .map_err(|e| io_err(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

/// `<kind>-<id>.xml` for a non-periodic kind; longest kind name wins.
fn parse_pending_name(name: &str) -> Option<(&str, MessageKind)> {
    let id = name.strip_suffix(EXTENSION)?;
    MessageKind::ALL
        .into_iter()
        .filter(|kind| !kind.is_periodic())
        .filter(|kind| {
            id.strip_prefix(kind.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|rest| !rest.is_empty())
        })
        .max_by_key(|kind| kind.as_str().len())
        .map(|kind| (id, kind))
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rstest::rstest;
    use tempfile::TempDir;

    use crate::testing::{FakeProtocol, Reply};
    use phonehome_transport::testing::registered_store;

    fn spool() -> (TempDir, Spool) {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("messages"));
        (tmp, spool)
    }

    fn session(fake: &FakeProtocol) -> Session {
        Session::with_protocol(registered_store("https://t.example"), Box::new(fake.clone()))
    }

    #[rstest]
    #[case("fault-1234.xml", Some(MessageKind::Fault))]
    #[case("event-update-77.xml", Some(MessageKind::EventUpdate))]
    #[case("state-change-a.xml", Some(MessageKind::StateChange))]
    #[case("heartbeat.xml", None)]
    #[case("heartbeat-1.xml", None)]
    #[case("fault-.xml", None)]
    #[case(".fault-1.tmp", None)]
    #[case("notes.txt", None)]
    fn pending_name_parsing(#[case] name: &str, #[case] kind: Option<MessageKind>) {
        assert_eq!(parse_pending_name(name).map(|(_, k)| k), kind);
    }

    #[test]
    fn persist_uses_generated_ids_and_private_modes() {
        let (_tmp, spool) = spool();
        let first = spool.persist(MessageKind::Fault, b"<one/>").unwrap();
        let second = spool.persist(MessageKind::Fault, b"<two/>").unwrap();
        assert!(first.starts_with("fault-"));
        assert_ne!(first, second);
        assert_eq!(fs::read(spool.dir().join(format!("{first}.xml"))).unwrap(), b"<one/>");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dir_mode = fs::metadata(spool.dir()).unwrap().permissions().mode() & 0o777;
            assert_eq!(dir_mode, 0o700);
            let file_mode = fs::metadata(spool.dir().join(format!("{first}.xml")))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(file_mode, 0o600);
        }

        let leftovers: Vec<_> = fs::read_dir(spool.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn list_pending_skips_markers_and_orders_by_age() {
        let (_tmp, spool) = spool();
        let older = spool.persist(MessageKind::Fault, b"<a/>").unwrap();
        let newer = spool.persist(MessageKind::StateChange, b"<b/>").unwrap();
        spool
            .ack_success(MessageKind::Heartbeat, b"<h/>", SystemTime::now())
            .unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_file_mtime(spool.dir().join(format!("{older}.xml")), FileTime::from_system_time(base)).unwrap();
        set_file_mtime(
            spool.dir().join(format!("{newer}.xml")),
            FileTime::from_system_time(base + Duration::from_secs(60)),
        )
        .unwrap();

        let ids: Vec<_> = spool.list_pending().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, [older, newer]);
    }

    #[test]
    fn missing_directory_has_nothing_pending() {
        let (_tmp, spool) = spool();
        assert!(spool.list_pending().unwrap().is_empty());
        assert_eq!(spool.last_sent(MessageKind::Audit).unwrap(), None);
    }

    #[test]
    fn successful_resend_deletes_the_file() {
        let (_tmp, spool) = spool();
        let fake = FakeProtocol::new();
        let id = spool.persist(MessageKind::Fault, b"<fault/>").unwrap();

        assert_eq!(spool.resend(&id, &session(&fake)).unwrap(), ResendOutcome::Delivered);
        assert!(!spool.dir().join(format!("{id}.xml")).exists());
        assert_eq!(fake.sent()[0].data, b"<fault/>");
        assert_eq!(fake.sent()[0].kind, MessageKind::Fault);
    }

    #[test]
    fn failed_resend_leaves_the_file_identical() {
        let (_tmp, spool) = spool();
        let fake = FakeProtocol::new();
        fake.script(Reply::Refused);
        fake.script(Reply::Status(503));
        let id = spool.persist(MessageKind::Fault, b"<fault>payload</fault>").unwrap();

        assert_eq!(spool.resend(&id, &session(&fake)).unwrap(), ResendOutcome::Kept);
        assert_eq!(spool.resend(&id, &session(&fake)).unwrap(), ResendOutcome::Kept);
        assert_eq!(
            fs::read(spool.dir().join(format!("{id}.xml"))).unwrap(),
            b"<fault>payload</fault>"
        );
    }

    #[test]
    fn rejected_resend_is_discarded_and_fatal_is_kept() {
        let (_tmp, spool) = spool();
        let fake = FakeProtocol::new();
        fake.script(Reply::Status(409));
        fake.script(Reply::Stop);
        let rejected = spool.persist(MessageKind::Fault, b"<a/>").unwrap();
        let stopped = spool.persist(MessageKind::Fault, b"<b/>").unwrap();

        assert_eq!(spool.resend(&rejected, &session(&fake)).unwrap(), ResendOutcome::Discarded);
        assert!(!spool.dir().join(format!("{rejected}.xml")).exists());

        let err = spool.resend(&stopped, &session(&fake)).unwrap_err();
        assert!(err.is_fatal());
        assert!(spool.dir().join(format!("{stopped}.xml")).exists());
    }

    #[rstest]
    #[case::configuration(Reply::Misconfigured)]
    #[case::signing(Reply::BadKey)]
    fn local_failure_keeps_the_file(#[case] reply: Reply) {
        let (_tmp, spool) = spool();
        let fake = FakeProtocol::new();
        fake.script(reply);
        let id = spool.persist(MessageKind::Fault, b"<fault/>").unwrap();

        let err = spool.resend(&id, &session(&fake)).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(fs::read(spool.dir().join(format!("{id}.xml"))).unwrap(), b"<fault/>");
        assert!(fake.sent().is_empty());

        // The next attempt, once the cause is fixed, delivers it.
        assert_eq!(spool.resend(&id, &session(&fake)).unwrap(), ResendOutcome::Delivered);
    }

    #[test]
    fn ack_success_sets_marker_mtime() {
        let (_tmp, spool) = spool();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        spool.ack_success(MessageKind::Heartbeat, b"<h/>", at).unwrap();
        assert_eq!(spool.last_sent(MessageKind::Heartbeat).unwrap(), Some(at));
        assert_eq!(fs::read(spool.dir().join("heartbeat.xml")).unwrap(), b"<h/>");

        spool.ack_success(MessageKind::Fault, b"<f/>", at).unwrap();
        assert!(spool.list_pending().unwrap().is_empty());
    }
}
