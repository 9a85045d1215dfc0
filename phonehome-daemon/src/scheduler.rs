//! The polling loop.
//!
//! ```text
//! Idle → ConfigLoad? → RegistrationCheck → FaultRetryPass → EventIntake
//!      → HeartbeatCheck → AuditCheck → Sleep → (next cycle)
//! ```
//!
//! ConfigLoad only runs when the reconfigure flag is raised. Every phase
//! recovers locally from non-fatal errors; a fatal error ends the cycle and
//! the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use sha2::{Digest, Sha256};

use phonehome_client::{deliver, BuildOptions, Delivery, ResendOutcome, Session, Spool};
use phonehome_core::props::{defaults, keys};
use phonehome_core::{Credential, FaultEvent, MessageKind, PhoneHomeError};

use crate::error::DaemonError;
use crate::flags::ControlFlags;
use crate::inbox::Inbox;
use crate::log_rotation;
use crate::paths::SLEEP_SLICE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    ConfigLoad,
    RegistrationCheck,
    FaultRetryPass,
    EventIntake,
    HeartbeatCheck,
    AuditCheck,
    Sleep,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub reloaded: bool,
    pub registered: bool,
    pub resent: usize,
    pub kept: usize,
    pub discarded: usize,
    /// New fault events turned into messages.
    pub events: usize,
    /// Events left in the inbox by the per-cycle cap.
    pub deferred_events: usize,
    /// Events left in the inbox because building or sending failed locally.
    pub held_events: usize,
    pub heartbeat_sent: bool,
    pub audit_sent: bool,
}

pub struct Scheduler {
    session: Session,
    spool: Spool,
    inbox: Inbox,
    flags: Arc<ControlFlags>,
    log_file: Option<PathBuf>,
    /// Hash of the auto-registration credentials last tried.
    autoreg_attempted: Option<String>,
    created_this_cycle: u64,
    phase: Phase,
}

impl Scheduler {
    pub fn new(session: Session, flags: Arc<ControlFlags>) -> Self {
        let spool = Spool::for_props(session.props());
        let inbox = Inbox::for_props(session.props());
        Self {
            session,
            spool,
            inbox,
            flags,
            log_file: None,
            autoreg_attempted: None,
            created_this_cycle: 0,
            phase: Phase::Idle,
        }
    }

    /// Log file rotated at the start of every cycle.
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        Arc::clone(&self.flags)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Runs cycles until shutdown is requested or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        tracing::info!("scheduler started ({})", self.session.protocol_kind());
        loop {
            match self.run_cycle(SystemTime::now()) {
                Ok(report) => tracing::debug!(?report, "cycle complete"),
                Err(err) => {
                    tracing::error!("fatal error, stopping: {err}");
                    return Err(err);
                }
            }
            if self.sleep() {
                break;
            }
        }
        tracing::info!("shutdown requested; scheduler stopped");
        Ok(())
    }

    /// One pass through every phase, as of `now`.
    pub fn run_cycle(&mut self, now: SystemTime) -> Result<CycleReport, DaemonError> {
        let mut report = CycleReport::default();
        self.created_this_cycle = 0;
        if let Some(path) = &self.log_file {
            log_rotation::rotate_log(path);
        }

        if self.flags.take_reconfigure() {
            self.phase = Phase::ConfigLoad;
            report.reloaded = settle(self.phase, self.config_load())?.is_some();
        }

        self.phase = Phase::RegistrationCheck;
        report.registered = self.session.is_registered();
        if !report.registered {
            tracing::debug!("not registered; nothing to send");
            self.phase = Phase::Idle;
            return Ok(report);
        }

        self.phase = Phase::FaultRetryPass;
        settle(self.phase, self.fault_retry_pass(&mut report))?;

        self.phase = Phase::EventIntake;
        settle(self.phase, self.event_intake(now, &mut report))?;

        self.phase = Phase::HeartbeatCheck;
        let interval = self
            .session
            .props()
            .get_duration_secs(keys::HEARTBEAT_INTERVAL, defaults::HEARTBEAT_INTERVAL_SECS);
        report.heartbeat_sent = settle(
            self.phase,
            self.periodic_check(MessageKind::Heartbeat, interval, now),
        )?
        .unwrap_or(false);

        self.phase = Phase::AuditCheck;
        let interval = self
            .session
            .props()
            .get_duration_secs(keys::AUDIT_INTERVAL, defaults::AUDIT_INTERVAL_SECS);
        report.audit_sent = settle(
            self.phase,
            self.periodic_check(MessageKind::Audit, interval, now),
        )?
        .unwrap_or(false);

        self.phase = Phase::Idle;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn config_load(&mut self) -> Result<(), DaemonError> {
        self.session.reload()?;
        self.spool = Spool::for_props(self.session.props());
        self.inbox = Inbox::for_props(self.session.props());
        tracing::info!("configuration loaded from {}", self.session.props().location());

        self.session.validate_registration()?;
        self.auto_register();
        Ok(())
    }

    /// Tries the configured auto-registration credentials, once per distinct
    /// user/password pair. Failures are logged.
    fn auto_register(&mut self) {
        if self.session.is_registered() {
            return;
        }
        let props = self.session.props();
        let (Some(user), Some(password)) = (
            props.get(keys::AUTOREG_USER),
            props.get(keys::AUTOREG_PASSWORD),
        ) else {
            return;
        };
        let fingerprint = credential_fingerprint(user, password);
        if self.autoreg_attempted.as_deref() == Some(fingerprint.as_str()) {
            tracing::debug!("auto-registration already attempted with these credentials");
            return;
        }
        let credential = Credential::new(user, password);
        self.autoreg_attempted = Some(fingerprint);

        tracing::info!("attempting auto-registration as {}", credential.user());
        match self.session.register(credential) {
            Ok(record) => tracing::info!(client_id = %record.client_id, "auto-registration succeeded"),
            Err(err) => tracing::error!("auto-registration failed: {err}"),
        }
    }

    fn fault_retry_pass(&mut self, report: &mut CycleReport) -> Result<(), DaemonError> {
        for pending in self.spool.list_pending()? {
            match self.spool.resend(&pending.id, &self.session)? {
                ResendOutcome::Delivered => report.resent += 1,
                ResendOutcome::Kept => report.kept += 1,
                ResendOutcome::Discarded => report.discarded += 1,
            }
        }
        Ok(())
    }

    fn event_intake(&mut self, now: SystemTime, report: &mut CycleReport) -> Result<(), DaemonError> {
        let limit = self
            .session
            .props()
            .get_u64(keys::MAX_MESSAGES, defaults::MAX_MESSAGES);
        let pending = self.inbox.pending()?;

        for (index, path) in pending.iter().enumerate() {
            if let Err(err) = self.reserve_slot(limit) {
                report.deferred_events = pending.len() - index;
                tracing::warn!("{err}; {} event(s) left for the next cycle", report.deferred_events);
                break;
            }
            let event = match Inbox::read(path) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!("discarding event: {err}");
                    self.inbox.consume(path)?;
                    continue;
                }
            };
            let kind = if event.update {
                MessageKind::EventUpdate
            } else {
                MessageKind::Fault
            };
            match self.deliver_event(kind, event, now) {
                Ok(Delivery::Sent(receipt)) => {
                    tracing::info!("{kind} sent ({} bytes, status {})", receipt.bytes, receipt.status)
                }
                Ok(Delivery::Spooled(id)) => tracing::info!("{kind} spooled as {id}"),
                Ok(Delivery::Deferred | Delivery::Dropped { .. }) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!("keeping {} for the next cycle: {err}", path.display());
                    report.held_events += 1;
                    continue;
                }
            }
            self.inbox.consume(path)?;
            report.events += 1;
        }
        Ok(())
    }

    fn deliver_event(
        &mut self,
        kind: MessageKind,
        event: FaultEvent,
        now: SystemTime,
    ) -> Result<Delivery, PhoneHomeError> {
        let options = BuildOptions {
            event: Some(event),
            at: Some(now.into()),
            ..BuildOptions::default()
        };
        let message = self.session.build_message(kind, &options)?;
        deliver(&self.session, &self.spool, &message, now)
    }

    /// Sends a heartbeat or audit when its interval has elapsed.
    fn periodic_check(
        &mut self,
        kind: MessageKind,
        interval: Duration,
        now: SystemTime,
    ) -> Result<bool, DaemonError> {
        let last = self.spool.last_sent(kind)?;
        if !is_due(last, interval, now) {
            tracing::debug!("{kind} not due");
            return Ok(false);
        }
        let options = BuildOptions {
            at: Some(now.into()),
            ..BuildOptions::default()
        };
        let message = self.session.build_message(kind, &options)?;
        match deliver(&self.session, &self.spool, &message, now)? {
            Delivery::Sent(_) => {
                tracing::info!("{kind} sent");
                Ok(true)
            }
            Delivery::Dropped { .. } => {
                // A rejected message is not rebuilt until the next interval.
                self.spool.ack_success(kind, &message.data, now)?;
                tracing::warn!("{kind} rejected; next attempt after {}s", interval.as_secs());
                Ok(false)
            }
            Delivery::Spooled(_) | Delivery::Deferred => Ok(false),
        }
    }

    /// Counts one new fault message against the per-cycle cap.
    fn reserve_slot(&mut self, limit: u64) -> Result<(), PhoneHomeError> {
        if self.created_this_cycle >= limit {
            return Err(PhoneHomeError::MessageLimit { limit });
        }
        self.created_this_cycle += 1;
        Ok(())
    }

    /// Sleeps for the poll interval; returns `true` when shutdown was
    /// requested.
    fn sleep(&mut self) -> bool {
        self.phase = Phase::Sleep;
        let interval = self
            .session
            .props()
            .get_duration_secs(keys::POLL_INTERVAL, defaults::POLL_INTERVAL_SECS);
        let deadline = Instant::now() + interval;
        while !self.flags.shutdown_requested() {
            let now = Instant::now();
            if now >= deadline {
                self.phase = Phase::Idle;
                return false;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
        true
    }
}

/// `true` once strictly more than `interval` has passed since `last`.
/// Never-sent messages are always due.
pub fn is_due(last: Option<SystemTime>, interval: Duration, now: SystemTime) -> bool {
    match last {
        None => true,
        Some(last) => last
            .checked_add(interval)
            .is_some_and(|next| now > next),
    }
}

/// Fatal errors stop the cycle; anything else is logged and the phase is
/// skipped.
fn settle<T>(phase: Phase, result: Result<T, DaemonError>) -> Result<Option<T>, DaemonError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(?phase, "phase failed: {err}");
            Ok(None)
        }
    }
}

fn credential_fingerprint(user: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn due_only_strictly_after_interval() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let day = 24 * HOUR;
        assert!(is_due(None, day, t));
        assert!(!is_due(Some(t), day, t + HOUR));
        assert!(!is_due(Some(t), day, t + day));
        assert!(is_due(Some(t), day, t + day + Duration::from_secs(1)));
    }

    #[test]
    fn credential_fingerprint_changes_with_either_field() {
        let base = credential_fingerprint("alice", "secret");
        assert_eq!(base, credential_fingerprint("alice", "secret"));
        assert_ne!(base, credential_fingerprint("alice", "secret2"));
        assert_ne!(base, credential_fingerprint("alic", "esecret"));
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn non_fatal_errors_are_absorbed() {
        let err = DaemonError::PhoneHome(PhoneHomeError::Transport("down".into()));
        assert_eq!(settle::<()>(Phase::HeartbeatCheck, Err(err)).unwrap(), None);

        let fatal = DaemonError::PhoneHome(PhoneHomeError::StopRetrying("stop".into()));
        assert!(settle::<()>(Phase::HeartbeatCheck, Err(fatal)).is_err());
    }
}
