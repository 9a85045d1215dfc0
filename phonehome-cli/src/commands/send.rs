//! `phonehome send` — build one message and deliver it now.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::Args;

use phonehome_client::{deliver, BuildOptions, Delivery, Spool};
use phonehome_core::{FaultEvent, MessageKind, PhoneHomeError};
use phonehome_daemon::Inbox;

use super::GlobalArgs;

/// Arguments for `phonehome send`.
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Message kind: activate, deactivate, heartbeat, audit, fault, test,
    /// status, event-update or state-change.
    pub kind: MessageKind,

    /// Address the service mails for a `test` message.
    #[arg(long)]
    pub email: Option<String>,

    /// `state-change`: the host is online.
    #[arg(long)]
    pub online: bool,

    /// `state-change`: the host is in maintenance.
    #[arg(long)]
    pub maintenance: bool,

    /// `status`: the status method name.
    #[arg(long)]
    pub method: Option<String>,

    /// `fault`/`event-update`: JSON file holding the fault event.
    #[arg(long, value_name = "FILE")]
    pub event: Option<PathBuf>,

    /// Hand the event to the daemon's inbox instead of sending it now.
    #[arg(long, requires = "event")]
    pub queue: bool,

    /// Print the message body without sending it.
    #[arg(long, conflicts_with = "queue")]
    pub dry_run: bool,
}

impl SendArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let mut session = global.open_session()?;
        let mut event = self.event.as_deref().map(read_event).transpose()?;

        if self.queue {
            let Some(mut event) = event else {
                bail!("--queue requires --event");
            };
            event.update = self.kind == MessageKind::EventUpdate;
            let path = Inbox::for_props(session.props())
                .submit(&event)
                .context("failed to queue event")?;
            println!("✓ queued {} for the daemon: {}", self.kind, path.display());
            return Ok(());
        }

        if let Some(event) = event.as_mut() {
            event.update = self.kind == MessageKind::EventUpdate;
        }
        let options = BuildOptions {
            email: self.email,
            online: self.online,
            maintenance: self.maintenance,
            method: self.method,
            event,
            at: None,
        };
        let message = session
            .build_message(self.kind, &options)
            .with_context(|| format!("failed to build {} message", self.kind))?;

        if self.dry_run {
            println!("{}", String::from_utf8_lossy(&message.data));
            return Ok(());
        }
        if !session.is_registered() {
            return Err(PhoneHomeError::NotRegistered).context("cannot send");
        }

        let spool = Spool::for_props(session.props());
        match deliver(&session, &spool, &message, SystemTime::now())
            .with_context(|| format!("{} not delivered", self.kind))?
        {
            Delivery::Sent(receipt) => println!(
                "✓ {} sent ({} bytes, status {})",
                self.kind, receipt.bytes, receipt.status
            ),
            Delivery::Spooled(id) => {
                println!("{} not delivered; spooled as {id} for the daemon", self.kind)
            }
            Delivery::Deferred => {
                println!("{} not delivered; the daemon will retry", self.kind)
            }
            Delivery::Dropped { reason, .. } => bail!("{} rejected: {reason}", self.kind),
        }
        Ok(())
    }
}

fn read_event(path: &Path) -> Result<FaultEvent> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| PhoneHomeError::Configuration(format!("{}: {err}", path.display())))
        .context("invalid fault event")
}
