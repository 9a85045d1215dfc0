//! Send-or-spool-or-drop delivery policy for new messages.

use std::time::SystemTime;

use phonehome_core::{Message, Result};
use phonehome_transport::SendReceipt;

use crate::session::Session;
use crate::spool::Spool;

/// What happened to a newly built message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(SendReceipt),
    /// Transient failure; spooled under this id for the next cycle.
    Spooled(String),
    /// Transient failure of a periodic message; it stays due and is rebuilt
    /// next cycle.
    Deferred,
    /// Rejected by the server as non-retryable and discarded.
    Dropped { status: Option<u16>, reason: String },
}

/// Sends `message`, recovering locally from transport failures and server
/// responses. Fatal and local errors (configuration, signing, disk) are
/// returned and nothing is spooled or dropped.
pub fn deliver(
    session: &Session,
    spool: &Spool,
    message: &Message,
    now: SystemTime,
) -> Result<Delivery> {
    let kind = message.kind;
    match session.send(message) {
        Ok(receipt) => {
            spool.ack_success(kind, &message.data, now)?;
            Ok(Delivery::Sent(receipt))
        }
        Err(err) if err.is_retryable() => {
            if kind.is_periodic() {
                tracing::warn!("{kind} not delivered, retrying next cycle: {err}");
                return Ok(Delivery::Deferred);
            }
            let id = spool.persist(kind, &message.data)?;
            tracing::warn!("{kind} not delivered, spooled as {id}: {err}");
            Ok(Delivery::Spooled(id))
        }
        Err(err) if err.is_rejection() => {
            tracing::warn!("{kind} rejected, not retrying: {err}");
            Ok(Delivery::Dropped {
                status: err.status(),
                reason: err.to_string(),
            })
        }
        Err(err) => Err(err),
    }
}
