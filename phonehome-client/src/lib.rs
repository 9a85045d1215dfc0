//! # phonehome-client
//!
//! Session, registration flow and the durable retry queue.
//!
//! Open a [`Session`] over a property file, [`Session::register`] once, then
//! hand each new message to [`deliver`], which sends it, spools it in the
//! [`Spool`] for a later [`Spool::resend`], or drops it.

pub mod dispatch;
pub mod session;
pub mod spool;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatch::{deliver, Delivery};
pub use session::{session_lock, BuildOptions, Session};
pub use spool::{PendingMessage, ResendOutcome, Spool, SPOOL_DIR};
