//! phonehome daemon: scheduler loop, control flags, fault-event inbox and
//! runtime wiring.

mod error;
pub mod flags;
pub mod inbox;
pub mod log_rotation;
pub mod paths;
mod runtime;
pub mod scheduler;

pub use error::DaemonError;
pub use flags::ControlFlags;
pub use inbox::Inbox;
pub use runtime::{init_tracing, run, start_blocking, AppendFile, DaemonOptions, LOG_FORMAT};
pub use scheduler::{is_due, CycleReport, Phase, Scheduler};
