//! Process-wide control flags set by signal handlers.
//!
//! Handlers only flip a flag; the scheduler consumes them at the start of
//! a cycle (reconfigure) or after a cycle completes (shutdown).

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ControlFlags {
    reconfigure: AtomicBool,
    shutdown: AtomicBool,
}

impl Default for ControlFlags {
    /// Reconfigure starts raised so the first cycle loads configuration.
    fn default() -> Self {
        Self {
            reconfigure: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
    }

    /// Clears the reconfigure flag, returning whether it was set.
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
