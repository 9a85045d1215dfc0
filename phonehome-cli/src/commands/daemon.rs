//! `phonehome daemon` — run the polling scheduler.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::Args;

use phonehome_daemon::{init_tracing, start_blocking, ControlFlags, DaemonOptions, Scheduler};

use super::GlobalArgs;

/// Arguments for `phonehome daemon`.
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Run a single cycle in the foreground and print what it did.
    #[arg(long)]
    pub once: bool,

    /// With `--once`, print the cycle report as JSON.
    #[arg(long, requires = "once")]
    pub json: bool,
}

impl DaemonArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        if !self.once {
            let options = DaemonOptions {
                config: global.config_path(),
                root: global.root.clone(),
                debug: global.debug,
                foreground: global.foreground,
            };
            return start_blocking(&options).context("daemon exited with error");
        }

        init_tracing(global.debug, false, None)?;
        let session = global.open_session()?;
        let mut scheduler = Scheduler::new(session, Arc::new(ControlFlags::new()));
        let report = scheduler
            .run_cycle(SystemTime::now())
            .context("cycle failed")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            );
            return Ok(());
        }
        if !report.registered {
            println!("not registered; nothing sent");
            return Ok(());
        }
        println!(
            "✓ cycle complete: {} resent, {} kept, {} discarded, {} new event(s), {} deferred, {} held",
            report.resent,
            report.kept,
            report.discarded,
            report.events,
            report.deferred_events,
            report.held_events
        );
        println!(
            "  heartbeat {}, audit {}",
            if report.heartbeat_sent { "sent" } else { "not sent" },
            if report.audit_sent { "sent" } else { "not sent" },
        );
        Ok(())
    }
}
