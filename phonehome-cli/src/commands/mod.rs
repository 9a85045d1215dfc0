pub mod daemon;
pub mod list;
pub mod register;
pub mod send;
pub mod status;
pub mod unregister;

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use phonehome_client::Session;
use phonehome_daemon::paths::default_config;

/// Flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Property file [default: <altroot>/etc/phonehome/phonehome.yaml].
    #[arg(short = 'c', long = "config", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Alternate root directory prefixed to every configured path.
    #[arg(short = 'R', long = "root", global = true, value_name = "ALTROOT")]
    pub root: Option<PathBuf>,

    /// Debug logging.
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Stay in the foreground and log to stderr (daemon).
    #[arg(short = 'f', long, global = true)]
    pub foreground: bool,
}

impl GlobalArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| default_config(self.root.as_deref()))
    }

    pub fn open_session(&self) -> Result<Session> {
        let config = self.config_path();
        let session = Session::open(&config, self.root.as_deref())
            .with_context(|| format!("failed to open {}", config.display()))?;
        tracing::debug!("using {} transport", session.protocol_kind());
        Ok(session)
    }
}

/// Stderr logging for interactive commands; quiet unless `-d` or `RUST_LOG`.
pub fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(crate) fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}

/// "3h ago"-style age of `time`.
pub(crate) fn format_age(time: SystemTime, now: SystemTime) -> String {
    let secs = now.duration_since(time).unwrap_or_default().as_secs();
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
