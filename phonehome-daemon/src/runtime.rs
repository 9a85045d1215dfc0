use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

use phonehome_client::Session;

use crate::error::{io_err, DaemonError};
use crate::flags::ControlFlags;
use crate::paths::log_path;
use crate::scheduler::Scheduler;

/// Property naming the log line format: `text` (default) or `json`.
pub const LOG_FORMAT: &str = "log-format";

/// How the daemon was started.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config: PathBuf,
    pub root: Option<PathBuf>,
    pub debug: bool,
    /// Log to stderr instead of the log file.
    pub foreground: bool,
}

/// Opens the session, initialises logging and blocks until the scheduler
/// stops.
pub fn start_blocking(options: &DaemonOptions) -> Result<(), DaemonError> {
    let session = Session::open(&options.config, options.root.as_deref())?;
    let props = session.props();
    let debug = options.debug || props.debug();
    let json = props.get(LOG_FORMAT) == Some("json");
    let log_file = if options.foreground {
        None
    } else {
        Some(log_path(&props.data_dir()))
    };
    init_tracing(debug, json, log_file.as_deref())?;

    let scheduler = Scheduler::new(session, Arc::new(ControlFlags::new())).with_log_file(log_file);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(scheduler))
}

/// Runs the scheduler on a blocking thread while a signal task feeds its
/// control flags.
pub async fn run(mut scheduler: Scheduler) -> Result<(), DaemonError> {
    let flags = scheduler.flags();
    let signals = tokio::spawn(signal_task(flags));

    let result = tokio::task::spawn_blocking(move || scheduler.run()).await;
    signals.abort();
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task {
            task: "scheduler",
            message: err.to_string(),
        }),
    }
}

/// SIGHUP raises reconfigure; SIGTERM or SIGINT raises shutdown and ends
/// the task.
#[cfg(unix)]
async fn signal_task(flags: Arc<ControlFlags>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let install = |kind: SignalKind| {
        signal(kind).map_err(|err| DaemonError::Task {
            task: "signal_handler",
            message: err.to_string(),
        })
    };
    let mut hangup = install(SignalKind::hangup())?;
    let mut terminate = install(SignalKind::terminate())?;
    let mut interrupt = install(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration next cycle");
                flags.request_reconfigure();
            }
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
        }
    }
    tracing::info!("shutdown signal received, stopping after the current cycle");
    flags.request_shutdown();
    Ok(())
}

#[cfg(not(unix))]
async fn signal_task(flags: Arc<ControlFlags>) -> Result<(), DaemonError> {
    tokio::signal::ctrl_c().await.map_err(|err| DaemonError::Task {
        task: "signal_handler",
        message: err.to_string(),
    })?;
    tracing::info!("received ctrl-c, stopping after the current cycle");
    flags.request_shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Appends to the log file, reopening it per event so rotation takes effect
/// immediately.
#[derive(Debug, Clone)]
pub struct AppendFile {
    path: PathBuf,
}

impl AppendFile {
    pub fn create(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        Self::open(path).map_err(|e| io_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }
}

impl<'a> MakeWriter<'a> for AppendFile {
    type Writer = Box<dyn io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match Self::open(&self.path) {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::sink()),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init_tracing(debug: bool, json: bool, log_file: Option<&Path>) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(false);

    // A subscriber that is already installed (tests, embedding) is kept.
    let _ = match (log_file, json) {
        (Some(path), false) => builder
            .with_ansi(false)
            .with_writer(AppendFile::create(path)?)
            .try_init(),
        (Some(path), true) => builder
            .json()
            .with_writer(AppendFile::create(path)?)
            .try_init(),
        (None, false) => builder.with_writer(io::stderr).try_init(),
        (None, true) => builder.json().with_writer(io::stderr).try_init(),
    };
    Ok(())
}
