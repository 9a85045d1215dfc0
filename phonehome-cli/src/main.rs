//! phonehome — register this host and deliver telemetry to the support service.
//!
//! # Usage
//!
//! ```text
//! phonehome [-c <config>] [-R <altroot>] [-d] [-f] <command>
//!
//! phonehome register -u <user> [-p <password>] [--url <url>] [--transport dts|scrk]
//! phonehome unregister
//! phonehome send <kind> [--email <addr>] [--online] [--maintenance]
//!                       [--method <name>] [--event <file.json>] [--queue] [--dry-run]
//! phonehome list [--json]
//! phonehome status [--json]
//! phonehome daemon [--once] [--json]
//! ```
//!
//! Exit codes: 0 success, 1 fatal error, 2 configuration error,
//! 3 permission error.

mod commands;

use std::io::ErrorKind;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonArgs, list::ListArgs, register::RegisterArgs, send::SendArgs,
    status::StatusArgs, GlobalArgs,
};
use phonehome_core::PhoneHomeError;
use phonehome_daemon::DaemonError;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "phonehome",
    version,
    about = "Register this host and send telemetry to the support service",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register this host and generate its signing key pair.
    Register(RegisterArgs),

    /// Deactivate and revoke the current registration.
    Unregister,

    /// Build and send one message.
    Send(SendArgs),

    /// List spooled messages and periodic send markers.
    List(ListArgs),

    /// Show registration and delivery state.
    Status(StatusArgs),

    /// Run the polling scheduler.
    Daemon(DaemonArgs),
}

impl Cli {
    fn run(self) -> Result<()> {
        if !matches!(self.command, Commands::Daemon(_)) {
            commands::init_logging(self.global.debug);
        }
        match self.command {
            Commands::Register(args) => args.run(&self.global),
            Commands::Unregister => commands::unregister::run(&self.global),
            Commands::Send(args) => args.run(&self.global),
            Commands::List(args) => args.run(&self.global),
            Commands::Status(args) => args.run(&self.global),
            Commands::Daemon(args) => args.run(&self.global),
        }
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_PERMISSION: u8 = 3;

/// Maps the first recognised cause in the chain to an exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<PhoneHomeError>() {
            return phonehome_exit_code(err);
        }
        if let Some(err) = cause.downcast_ref::<DaemonError>() {
            return match err {
                DaemonError::PhoneHome(inner) => phonehome_exit_code(inner),
                DaemonError::Io { source, .. } => io_exit_code(source),
                DaemonError::Event { .. } => EXIT_CONFIG,
                _ => EXIT_FATAL,
            };
        }
        if let Some(err) = cause.downcast_ref::<std::io::Error>() {
            return io_exit_code(err);
        }
    }
    EXIT_FATAL
}

fn phonehome_exit_code(err: &PhoneHomeError) -> u8 {
    match err {
        PhoneHomeError::Configuration(_)
        | PhoneHomeError::Parse { .. }
        | PhoneHomeError::NotRegistered
        | PhoneHomeError::RegistrationMismatch { .. } => EXIT_CONFIG,
        PhoneHomeError::Persistence { source, .. } => io_exit_code(source),
        _ => EXIT_FATAL,
    }
}

fn io_exit_code(err: &std::io::Error) -> u8 {
    if err.kind() == ErrorKind::PermissionDenied {
        EXIT_PERMISSION
    } else {
        EXIT_FATAL
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("phonehome: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
