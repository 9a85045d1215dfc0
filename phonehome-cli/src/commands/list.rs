//! `phonehome list` — spooled messages awaiting redelivery.

use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use phonehome_client::{PendingMessage, Spool};
use phonehome_core::MessageKind;

use super::{format_age, format_time, GlobalArgs};

/// Arguments for `phonehome list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ListJson {
    spool: String,
    pending: Vec<PendingJson>,
    last_sent: Vec<MarkerJson>,
}

#[derive(Serialize)]
struct PendingJson {
    id: String,
    kind: MessageKind,
    bytes: u64,
    modified: Option<String>,
}

#[derive(Serialize)]
struct MarkerJson {
    kind: MessageKind,
    at: Option<String>,
}

#[derive(Tabled)]
struct PendingRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "bytes")]
    bytes: u64,
    #[tabled(rename = "queued")]
    queued: String,
}

impl ListArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let session = global.open_session()?;
        let spool = Spool::for_props(session.props());
        let pending = spool
            .list_pending()
            .with_context(|| format!("failed to read {}", spool.dir().display()))?;
        let mut markers = Vec::new();
        for kind in [MessageKind::Heartbeat, MessageKind::Audit] {
            markers.push((kind, spool.last_sent(kind)?));
        }

        if self.json {
            let payload = ListJson {
                spool: spool.dir().display().to_string(),
                pending: pending.into_iter().map(pending_json).collect(),
                last_sent: markers
                    .into_iter()
                    .map(|(kind, at)| MarkerJson {
                        kind,
                        at: at.map(format_time),
                    })
                    .collect(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize list JSON")?
            );
            return Ok(());
        }

        print_table(&spool, pending, &markers);
        Ok(())
    }
}

fn pending_json(message: PendingMessage) -> PendingJson {
    PendingJson {
        id: message.id,
        kind: message.kind,
        bytes: message.size,
        modified: message.modified.map(format_time),
    }
}

fn print_table(
    spool: &Spool,
    pending: Vec<PendingMessage>,
    markers: &[(MessageKind, Option<SystemTime>)],
) {
    let now = SystemTime::now();
    println!("Spool: {}", spool.dir().display());
    for (kind, at) in markers {
        let when = match at {
            Some(at) => format!("{} ({})", format_time(*at), format_age(*at, now)),
            None => "never".bright_black().to_string(),
        };
        println!("Last {kind}: {when}");
    }

    if pending.is_empty() {
        println!("{}", "No messages awaiting redelivery.".green());
        return;
    }

    println!(
        "{}",
        format!("{} message(s) awaiting redelivery", pending.len())
            .yellow()
            .bold()
    );
    let rows: Vec<PendingRow> = pending
        .into_iter()
        .map(|message| PendingRow {
            id: message.id,
            kind: message.kind.to_string(),
            bytes: message.size,
            queued: message
                .modified
                .map(|at| format_age(at, now))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
