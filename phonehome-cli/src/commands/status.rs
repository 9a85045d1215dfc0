//! `phonehome status` — registration and delivery state.

use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use phonehome_client::Spool;
use phonehome_core::props::keys;
use phonehome_core::signer::fingerprint;
use phonehome_core::{MessageKind, ProtocolKind};

use super::{format_age, format_time, GlobalArgs};

/// Arguments for `phonehome status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatusJson {
    config: String,
    transport: ProtocolKind,
    registered: bool,
    client_id: Option<String>,
    url: String,
    user: Option<String>,
    domain: Option<String>,
    system_id: Option<String>,
    asset_id: Option<String>,
    key_fingerprint: Option<String>,
    message: Option<String>,
    pending: usize,
    last_heartbeat: Option<String>,
    last_audit: Option<String>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "property")]
    name: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

impl StatusArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let session = global.open_session()?;
        let props = session.props();
        let spool = Spool::for_props(props);
        let pending = spool
            .list_pending()
            .with_context(|| format!("failed to read {}", spool.dir().display()))?
            .len();
        let heartbeat = spool.last_sent(MessageKind::Heartbeat)?;
        let audit = spool.last_sent(MessageKind::Audit)?;
        let owned = |name: &str| props.get(name).map(str::to_string);

        let status = StatusJson {
            config: props.location(),
            transport: session.protocol_kind(),
            registered: session.is_registered(),
            client_id: owned(keys::REG_CLIENT_ID),
            url: props.registered_url().to_string(),
            user: owned(keys::REG_USER_ID),
            domain: owned(keys::REG_DOMAIN_NAME),
            system_id: owned(keys::REG_SYSTEM_ID).or_else(|| owned(keys::SYSTEM_ID)),
            asset_id: owned(keys::REG_ASSET_ID).or_else(|| owned(keys::ASSET_ID)),
            key_fingerprint: props.get(keys::REG_PUB_KEY).map(fingerprint),
            message: owned(keys::REG_MESSAGE),
            pending,
            last_heartbeat: heartbeat.map(format_time),
            last_audit: audit.map(format_time),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(status, heartbeat, audit);
        Ok(())
    }
}

fn print_table(status: StatusJson, heartbeat: Option<SystemTime>, audit: Option<SystemTime>) {
    let now = SystemTime::now();
    let headline = if status.registered {
        "■ REGISTERED".green().bold()
    } else {
        "■ NOT REGISTERED".red().bold()
    };
    println!("phonehome v{} | {headline}", env!("CARGO_PKG_VERSION"));

    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    let when = |at: Option<SystemTime>| match at {
        Some(at) => format!("{} ({})", format_time(at), format_age(at, now)),
        None => "never".to_string(),
    };
    let rows = vec![
        StatusRow { name: "config", value: status.config },
        StatusRow { name: "transport", value: status.transport.to_string() },
        StatusRow { name: "client id", value: or_dash(status.client_id) },
        StatusRow { name: "url", value: status.url },
        StatusRow { name: "user", value: or_dash(status.user) },
        StatusRow { name: "domain", value: or_dash(status.domain) },
        StatusRow { name: "system id", value: or_dash(status.system_id) },
        StatusRow { name: "asset id", value: or_dash(status.asset_id) },
        StatusRow { name: "key fingerprint", value: or_dash(status.key_fingerprint) },
        StatusRow { name: "message", value: or_dash(status.message) },
        StatusRow { name: "pending", value: status.pending.to_string() },
        StatusRow { name: "last heartbeat", value: when(heartbeat) },
        StatusRow { name: "last audit", value: when(audit) },
    ];
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if status.pending > 0 {
        println!("Run 'phonehome list' to see messages awaiting redelivery.");
    }
}
