//! `phonehome register`

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use clap::Args;

use phonehome_core::props::keys;
use phonehome_core::{Credential, ProtocolKind};

use super::GlobalArgs;

/// Arguments for `phonehome register`.
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Support account user name.
    #[arg(short, long)]
    pub user: String,

    /// Account password; read from the first line of stdin when omitted.
    #[arg(short, long)]
    pub password: Option<String>,

    /// Registration endpoint, saved as `dest-url`.
    #[arg(long)]
    pub url: Option<String>,

    /// Wire protocol, saved as `transport`.
    #[arg(long, value_name = "dts|scrk")]
    pub transport: Option<ProtocolKind>,
}

impl RegisterArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let mut session = global.open_session()?;

        if self.url.is_some() || self.transport.is_some() {
            let props = session.props_mut();
            if let Some(url) = &self.url {
                props.set(keys::DEST_URL, url.as_str());
            }
            if let Some(transport) = self.transport {
                props.set(keys::TRANSPORT, transport.to_string());
            }
            props.save().context("failed to save registration endpoint")?;
            session.reload()?;
        }

        let password = match self.password {
            Some(password) => password,
            None => read_password()?,
        };
        let record = session
            .register(Credential::new(self.user, password))
            .context("registration failed")?;

        println!(
            "✓ registered with {} as client {}",
            record.dest_url, record.client_id
        );
        Ok(())
    }
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given (use -p or pipe it on stdin)");
    }
    Ok(password)
}
