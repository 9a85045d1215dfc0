//! `phonehome unregister`

use anyhow::{Context, Result};

use super::GlobalArgs;

pub fn run(global: &GlobalArgs) -> Result<()> {
    let mut session = global.open_session()?;
    let url = session.props().registered_url().to_string();
    if session.unregister().context("unregistration failed")? {
        println!("✓ unregistered from {url}");
    } else {
        println!("not registered; nothing to do");
    }
    Ok(())
}
