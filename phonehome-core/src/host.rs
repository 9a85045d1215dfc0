//! Host identity used in every message header.

use serde::Serialize;

use crate::error::{PhoneHomeError, Result};
use crate::props::{defaults, keys, PropertyStore};

/// Identity fields written into message headers and registration payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    pub host_id: String,
    pub system_id: String,
    pub site_id: String,
    pub asset_id: String,
    pub product_id: String,
    pub product_name: String,
}

impl HostIdentity {
    /// Resolves the identity from configuration, falling back to host facts.
    ///
    /// The system id is the configured `system-id`, else the asset id.
    /// Product id defaults to the product name. Newly derived values are
    /// written back into `props` so later lookups agree.
    pub fn resolve(props: &mut PropertyStore) -> Result<Self> {
        let asset_id = props.asset_id();
        let host_id = hostname();

        let system_id = match props.get(keys::SYSTEM_ID) {
            Some(id) if id != "0" => id.to_string(),
            _ => {
                props.set(keys::SYSTEM_ID, asset_id.clone());
                asset_id.clone()
            }
        };
        let site_id = props.get_or(keys::SITE_ID, &system_id).to_string();
        let product_name = match props.get(keys::PRODUCT_NAME) {
            Some(name) => name.to_string(),
            None => {
                props.set(keys::PRODUCT_NAME, defaults::PRODUCT_NAME);
                defaults::PRODUCT_NAME.to_string()
            }
        };
        let product_id = match props.get(keys::PRODUCT_ID) {
            Some(id) => id.to_string(),
            None => {
                props.set(keys::PRODUCT_ID, product_name.clone());
                product_name.clone()
            }
        };

        if system_id.is_empty() {
            return Err(PhoneHomeError::Configuration(
                "failed to determine system id".into(),
            ));
        }

        Ok(Self {
            host_id,
            system_id,
            site_id,
            asset_id,
            product_id,
            product_name,
        })
    }
}

/// The node name of this host, or `localhost` when it cannot be read.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Operating system release string for schema 2.1 headers.
pub fn system_version() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => format!(
            "{} {}",
            uts.release().to_string_lossy(),
            uts.version().to_string_lossy()
        ),
        Err(_) => std::env::consts::OS.to_string(),
    }
}
