//! Typed property store over a flat key/value backend.
//!
//! # Storage layout
//!
//! ```text
//! <root>/etc/phonehome/
//!   phonehome.yaml   (flat string → string mapping, mode 0600)
//! ```
//!
//! Writes go through a `.tmp` sibling, `chmod 0600`, then `rename`, so a
//! reader never observes a half-written file. Empty values are treated as
//! unset by every getter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{io_err, PhoneHomeError, Result};

/// Well-known property names.
pub mod keys {
    pub const ROOT_DIR: &str = "root-dir";
    pub const DATA_DIR: &str = "data-dir";
    pub const DEBUG: &str = "debug";
    pub const TRANSPORT: &str = "transport";
    pub const DEST_URL: &str = "dest-url";
    pub const KEYLEN: &str = "keylen";
    pub const HTTP_TIMEOUT: &str = "http-timeout";
    pub const PROXY_HOST: &str = "proxy-host";
    pub const PROXY_PORT: &str = "proxy-port";
    pub const PROXY_TYPE: &str = "proxy-type";
    pub const PROXY_USER: &str = "proxy-user";
    pub const PROXY_PASS: &str = "proxy-pass";
    pub const SYSTEM_ID: &str = "system-id";
    pub const SITE_ID: &str = "site-id";
    pub const ASSET_ID: &str = "asset-id";
    pub const PRODUCT_ID: &str = "product-id";
    pub const PRODUCT_NAME: &str = "product-name";
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const SIGNING_CAP: &str = "signing-cap";
    pub const SIGNATURE_DIGEST: &str = "signature-digest";
    pub const MAX_MESSAGE_SIZE: &str = "max-message-size";
    pub const HEARTBEAT_INTERVAL: &str = "heartbeat-interval";
    pub const AUDIT_INTERVAL: &str = "audit-interval";
    pub const POLL_INTERVAL: &str = "poll-interval";
    pub const MAX_MESSAGES: &str = "max-messages";
    pub const AUTOREG_USER: &str = "autoreg.user";
    pub const AUTOREG_PASSWORD: &str = "autoreg.password";

    pub const DTS_VIRTUAL_PATH: &str = "dts.virtual-path";
    pub const DTS_QUEUE_ACTIVATION: &str = "dts.queue.activation";
    pub const DTS_QUEUE_AUDIT: &str = "dts.queue.audit";
    pub const DTS_QUEUE_HEARTBEAT: &str = "dts.queue.heartbeat";
    pub const DTS_QUEUE_EVENT: &str = "dts.queue.event";
    pub const DTS_QUEUE_ADMIN: &str = "dts.queue.admin";
    pub const DTS_QUEUE_DEFAULT: &str = "dts.queue.default";

    pub const REG_CLIENT_ID: &str = "reg.client-id";
    pub const REG_CODE: &str = "reg.code";
    pub const REG_DOMAIN_ID: &str = "reg.domain-id";
    pub const REG_DOMAIN_NAME: &str = "reg.domain-name";
    pub const REG_MESSAGE: &str = "reg.message";
    pub const REG_MSG_KEY: &str = "reg.msg-key";
    pub const REG_PUB_KEY: &str = "reg.pub-key";
    pub const REG_SYSTEM_ID: &str = "reg.system-id";
    pub const REG_ASSET_ID: &str = "reg.asset-id";
    pub const REG_URL: &str = "reg.url";
    pub const REG_USER_ID: &str = "reg.user-id";

    /// Every registration property, cleared together on unregister.
    pub const REGISTRATION: [&str; 11] = [
        REG_CLIENT_ID,
        REG_CODE,
        REG_DOMAIN_ID,
        REG_DOMAIN_NAME,
        REG_MESSAGE,
        REG_MSG_KEY,
        REG_PUB_KEY,
        REG_SYSTEM_ID,
        REG_ASSET_ID,
        REG_URL,
        REG_USER_ID,
    ];
}

/// Default values for properties that have one.
pub mod defaults {
    pub const ROOT_DIR: &str = "/";
    pub const DATA_DIR: &str = "var/phonehome";
    pub const DEST_URL: &str = "https://transport.oracle.com";
    pub const KEYLEN: u64 = 2048;
    pub const HTTP_TIMEOUT_SECS: u64 = 30;
    pub const PROXY_PORT: &str = "8080";
    pub const SCHEMA_VERSION: &str = "2.0";
    pub const SIGNING_CAP: u64 = 100_000;
    pub const MAX_MESSAGE_SIZE: u64 = 5_000_000;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 24 * 60 * 60;
    pub const AUDIT_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
    pub const POLL_INTERVAL_SECS: u64 = 60;
    pub const MAX_MESSAGES: u64 = 10;
    pub const PRODUCT_NAME: &str = "Solaris";
    pub const DTS_VIRTUAL_PATH: &str = "/v1";
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Persistence for the raw property map.
pub trait PropertyBackend: Send {
    fn load(&self) -> Result<BTreeMap<String, String>>;
    fn save(&self, values: &BTreeMap<String, String>) -> Result<()>;
    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;
}

/// Flat YAML file backend.
#[derive(Debug, Clone)]
pub struct YamlFileBackend {
    path: PathBuf,
}

impl YamlFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PropertyBackend for YamlFileBackend {
    /// A missing file is an empty store.
    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_yaml::from_str(&contents).map_err(|source| PhoneHomeError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                set_dir_permissions(parent)?;
            }
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "phonehome.yaml".to_string());
        let tmp = self.path.with_file_name(format!("{file_name}.tmp"));

        let yaml = serde_yaml::to_string(values)?;
        let written = std::fs::write(&tmp, yaml)
            .map_err(|e| io_err(&tmp, e))
            .and_then(|()| set_file_permissions(&tmp))
            .and_then(|()| std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e)));
        if let Err(err) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        tracing::debug!("wrote properties: {}", self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Volatile backend; `save` is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    initial: BTreeMap<String, String>,
}

impl PropertyBackend for MemoryBackend {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.initial.clone())
    }

    fn save(&self, _values: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}

// ---------------------------------------------------------------------------
// PropertyStore
// ---------------------------------------------------------------------------

/// Property map plus the backend it was loaded from.
pub struct PropertyStore {
    values: BTreeMap<String, String>,
    backend: Box<dyn PropertyBackend>,
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("backend", &self.backend.describe())
            .field("len", &self.values.len())
            .finish()
    }
}

impl PropertyStore {
    /// Loads the store from `backend`.
    pub fn open(backend: Box<dyn PropertyBackend>) -> Result<Self> {
        let values = backend.load()?;
        Ok(Self { values, backend })
    }

    /// Loads the YAML file at `path` (missing file = empty store).
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Box::new(YamlFileBackend::new(path)))
    }

    /// In-memory store seeded with `pairs`.
    pub fn in_memory<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let initial: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: initial.clone(),
            backend: Box::new(MemoryBackend { initial }),
        }
    }

    /// Re-reads the backend, discarding unsaved changes.
    pub fn reload(&mut self) -> Result<()> {
        self.values = self.backend.load()?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.backend.save(&self.values)
    }

    pub fn location(&self) -> String {
        self.backend.describe()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // -----------------------------------------------------------------------
    // Getters
    // -----------------------------------------------------------------------

    /// Value of `name`; empty strings count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Required property; missing is a configuration error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| PhoneHomeError::Configuration(format!("property {name} not set")))
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name).map(str::trim) {
            None => default,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v == "yes" => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v == "no" => false,
            Some(v) => {
                tracing::warn!("error parsing {name} ({v}); using default value {default}");
                default
            }
        }
    }

    /// Unsigned integer property; an unparsable value logs and falls back.
    pub fn get_u64(&self, name: &str, default: u64) -> u64 {
        match self.get(name) {
            None => default,
            Some(v) => v.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("error parsing {name} ({v}); using default value {default}");
                default
            }),
        }
    }

    pub fn get_duration_secs(&self, name: &str, default_secs: u64) -> Duration {
        Duration::from_secs(self.get_u64(name, default_secs))
    }

    /// Path property prefixed with `root-dir`. Falls back to `default`
    /// when unset; `None` only when both are absent.
    pub fn get_path(&self, name: &str, default: Option<&str>) -> Option<PathBuf> {
        let file = self.get(name).or(default).filter(|f| !f.is_empty())?;
        Some(self.rooted(file))
    }

    /// Joins `file` onto `root-dir`, treating absolute `file` as root-relative.
    pub fn rooted(&self, file: &str) -> PathBuf {
        let root = Path::new(self.get_or(keys::ROOT_DIR, defaults::ROOT_DIR));
        root.join(file.trim_start_matches('/'))
    }

    pub fn debug(&self) -> bool {
        self.get_bool(keys::DEBUG, false)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.get_path(keys::DATA_DIR, Some(defaults::DATA_DIR))
            .unwrap_or_else(|| self.rooted(defaults::DATA_DIR))
    }

    pub fn keylen(&self) -> u64 {
        self.get_u64(keys::KEYLEN, defaults::KEYLEN)
    }

    pub fn http_timeout(&self) -> Duration {
        self.get_duration_secs(keys::HTTP_TIMEOUT, defaults::HTTP_TIMEOUT_SECS)
    }

    pub fn signing_cap(&self) -> usize {
        usize::try_from(self.get_u64(keys::SIGNING_CAP, defaults::SIGNING_CAP))
            .unwrap_or(usize::MAX)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get(keys::REG_CLIENT_ID)
    }

    pub fn is_registered(&self) -> bool {
        self.client_id().is_some()
    }

    /// URL saved at registration, else the configured destination.
    pub fn registered_url(&self) -> &str {
        self.get(keys::REG_URL)
            .unwrap_or_else(|| self.get_or(keys::DEST_URL, defaults::DEST_URL))
    }

    // -----------------------------------------------------------------------
    // Setters
    // -----------------------------------------------------------------------

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Sets `name` when `value` is `Some`, blanks it otherwise.
    pub fn set_opt(&mut self, name: &str, value: Option<&str>) {
        self.set(name, value.unwrap_or_default());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    /// Blanks every `reg.*` property.
    pub fn clear_registration(&mut self) {
        for name in keys::REGISTRATION {
            self.set(name, "");
        }
    }

    /// The asset id, generating and storing a fresh UUID when neither
    /// `asset-id` nor `reg.asset-id` is set.
    pub fn asset_id(&mut self) -> String {
        if let Some(id) = self.get(keys::ASSET_ID).or_else(|| self.get(keys::REG_ASSET_ID)) {
            return id.to_string();
        }
        let generated = uuid::Uuid::new_v4().to_string();
        tracing::debug!("generated asset id {generated}");
        self.set(keys::ASSET_ID, generated.clone());
        generated
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_values_read_as_unset() {
        let props = PropertyStore::in_memory([(keys::PROXY_HOST, ""), (keys::DEBUG, "true")]);
        assert_eq!(props.get(keys::PROXY_HOST), None);
        assert_eq!(props.get_or(keys::PROXY_HOST, "none"), "none");
        assert!(props.debug());
    }

    #[test]
    fn unparsable_numbers_fall_back_to_default() {
        let props = PropertyStore::in_memory([(keys::KEYLEN, "lots"), (keys::HTTP_TIMEOUT, "45")]);
        assert_eq!(props.keylen(), defaults::KEYLEN);
        assert_eq!(props.http_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn paths_are_rooted() {
        let props = PropertyStore::in_memory([(keys::ROOT_DIR, "/a/root")]);
        assert_eq!(props.data_dir(), PathBuf::from("/a/root/var/phonehome"));
        assert_eq!(
            props.get_path("missing", Some("/etc/x")),
            Some(PathBuf::from("/a/root/etc/x"))
        );
        assert_eq!(props.get_path("missing", None), None);
    }

    #[test]
    fn asset_id_is_generated_once() {
        let mut props = PropertyStore::in_memory(Vec::<(String, String)>::new());
        let first = props.asset_id();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_eq!(props.asset_id(), first);
    }

    #[test]
    fn asset_id_prefers_registered_value() {
        let mut props = PropertyStore::in_memory([(keys::REG_ASSET_ID, "reg-asset")]);
        assert_eq!(props.asset_id(), "reg-asset");
    }

    #[test]
    fn clear_registration_blanks_every_reg_key() {
        let mut props = PropertyStore::in_memory([
            (keys::REG_CLIENT_ID, "c-1"),
            (keys::REG_URL, "https://example"),
            (keys::DEST_URL, "https://dest"),
        ]);
        assert!(props.is_registered());
        assert_eq!(props.registered_url(), "https://example");
        props.clear_registration();
        assert!(!props.is_registered());
        assert_eq!(props.registered_url(), "https://dest");
    }

    #[test]
    fn file_backend_round_trip_and_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc").join("phonehome.yaml");
        let mut props = PropertyStore::open_file(&path).unwrap();
        props.set(keys::SYSTEM_ID, "SN123");
        props.save().unwrap();

        let reloaded = PropertyStore::open_file(&path).unwrap();
        assert_eq!(reloaded.get(keys::SYSTEM_ID), Some("SN123"));
        assert!(!path.with_file_name("phonehome.yaml.tmp").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn reload_discards_unsaved_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("phonehome.yaml");
        std::fs::write(&path, "system-id: SAVED\n").unwrap();
        let mut props = PropertyStore::open_file(&path).unwrap();
        props.set(keys::SYSTEM_ID, "UNSAVED");
        props.reload().unwrap();
        assert_eq!(props.get(keys::SYSTEM_ID), Some("SAVED"));
    }
}
