//! A property store bound to one wire protocol.
//!
//! Creating or tearing down a session, registering and unregistering all
//! take the process-wide [`session_lock`]. The lock is never held across a
//! message send.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use phonehome_core::props::{keys, PropertyStore};
use phonehome_core::{
    Credential, FaultEvent, HostIdentity, Message, MessageBuilder, MessageKind, PhoneHomeError,
    ProtocolKind, RegistrationRecord, Result,
};
use phonehome_transport::protocol::registered_note;
use phonehome_transport::{select, Registration, RegistrationProtocol, SendReceipt, TransportClient};

static SESSION_LOCK: Mutex<()> = Mutex::new(());

/// Serializes session setup/teardown against out-of-band readers of the
/// registration state.
pub fn session_lock() -> MutexGuard<'static, ()> {
    SESSION_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Kind-specific inputs for [`Session::build_message`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub email: Option<String>,
    pub online: bool,
    pub maintenance: bool,
    pub method: Option<String>,
    pub event: Option<FaultEvent>,
    pub at: Option<DateTime<Utc>>,
}

pub struct Session {
    props: PropertyStore,
    protocol: Box<dyn RegistrationProtocol>,
    /// Rebuilds the protocol on reload; `None` keeps an injected protocol.
    client: Option<TransportClient>,
    root_override: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("props", &self.props)
            .field("protocol", &self.protocol.kind())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens the property file at `config`, optionally under an alternate
    /// root, and binds the configured protocol over the real HTTP engine.
    pub fn open(config: &Path, root: Option<&Path>) -> Result<Self> {
        let _guard = session_lock();
        let mut props = PropertyStore::open_file(config)?;
        if let Some(root) = root {
            props.set(keys::ROOT_DIR, root.to_string_lossy());
        }
        let client = TransportClient::default();
        let protocol = select(&props, client.clone())?;
        tracing::debug!(config = %config.display(), transport = %protocol.kind(), "session opened");
        Ok(Self {
            props,
            protocol,
            client: Some(client),
            root_override: root.map(Path::to_path_buf),
        })
    }

    /// A session over an explicit store and protocol.
    pub fn with_protocol(props: PropertyStore, protocol: Box<dyn RegistrationProtocol>) -> Self {
        Self {
            props,
            protocol,
            client: None,
            root_override: None,
        }
    }

    pub fn props(&self) -> &PropertyStore {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut PropertyStore {
        &mut self.props
    }

    pub fn protocol_kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    /// Re-reads the property store and rebinds the protocol.
    pub fn reload(&mut self) -> Result<()> {
        let _guard = session_lock();
        self.props.reload()?;
        if let Some(root) = &self.root_override {
            self.props.set(keys::ROOT_DIR, root.to_string_lossy());
        }
        if let Some(client) = &self.client {
            self.protocol = select(&self.props, client.clone())?;
        }
        Ok(())
    }

    /// Live host identity; derived defaults are written back into the store.
    pub fn identity(&mut self) -> Result<HostIdentity> {
        HostIdentity::resolve(&mut self.props)
    }

    pub fn is_registered(&self) -> bool {
        self.props.is_registered()
    }

    /// Fails when the stored registration was made for another system.
    pub fn validate_registration(&mut self) -> Result<()> {
        let Some(registered) = self.props.get(keys::REG_SYSTEM_ID).map(str::to_string) else {
            return Ok(());
        };
        if !self.is_registered() {
            return Ok(());
        }
        let live = self.identity()?.system_id;
        if registered != live {
            return Err(PhoneHomeError::RegistrationMismatch { registered, live });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers this host, saves the `reg.*` properties, then sends an
    /// activation message. A failed activation is logged, not returned.
    pub fn register(&mut self, credential: Credential) -> Result<RegistrationRecord> {
        let record = {
            let _guard = session_lock();
            let identity = self.identity()?;
            let registration = self.protocol.register(&self.props, &identity, &credential)?;
            apply_registration(&mut self.props, &registration, Utc::now());
            self.props.save()?;
            registration.record
        };
        tracing::info!(
            client_id = %record.client_id,
            url = %record.dest_url,
            "registered {}",
            record.user_id
        );

        match self
            .build_message(MessageKind::Activate, &BuildOptions::default())
            .and_then(|message| self.send(&message))
        {
            Ok(_) => tracing::info!("activation message sent"),
            Err(err) => tracing::warn!("activation message failed: {err}"),
        }
        Ok(record)
    }

    /// Sends a deactivation message, revokes the registration and blanks the
    /// `reg.*` properties. Returns `false` when there was nothing to undo.
    pub fn unregister(&mut self) -> Result<bool> {
        if !self.is_registered() {
            tracing::info!("not registered; nothing to unregister");
            return Ok(false);
        }
        match self
            .build_message(MessageKind::Deactivate, &BuildOptions::default())
            .and_then(|message| self.send(&message))
        {
            Ok(_) => tracing::info!("deactivation message sent"),
            Err(err) => tracing::warn!("deactivation message failed: {err}"),
        }

        let _guard = session_lock();
        self.protocol.unregister(&self.props)?;
        self.props.clear_registration();
        self.props.save()?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn message_builder(&mut self, at: Option<DateTime<Utc>>) -> Result<MessageBuilder> {
        let identity = self.identity()?;
        let builder = MessageBuilder::new(identity, &self.props);
        Ok(match at {
            Some(at) => builder.at(at),
            None => builder,
        })
    }

    pub fn build_message(&mut self, kind: MessageKind, options: &BuildOptions) -> Result<Message> {
        let builder = self.message_builder(options.at)?;
        match kind {
            MessageKind::Activate => builder.activate(),
            MessageKind::Deactivate => builder.deactivate(),
            MessageKind::Heartbeat => builder.heartbeat(),
            MessageKind::Audit => builder.audit(),
            MessageKind::Status => builder.status(options.method.as_deref().unwrap_or("status")),
            MessageKind::StateChange => builder.state_change(options.online, options.maintenance),
            MessageKind::Test => builder.test(options.email.as_deref().unwrap_or_default()),
            MessageKind::Fault | MessageKind::EventUpdate => {
                let mut event = options.event.clone().ok_or_else(|| {
                    PhoneHomeError::Configuration(format!("{kind} message requires an event"))
                })?;
                event.update = kind == MessageKind::EventUpdate;
                builder.fault(&event)
            }
        }
    }

    /// Transmits `message` over the bound protocol.
    pub fn send(&self, message: &Message) -> Result<SendReceipt> {
        self.protocol.send(&self.props, message)
    }
}

/// Copies a completed registration into the `reg.*` properties.
pub fn apply_registration(props: &mut PropertyStore, registration: &Registration, now: DateTime<Utc>) {
    let record = &registration.record;
    props.set(keys::REG_CLIENT_ID, record.client_id.clone());
    props.set(keys::REG_CODE, record.code.clone().unwrap_or_else(|| "0".into()));
    props.set_opt(keys::REG_DOMAIN_ID, record.domain_id.as_deref());
    props.set_opt(keys::REG_DOMAIN_NAME, record.domain_name.as_deref());
    props.set(
        keys::REG_MESSAGE,
        record.message.clone().unwrap_or_else(|| registered_note(now)),
    );
    props.set(keys::REG_MSG_KEY, registration.keys.private_pem.as_str());
    props.set(keys::REG_PUB_KEY, registration.keys.public_pem.clone());
    props.set(keys::REG_SYSTEM_ID, record.system_id.clone());
    props.set(keys::REG_ASSET_ID, record.asset_id.clone());
    props.set(keys::REG_URL, record.dest_url.clone());
    props.set(keys::REG_USER_ID, record.user_id.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProtocol, Reply};
    use phonehome_transport::testing::registered_store;

    #[test]
    fn register_persists_record_and_sends_activation() {
        let fake = FakeProtocol::new();
        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("phonehome.yaml");
        let mut props = PropertyStore::open_file(&config).unwrap();
        props.set(keys::ASSET_ID, "asset-1");
        let mut session = Session::with_protocol(props, Box::new(fake.clone()));

        let record = session.register(Credential::new("ops", "secret")).unwrap();
        assert_eq!(record.client_id, "fake-client");

        let saved = PropertyStore::open_file(&config).unwrap();
        assert_eq!(saved.client_id(), Some("fake-client"));
        assert_eq!(saved.get(keys::REG_USER_ID), Some("ops"));
        assert_eq!(saved.get(keys::REG_SYSTEM_ID), Some("asset-1"));
        assert!(saved.get(keys::REG_MESSAGE).unwrap().starts_with("Registered "));
        assert!(saved.get(keys::REG_MSG_KEY).unwrap().contains("PRIVATE KEY"));
        assert_eq!(fake.sent_kinds(), [MessageKind::Activate]);
    }

    #[test]
    fn failed_activation_does_not_fail_registration() {
        let fake = FakeProtocol::new();
        fake.script(Reply::Refused);
        let props = PropertyStore::in_memory([(keys::ASSET_ID, "asset-1")]);
        let mut session = Session::with_protocol(props, Box::new(fake.clone()));
        assert!(session.register(Credential::new("ops", "secret")).is_ok());
        assert!(session.is_registered());
    }

    #[test]
    fn unregister_when_unregistered_is_a_noop() {
        let fake = FakeProtocol::new();
        let props = PropertyStore::in_memory(Vec::<(String, String)>::new());
        let mut session = Session::with_protocol(props, Box::new(fake.clone()));
        assert!(!session.unregister().unwrap());
        assert!(fake.sent_kinds().is_empty());
        assert_eq!(fake.unregister_calls(), 0);
    }

    #[test]
    fn unregister_deactivates_then_clears() {
        let fake = FakeProtocol::new();
        let mut session =
            Session::with_protocol(registered_store("https://t.example"), Box::new(fake.clone()));
        assert!(session.unregister().unwrap());
        assert_eq!(fake.sent_kinds(), [MessageKind::Deactivate]);
        assert_eq!(fake.unregister_calls(), 1);
        assert!(!session.is_registered());
        assert_eq!(session.props().get(keys::REG_MSG_KEY), None);
    }

    #[test]
    fn registration_for_another_system_is_a_mismatch() {
        let mut props = registered_store("https://t.example");
        props.set(keys::SYSTEM_ID, "SN-OTHER");
        let mut session = Session::with_protocol(props, Box::new(FakeProtocol::new()));
        let err = session.validate_registration().unwrap_err();
        assert!(matches!(err, PhoneHomeError::RegistrationMismatch { .. }));
        assert!(err.is_fatal());

        let mut session =
            Session::with_protocol(registered_store("https://t.example"), Box::new(FakeProtocol::new()));
        session.validate_registration().unwrap();
    }

    #[test]
    fn fault_messages_need_an_event() {
        let mut session =
            Session::with_protocol(registered_store("https://t.example"), Box::new(FakeProtocol::new()));
        let err = session
            .build_message(MessageKind::Fault, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, PhoneHomeError::Configuration(_)));

        let options = BuildOptions {
            event: Some(crate::testing::fault_event("ev-1")),
            ..BuildOptions::default()
        };
        let update = session
            .build_message(MessageKind::EventUpdate, &options)
            .unwrap();
        assert_eq!(update.kind, MessageKind::EventUpdate);
    }
}
