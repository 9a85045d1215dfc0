//! The registration/send contract shared by both wire protocols.

use phonehome_core::props::{keys, PropertyStore};
use phonehome_core::{
    Credential, DigestAlgorithm, HostIdentity, KeyMaterial, Message, PhoneHomeError,
    ProtocolKind, RegistrationRecord, Result, Signer,
};

use crate::dts::DtsProtocol;
use crate::http::TransportClient;
use crate::scrk::ScrkProtocol;

/// A message accepted by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub status: u16,
    pub bytes: usize,
    /// Server-assigned location of the stored message, when reported.
    pub location: Option<String>,
}

/// A completed registration: what to persist plus the new signing identity.
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: RegistrationRecord,
    pub keys: KeyMaterial,
}

/// One wire protocol. Selected once per session from the `transport`
/// property; see [`select`].
pub trait RegistrationProtocol: Send {
    fn kind(&self) -> ProtocolKind;

    /// Generates a key pair and registers it using `credential`.
    fn register(
        &self,
        props: &PropertyStore,
        identity: &HostIdentity,
        credential: &Credential,
    ) -> Result<Registration>;

    /// Revokes the registration stored in `props`.
    fn unregister(&self, props: &PropertyStore) -> Result<()>;

    /// Transmits one message with the stored signing identity.
    ///
    /// Failures carry their retry class: see
    /// [`PhoneHomeError::is_retryable`] and [`PhoneHomeError::is_fatal`].
    fn send(&self, props: &PropertyStore, message: &Message) -> Result<SendReceipt>;
}

/// Builds the protocol named by the `transport` property (default `dts`).
pub fn select(
    props: &PropertyStore,
    client: TransportClient,
) -> Result<Box<dyn RegistrationProtocol>> {
    let kind = match props.get(keys::TRANSPORT) {
        Some(name) => name
            .parse::<ProtocolKind>()
            .map_err(PhoneHomeError::Configuration)?,
        None => ProtocolKind::default(),
    };
    tracing::debug!(transport = %kind, "selected transport");
    Ok(match kind {
        ProtocolKind::Dts => Box::new(DtsProtocol::new(client)),
        ProtocolKind::Scrk => Box::new(ScrkProtocol::new(client)),
    })
}

/// Signer over the registered private key.
pub fn signer_from_props(props: &PropertyStore) -> Result<Signer> {
    let pem = props
        .get(keys::REG_MSG_KEY)
        .ok_or(PhoneHomeError::NotRegistered)?;
    let digest = match props.get(keys::SIGNATURE_DIGEST) {
        Some(name) => name.parse::<DigestAlgorithm>()?,
        None => DigestAlgorithm::default(),
    };
    Signer::from_pem(pem, digest)
}

/// The registered client id, or [`PhoneHomeError::NotRegistered`].
pub fn client_id(props: &PropertyStore) -> Result<&str> {
    props.client_id().ok_or(PhoneHomeError::NotRegistered)
}

/// `Registered <time>` note stored when the server sends no message.
pub fn registered_note(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("Registered {}", now.format("%Y-%m-%d %H:%M:%S UTC"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::ScriptedEngine;

    fn client() -> TransportClient {
        TransportClient::new(Arc::new(ScriptedEngine::new()))
    }

    #[test]
    fn selects_dts_by_default_and_scrk_on_request() {
        let props = PropertyStore::in_memory(Vec::<(String, String)>::new());
        assert_eq!(select(&props, client()).unwrap().kind(), ProtocolKind::Dts);

        let props = PropertyStore::in_memory([(keys::TRANSPORT, "SCRK")]);
        assert_eq!(select(&props, client()).unwrap().kind(), ProtocolKind::Scrk);

        let props = PropertyStore::in_memory([(keys::TRANSPORT, "smoke-signals")]);
        assert!(matches!(
            select(&props, client()),
            Err(PhoneHomeError::Configuration(_))
        ));
    }

    #[test]
    fn signer_requires_registration() {
        let props = PropertyStore::in_memory(Vec::<(String, String)>::new());
        assert!(matches!(
            signer_from_props(&props),
            Err(PhoneHomeError::NotRegistered)
        ));
        assert!(matches!(client_id(&props), Err(PhoneHomeError::NotRegistered)));
    }

    #[test]
    fn unknown_digest_is_a_configuration_error() {
        let props = PropertyStore::in_memory([
            (keys::REG_MSG_KEY, "irrelevant"),
            (keys::SIGNATURE_DIGEST, "md5"),
        ]);
        assert!(matches!(
            signer_from_props(&props),
            Err(PhoneHomeError::Configuration(_))
        ));
    }
}
