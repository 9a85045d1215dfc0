//! A scripted [`RegistrationProtocol`] for session, spool and scheduler tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use phonehome_core::{
    Credential, FaultEvent, HostIdentity, Message, MessageKind, PhoneHomeError, PropertyStore,
    ProtocolKind, RegistrationRecord, Result,
};
use phonehome_transport::testing::test_keys;
use phonehome_transport::{classify, Outcome, Registration, RegistrationProtocol, SendReceipt};

/// Scripted answer to one `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(u16),
    Refused,
    /// A response carrying the stop-retrying signal.
    Stop,
    /// Fails before any request with a configuration error.
    Misconfigured,
    /// Fails before any request because the client key cannot sign.
    BadKey,
}

#[derive(Debug, Default)]
struct State {
    replies: VecDeque<Reply>,
    sent: Vec<Message>,
    unregister_calls: usize,
}

/// Answers sends from a script (default: 201) and records what reached
/// the wire. Local failures record nothing.
#[derive(Debug, Clone, Default)]
pub struct FakeProtocol {
    state: Arc<Mutex<State>>,
}

impl FakeProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, reply: Reply) {
        self.lock().replies.push_back(reply);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.lock().sent.clone()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.lock().sent.iter().map(|m| m.kind).collect()
    }

    pub fn unregister_calls(&self) -> usize {
        self.lock().unregister_calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RegistrationProtocol for FakeProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Dts
    }

    fn register(
        &self,
        props: &PropertyStore,
        identity: &HostIdentity,
        credential: &Credential,
    ) -> Result<Registration> {
        Ok(Registration {
            record: RegistrationRecord {
                client_id: "fake-client".into(),
                dest_url: props.registered_url().to_string(),
                domain_id: None,
                domain_name: None,
                system_id: identity.system_id.clone(),
                asset_id: identity.asset_id.clone(),
                user_id: credential.user().to_string(),
                message: None,
                code: Some("0".into()),
            },
            keys: test_keys().clone(),
        })
    }

    fn unregister(&self, _props: &PropertyStore) -> Result<()> {
        self.lock().unregister_calls += 1;
        Ok(())
    }

    fn send(&self, _props: &PropertyStore, message: &Message) -> Result<SendReceipt> {
        let mut state = self.lock();
        let status = match state.replies.pop_front().unwrap_or(Reply::Status(201)) {
            Reply::Misconfigured => {
                return Err(PhoneHomeError::Configuration(
                    "unsupported signature digest 'md5'".into(),
                ))
            }
            Reply::BadKey => return Err(PhoneHomeError::Crypto("invalid private key".into())),
            Reply::Refused => {
                state.sent.push(message.clone());
                return Err(PhoneHomeError::Transport("connection refused".into()));
            }
            Reply::Stop => {
                state.sent.push(message.clone());
                return Err(PhoneHomeError::StopRetrying("server asked to stop".into()));
            }
            Reply::Status(status) => status,
        };
        state.sent.push(message.clone());
        match classify(Some(status)) {
            Outcome::Success | Outcome::NoContent => Ok(SendReceipt {
                status,
                bytes: message.len(),
                location: None,
            }),
            Outcome::NoRetry if status == 401 => {
                Err(PhoneHomeError::Authentication("signature rejected".into()))
            }
            outcome => Err(PhoneHomeError::Protocol {
                status,
                message: format!("scripted {status}"),
                retry: outcome == Outcome::Retry,
            }),
        }
    }
}

/// A minimal fault event.
pub fn fault_event(uuid: &str) -> FaultEvent {
    FaultEvent {
        uuid: uuid.to_string(),
        code: "SUN4V-8001-8H".into(),
        severity: "Major".into(),
        summary: "CPU fault".into(),
        description: "A CPU strand was faulted".into(),
        required_action: None,
        component: None,
        payload: None,
        update: false,
    }
}
