//! Core domain types for phonehome.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The kind of an outbound telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Activate,
    Deactivate,
    Heartbeat,
    Audit,
    Fault,
    Test,
    Status,
    EventUpdate,
    StateChange,
}

/// Server-side queue category a message kind is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCategory {
    Activation,
    Audit,
    Heartbeat,
    Event,
    Admin,
    Default,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Activate,
        MessageKind::Deactivate,
        MessageKind::Heartbeat,
        MessageKind::Audit,
        MessageKind::Fault,
        MessageKind::Test,
        MessageKind::Status,
        MessageKind::EventUpdate,
        MessageKind::StateChange,
    ];

    /// Kebab-case name used on the command line and in spool file names.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Activate => "activate",
            MessageKind::Deactivate => "deactivate",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Audit => "audit",
            MessageKind::Fault => "fault",
            MessageKind::Test => "test",
            MessageKind::Status => "status",
            MessageKind::EventUpdate => "event-update",
            MessageKind::StateChange => "state-change",
        }
    }

    /// Periodic kinds are spooled under a fixed name whose mtime records
    /// when the kind was last delivered.
    pub fn is_periodic(self) -> bool {
        matches!(self, MessageKind::Heartbeat | MessageKind::Audit)
    }

    /// Value of the event-type header sent with the message.
    pub fn event_type(self) -> &'static str {
        match self {
            MessageKind::Activate => "activate",
            MessageKind::Audit => "audit",
            MessageKind::Deactivate => "deactivate",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Fault | MessageKind::EventUpdate => "fault",
            MessageKind::StateChange => "admin",
            MessageKind::Status => "status",
            MessageKind::Test => "test",
        }
    }

    pub fn queue_category(self) -> QueueCategory {
        match self {
            MessageKind::Activate | MessageKind::Deactivate => QueueCategory::Activation,
            MessageKind::Audit => QueueCategory::Audit,
            MessageKind::Heartbeat => QueueCategory::Heartbeat,
            MessageKind::Fault | MessageKind::EventUpdate | MessageKind::Test => {
                QueueCategory::Event
            }
            MessageKind::StateChange => QueueCategory::Admin,
            MessageKind::Status => QueueCategory::Default,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| {
                let names: Vec<&str> = MessageKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown message kind '{s}'; expected one of: {}", names.join(", "))
            })
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One outbound telemetry unit: a kind plus the raw XML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Registration secret. Overwritten in memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    user: String,
    password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RegistrationRecord
// ---------------------------------------------------------------------------

/// Result of a successful registration, persisted as `reg.*` properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub client_id: String,
    pub dest_url: String,
    pub domain_id: Option<String>,
    pub domain_name: Option<String>,
    pub system_id: String,
    pub asset_id: String,
    pub user_id: String,
    pub message: Option<String>,
    pub code: Option<String>,
}

// ---------------------------------------------------------------------------
// ProtocolKind
// ---------------------------------------------------------------------------

/// Which wire protocol a session is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Queue-service protocol ("DTS").
    #[default]
    Dts,
    /// Form-post protocol ("SCRK").
    Scrk,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Dts => write!(f, "dts"),
            ProtocolKind::Scrk => write!(f, "scrk"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dts" => Ok(ProtocolKind::Dts),
            "scrk" => Ok(ProtocolKind::Scrk),
            other => Err(format!("unknown transport '{other}'; expected: dts, scrk")),
        }
    }
}
