//! phonehome core library: domain types, buffers, properties, signing,
//! message bodies and errors.
//!
//! - [`buffer`] — [`DynBuffer`] with XML/token escaping
//! - [`props`] — [`PropertyStore`] over a YAML file
//! - [`signer`] — [`Signer`] and [`KeyMaterial`]
//! - [`message`] — [`MessageBuilder`] for every message kind
//! - [`error`] — [`PhoneHomeError`]

pub mod buffer;
pub mod error;
pub mod host;
pub mod message;
pub mod props;
pub mod signer;
pub mod stag;
pub mod types;

pub use buffer::DynBuffer;
pub use error::{PhoneHomeError, Result};
pub use host::HostIdentity;
pub use message::{FaultEvent, MessageBuilder};
pub use props::PropertyStore;
pub use signer::{DigestAlgorithm, KeyMaterial, Signer};
pub use types::{Credential, Message, MessageKind, ProtocolKind, QueueCategory, RegistrationRecord};
