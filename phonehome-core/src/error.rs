//! Error types shared by every phonehome crate.

use std::path::PathBuf;

use thiserror::Error;

/// Every failure the phone-home client can surface.
///
/// Variants follow the recovery policy the daemon applies:
/// transport and retryable protocol errors are spooled and retried,
/// non-retryable protocol errors drop the message, fatal errors
/// (see [`PhoneHomeError::is_fatal`]) stop the daemon, and local failures
/// keep the message and are reported.
#[derive(Debug, Error)]
pub enum PhoneHomeError {
    /// A buffer could not grow to the requested size.
    #[error("out of memory growing buffer to {requested} bytes")]
    Allocation { requested: usize },

    /// No HTTP response was obtained (connect refused, DNS, TLS, timeout).
    #[error("transport failure: {0}")]
    Transport(String),

    /// A response was obtained but the server rejected the request.
    #[error("phone home error {status}: {message}")]
    Protocol {
        status: u16,
        message: String,
        retry: bool,
    },

    /// 401-class rejection of credentials or request signature.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A property is missing or holds an unusable value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key generation, key parsing or signing failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Disk I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The property file exists but is not a flat YAML mapping.
    #[error("failed to parse property store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The request was rejected locally, before any network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server asked the client to stop sending altogether.
    #[error("server requested that delivery stop: {0}")]
    StopRetrying(String),

    /// The stored registration belongs to a different system.
    #[error("registration belongs to system '{registered}' but this system is '{live}'")]
    RegistrationMismatch { registered: String, live: String },

    /// A signed operation was attempted without a client registration.
    #[error("phone home error: not registered")]
    NotRegistered,

    /// The per-cycle cap on new messages was reached.
    #[error("message limit of {limit} per cycle reached")]
    MessageLimit { limit: u64 },
}

impl PhoneHomeError {
    /// `true` when the message should be kept and retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            PhoneHomeError::Transport(_) => true,
            PhoneHomeError::Protocol { retry, .. } => *retry,
            _ => false,
        }
    }

    /// `true` only for a server's non-retryable rejection (4xx other than
    /// 401). Such a message is discarded; every other failure keeps it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PhoneHomeError::Protocol { retry: false, .. })
    }

    /// `true` when the daemon must log and terminate rather than continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhoneHomeError::StopRetrying(_)
                | PhoneHomeError::Authentication(_)
                | PhoneHomeError::RegistrationMismatch { .. }
        )
    }

    /// HTTP status attached to the error, if a response was obtained.
    pub fn status(&self) -> Option<u16> {
        match self {
            PhoneHomeError::Protocol { status, .. } => Some(*status),
            PhoneHomeError::Authentication(_) => Some(401),
            _ => None,
        }
    }
}

pub type Result<T, E = PhoneHomeError> = std::result::Result<T, E>;

/// Convenience constructor for [`PhoneHomeError::Persistence`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PhoneHomeError {
    PhoneHomeError::Persistence {
        path: path.into(),
        source,
    }
}
