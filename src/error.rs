//! Error types
//!
//! The crate-level [`Error`] is the taxonomy every Control API operation
//! reports. Collaborator errors ([`StoreError`], [`BrokerError`],
//! [`CallbackError`]) convert into it at the registry/router boundary.
//!
//! [`StoreError`]: crate::store::StoreError
//! [`BrokerError`]: crate::broker::BrokerError
//! [`CallbackError`]: crate::callback::CallbackError

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Message client error
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, rejected at the Control API and never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown service id or routing key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Broker subscribe/unsubscribe/publish failed after bounded retries
    #[error("Transient broker failure: {0}")]
    TransientBrokerFailure(String),

    /// A subscriber callback failed or timed out after bounded retries
    #[error("Callback failure: {0}")]
    CallbackFailure(String),

    /// Registry store could not be reached
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Fault on the serving side, not caused by the request
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code used on the control wire
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::TransientBrokerFailure(_) => "transient_broker_failure",
            Error::CallbackFailure(_) => "callback_failure",
            Error::RegistryUnavailable(_) => "registry_unavailable",
            Error::Config(_) => "config",
            Error::Internal(_) | Error::Json(_) => "internal",
            Error::Io(_) => "io",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}
