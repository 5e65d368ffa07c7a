//! Callback transport
//!
//! How the router reaches a registered service: [`deliver`] hands one
//! forwarded message to the service's `callback_uri`, [`ping`] is the
//! liveness ping. Deadlines are applied by the caller (forwarding pipeline
//! and liveness monitor), not by the transport.
//!
//! [`deliver`]: CallbackTransport::deliver
//! [`ping`]: CallbackTransport::ping

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::RoutingKey;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::registry::Service;

pub use http::HttpCallbackClient;

/// A broker message on its way to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedMessage {
    /// Concrete key the message was published with
    pub routing_key: String,
    /// Subscription key that matched it (may be a pattern)
    pub subscription_key: RoutingKey,
    pub envelope: Envelope,
}

/// Failure of a single callback attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// No answer within the service's deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The service answered with an error
    #[error("rejected: {0}")]
    Rejected(String),
    /// The service could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl From<CallbackError> for Error {
    fn from(err: CallbackError) -> Self {
        Error::CallbackFailure(err.to_string())
    }
}

/// Client side of the per-service callback endpoint
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Hand `message` to `target`
    async fn deliver(&self, target: &Service, message: &ForwardedMessage)
        -> Result<(), CallbackError>;

    /// Liveness ping; Ok means the service answered
    async fn ping(&self, target: &Service) -> Result<(), CallbackError>;
}
