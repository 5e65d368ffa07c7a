//! HTTP callback transport
//!
//! `deliver` POSTs the raw envelope bytes to `callback_uri`:
//!
//! ```text
//! POST {callback_uri}
//! content-type: application/octet-stream
//! x-routing-key: event.cloud.node.create
//! x-subscription-key: event.cloud.*.create
//! x-message-type: type.googleapis.com/cloud.NodeEvent
//!
//! <envelope value>
//! ```
//!
//! `ping` is `GET {callback_uri}/ping`. Any 2xx answer counts as success.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{CallbackError, CallbackTransport, ForwardedMessage};
use crate::error::{Error, Result};
use crate::registry::Service;

pub const ROUTING_KEY_HEADER: &str = "x-routing-key";
pub const SUBSCRIPTION_KEY_HEADER: &str = "x-subscription-key";
pub const MESSAGE_TYPE_HEADER: &str = "x-message-type";

/// reqwest-backed [`CallbackTransport`]
#[derive(Clone)]
pub struct HttpCallbackClient {
    http_client: reqwest::Client,
}

impl HttpCallbackClient {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("msg-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http_client })
    }

    /// Use an existing client (shared connection pool)
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    fn ping_url(service: &Service) -> String {
        format!("{}/ping", service.callback_uri.trim_end_matches('/'))
    }
}

fn classify(err: reqwest::Error) -> CallbackError {
    match err.status() {
        Some(status) => CallbackError::Rejected(format!("status {status}")),
        None => CallbackError::Unreachable(err.to_string()),
    }
}

fn check_status(status: StatusCode) -> std::result::Result<(), CallbackError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(CallbackError::Rejected(format!("status {status}")))
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackClient {
    async fn deliver(
        &self,
        target: &Service,
        message: &ForwardedMessage,
    ) -> std::result::Result<(), CallbackError> {
        let mut request = self
            .http_client
            .post(&target.callback_uri)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(ROUTING_KEY_HEADER, &message.routing_key)
            .header(SUBSCRIPTION_KEY_HEADER, message.subscription_key.as_str());

        if !message.envelope.type_url.is_empty() {
            request = request.header(MESSAGE_TYPE_HEADER, &message.envelope.type_url);
        }

        let response = request
            .body(message.envelope.value.clone())
            .send()
            .await
            .map_err(classify)?;

        check_status(response.status())
    }

    async fn ping(&self, target: &Service) -> std::result::Result<(), CallbackError> {
        let response = self
            .http_client
            .get(Self::ping_url(target))
            .send()
            .await
            .map_err(classify)?;

        check_status(response.status())
    }
}
