//! Broker transport interface
//!
//! The router never talks to a broker directly. It opens one consumer per
//! routing key through [`BrokerTransport::subscribe`], receives
//! [`Delivery`] values on the consumer's channel, and settles each delivery
//! through its [`AckHandle`].
//!
//! ```text
//!   publish(exchange, "event.cloud.node.create", envelope)
//!                          │
//!                   ┌──────▼───────┐
//!                   │    broker    │  topic match per binding
//!                   └──┬────────┬──┘
//!        binding "event.#"   binding "event.cloud.*.create"
//!                      │        │
//!               Consumer rx   Consumer rx   (one per routing key)
//!                      │        │
//!                 ForwardingPipeline::forward ──► ack / requeue
//! ```

pub mod memory;
pub mod topic;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;
use crate::error::Error;

pub use memory::{BrokerStats, InMemoryBroker};
pub use topic::RoutingKey;

/// Broker-side failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// Consumer handle is not known to the broker
    #[error("unknown consumer {0}")]
    UnknownConsumer(u64),
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error::TransientBrokerFailure(err.to_string())
    }
}

/// Identifies one live broker consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    /// Broker-assigned consumer id
    pub id: u64,
    /// Binding key the consumer was opened for
    pub key: RoutingKey,
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; remove from the queue
    Ack,
    /// Not processed; put back for redelivery
    Requeue,
}

/// Settles a single delivery
///
/// Consumed by [`ack`](Self::ack) or [`requeue`](Self::requeue). Dropping it
/// unsettled closes the channel, which brokers treat as a requeue.
#[derive(Debug)]
pub struct AckHandle {
    tx: Option<oneshot::Sender<AckDecision>>,
}

impl AckHandle {
    /// Create a handle and the receiver the broker waits on
    pub fn channel() -> (Self, oneshot::Receiver<AckDecision>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A handle nobody listens to
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn ack(self) {
        self.settle(AckDecision::Ack);
    }

    pub fn requeue(self) {
        self.settle(AckDecision::Requeue);
    }

    pub fn settle(mut self, decision: AckDecision) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(decision);
        }
    }
}

/// One message handed to a consumer
#[derive(Debug)]
pub struct Delivery {
    /// Concrete routing key the message was published with
    pub routing_key: String,
    /// Payload
    pub envelope: Envelope,
    /// Whether the broker already delivered this message before
    pub redelivered: bool,
    /// Settlement handle
    pub ack: AckHandle,
}

/// A live consumer: its handle plus the stream of deliveries
#[derive(Debug)]
pub struct Consumer {
    pub handle: ConsumerHandle,
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Topic broker used for subscriptions and publishing
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Bind a consumer to `key` on `exchange`
    async fn subscribe(&self, exchange: &str, key: &RoutingKey) -> Result<Consumer, BrokerError>;

    /// Cancel a consumer and unbind its queue
    async fn unsubscribe(&self, handle: &ConsumerHandle) -> Result<(), BrokerError>;

    /// Publish a message with a concrete routing key
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError>;
}
