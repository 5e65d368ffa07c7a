//! Per-key subscription state machine

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::broker::ConsumerHandle;

/// Lifecycle of the broker subscription for one routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// No live consumer
    NoSubscription,
    /// Subscribe in flight (with retries)
    Subscribing,
    /// Consumer open and forwarding
    Subscribed,
    /// Unsubscribe in flight (with retries)
    Unsubscribing,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::NoSubscription => "no_subscription",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unsubscribing => "unsubscribing",
        }
    }

    /// A subscribe or unsubscribe is in progress
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Subscribing | SubscriptionState::Unsubscribing
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of one key's subscription
#[derive(Debug)]
pub(crate) struct Slot {
    pub state: SubscriptionState,

    /// Broker handle while subscribed
    pub handle: Option<ConsumerHandle>,

    /// Consumer task forwarding this key's deliveries
    pub task: Option<JoinHandle<()>>,

    /// When the current state was entered
    pub since: Instant,
}

impl Slot {
    pub fn subscribing() -> Self {
        Self {
            state: SubscriptionState::Subscribing,
            handle: None,
            task: None,
            since: Instant::now(),
        }
    }

    /// Subscribing -> Subscribed
    pub fn on_subscribed(&mut self, handle: ConsumerHandle, task: JoinHandle<()>) {
        self.state = SubscriptionState::Subscribed;
        self.handle = Some(handle);
        self.task = Some(task);
        self.since = Instant::now();
    }

    /// Subscribed -> Unsubscribing, handing out the broker handle
    pub fn begin_unsubscribe(&mut self) -> Option<ConsumerHandle> {
        if self.state != SubscriptionState::Subscribed {
            return None;
        }
        self.state = SubscriptionState::Unsubscribing;
        self.since = Instant::now();
        self.handle.clone()
    }

    /// Subscribed with a consumer task that is still running
    pub fn is_live(&self) -> bool {
        self.state == SubscriptionState::Subscribed
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the consumer task
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.abort();
    }
}
