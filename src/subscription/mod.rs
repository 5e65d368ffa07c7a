//! Broker subscription management
//!
//! Keeps exactly one broker consumer per routing key that has at least one
//! interested service. Each consumer owns a task that feeds its deliveries
//! to the [`ForwardingPipeline`] one at a time, which preserves per-key
//! ordering.
//!
//! ```text
//!  open(k):   NoSubscription ─► Subscribing ─(retry)─► Subscribed
//!                                   │ exhausted
//!                                   └──────────► NoSubscription (logged)
//!
//!  close(k):  Subscribed ─► Unsubscribing ─(retry)─► NoSubscription
//! ```
//!
//! Callers serialize `open`/`close` for the same key; the manager itself
//! only guards its slot table.

mod state;

pub use state::SubscriptionState;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::broker::{BrokerTransport, Delivery, RoutingKey};
use crate::error::{Error, Result};
use crate::forward::ForwardingPipeline;
use crate::retry::RetryPolicy;
use state::Slot;

/// What a reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<RoutingKey>,
    pub closed: Vec<RoutingKey>,
    pub failed: Vec<RoutingKey>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, key: RoutingKey, action: Result<Option<bool>>) {
        match action {
            Ok(Some(true)) => self.opened.push(key),
            Ok(Some(false)) => self.closed.push(key),
            Ok(None) => {}
            Err(_) => self.failed.push(key),
        }
    }
}

/// Owner of every live broker subscription
pub struct SubscriptionManager {
    broker: Arc<dyn BrokerTransport>,
    pipeline: ForwardingPipeline,
    exchange: String,
    retry: RetryPolicy,
    slots: Mutex<HashMap<RoutingKey, Slot>>,
}

impl SubscriptionManager {
    pub fn new(
        broker: Arc<dyn BrokerTransport>,
        pipeline: ForwardingPipeline,
        exchange: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            pipeline,
            exchange: exchange.into(),
            retry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RoutingKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure a live subscription for `key`
    ///
    /// Returns true if a consumer was opened, false if one was already live
    /// or in flight. On retry exhaustion the key is left without a
    /// subscription and [`Error::TransientBrokerFailure`] is returned.
    pub async fn open(&self, key: &RoutingKey) -> Result<bool> {
        {
            let mut slots = self.slots();
            match slots.get(key) {
                Some(slot) if slot.is_live() || slot.state.is_transitioning() => return Ok(false),
                Some(_) => {
                    tracing::warn!(key = %key, "Consumer task ended, resubscribing");
                }
                None => {}
            }
            slots.insert(key.clone(), Slot::subscribing());
        }

        let (result, attempts) = self
            .retry
            .run(|attempt| async move {
                let result = self.broker.subscribe(&self.exchange, key).await;
                if let Err(ref e) = result {
                    tracing::warn!(key = %key, attempt = attempt, error = %e, "Subscribe failed");
                }
                result
            })
            .await;

        match result {
            Ok(consumer) => {
                let task = tokio::spawn(consume(
                    key.clone(),
                    consumer.deliveries,
                    self.pipeline.clone(),
                ));

                let mut slots = self.slots();
                match slots.get_mut(key) {
                    Some(slot) => slot.on_subscribed(consumer.handle.clone(), task),
                    None => {
                        let mut slot = Slot::subscribing();
                        slot.on_subscribed(consumer.handle.clone(), task);
                        slots.insert(key.clone(), slot);
                    }
                }

                tracing::info!(
                    key = %key,
                    exchange = %self.exchange,
                    consumer = consumer.handle.id,
                    attempts = attempts,
                    "Subscription opened"
                );
                Ok(true)
            }
            Err(e) => {
                self.slots().remove(key);
                tracing::error!(
                    key = %key,
                    exchange = %self.exchange,
                    attempts = attempts,
                    error = %e,
                    "Subscribe retries exhausted, key left without subscription"
                );
                Err(e.into())
            }
        }
    }

    /// Tear down the subscription for `key`
    ///
    /// Returns false if there was nothing to close. A failed unsubscribe is
    /// retried; on exhaustion the handle is dropped anyway and the error
    /// returned.
    pub async fn close(&self, key: &RoutingKey) -> Result<bool> {
        let handle = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key) else {
                return Ok(false);
            };
            match slot.state {
                SubscriptionState::Subscribed => slot.begin_unsubscribe(),
                _ => return Ok(false),
            }
        };

        let Some(handle) = handle else {
            self.slots().remove(key);
            return Ok(false);
        };

        let (result, attempts) = self
            .retry
            .run(|attempt| {
                let handle = &handle;
                async move {
                    let result = self.broker.unsubscribe(handle).await;
                    if let Err(ref e) = result {
                        tracing::warn!(key = %key, attempt = attempt, error = %e, "Unsubscribe failed");
                    }
                    result
                }
            })
            .await;

        // Dropping the slot aborts the consumer task
        self.slots().remove(key);

        match result {
            Ok(()) => {
                tracing::info!(key = %key, consumer = handle.id, "Subscription closed");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    key = %key,
                    consumer = handle.id,
                    attempts = attempts,
                    error = %e,
                    "Unsubscribe retries exhausted, dropping consumer"
                );
                Err(Error::from(e))
            }
        }
    }

    /// Bring one key in line with whether it is wanted
    ///
    /// `Ok(Some(true))` opened, `Ok(Some(false))` closed, `Ok(None)` no change.
    pub async fn reconcile_key(&self, key: &RoutingKey, wanted: bool) -> Result<Option<bool>> {
        if wanted {
            Ok(self.open(key).await?.then_some(true))
        } else {
            Ok(self.close(key).await?.then_some(false))
        }
    }

    /// Open missing subscriptions for `desired` and close all others
    pub async fn reconcile(&self, desired: &BTreeSet<RoutingKey>) -> ReconcileReport {
        let mut keys: BTreeSet<RoutingKey> = desired.clone();
        keys.extend(self.subscribed_keys());

        let mut report = ReconcileReport::default();
        for key in keys {
            let wanted = desired.contains(&key);
            let action = self.reconcile_key(&key, wanted).await;
            report.record(key, action);
        }
        report
    }

    pub fn state(&self, key: &RoutingKey) -> SubscriptionState {
        self.slots()
            .get(key)
            .map(|slot| slot.state)
            .unwrap_or(SubscriptionState::NoSubscription)
    }

    pub fn is_subscribed(&self, key: &RoutingKey) -> bool {
        self.slots().get(key).is_some_and(Slot::is_live)
    }

    /// Number of keys in `Subscribed`
    pub fn subscription_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.state == SubscriptionState::Subscribed)
            .count()
    }

    /// Keys with a subscription, sorted
    pub fn subscribed_keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<RoutingKey> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.state == SubscriptionState::Subscribed)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Close every subscription
    pub async fn shutdown(&self) {
        let keys = self.subscribed_keys();
        let count = keys.len();

        for key in keys {
            if let Err(e) = self.close(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to close subscription on shutdown");
            }
        }

        tracing::info!(closed = count, "Subscriptions shut down");
    }
}

/// Consumer loop for one key: forward deliveries one at a time
async fn consume(key: RoutingKey, mut deliveries: mpsc::Receiver<Delivery>, pipeline: ForwardingPipeline) {
    tracing::debug!(key = %key, "Consumer started");

    while let Some(delivery) = deliveries.recv().await {
        pipeline.forward(&key, delivery).await;
    }

    tracing::debug!(key = %key, "Consumer stream ended");
}
