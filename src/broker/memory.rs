//! In-process topic broker
//!
//! Implements [`BrokerTransport`] with topic-exchange semantics entirely in
//! memory. Used by tests and the demos, and as a loopback broker when the
//! router runs without an external message bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::topic::RoutingKey;
use super::{
    AckDecision, AckHandle, BrokerError, BrokerTransport, Consumer, ConsumerHandle, Delivery,
};
use crate::envelope::Envelope;

/// Default per-consumer channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Default number of redeliveries after a requeue
const DEFAULT_MAX_REDELIVERIES: u32 = 3;

struct Binding {
    exchange: String,
    key: RoutingKey,
    tx: mpsc::Sender<Delivery>,
}

/// Counters exposed for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
}

#[derive(Default)]
struct Counters {
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
}

/// In-memory topic broker
pub struct InMemoryBroker {
    bindings: Arc<RwLock<HashMap<u64, Binding>>>,
    next_consumer_id: AtomicU64,
    capacity: usize,
    max_redeliveries: u32,
    available: AtomicBool,
    failing_subscribes: AtomicU32,
    counters: Arc<Counters>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a custom per-consumer channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
            next_consumer_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            available: AtomicBool::new(true),
            failing_subscribes: AtomicU32::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Set how many times a requeued message is redelivered
    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    /// Simulate the broker going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Number of live consumers
    pub async fn consumer_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Number of live consumers bound with exactly `key`
    pub async fn consumers_for(&self, key: &RoutingKey) -> usize {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| &b.key == key)
            .count()
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            subscribes: c.subscribes.load(Ordering::Relaxed),
            unsubscribes: c.unsubscribes.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is down".into()))
        }
    }

    fn take_subscribe_failure(&self) -> bool {
        self.failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch the settlement of a sent delivery, redelivering on requeue
///
/// The first send happens inline in `publish` so per-consumer order matches
/// publish order; only redeliveries come from this task.
#[allow(clippy::too_many_arguments)]
fn watch_settlement(
    bindings: Arc<RwLock<HashMap<u64, Binding>>>,
    counters: Arc<Counters>,
    consumer_id: u64,
    tx: mpsc::Sender<Delivery>,
    routing_key: String,
    envelope: Envelope,
    settled: oneshot::Receiver<AckDecision>,
    max_redeliveries: u32,
) {
    tokio::spawn(async move {
        let mut settled = settled;

        for round in 0..=max_redeliveries {
            if round > 0 {
                if !bindings.read().await.contains_key(&consumer_id) {
                    tracing::debug!(consumer = consumer_id, "Consumer gone, dropping requeued message");
                    return;
                }

                let (ack, next) = AckHandle::channel();
                let delivery = Delivery {
                    routing_key: routing_key.clone(),
                    envelope: envelope.clone(),
                    redelivered: true,
                    ack,
                };
                if tx.send(delivery).await.is_err() {
                    return;
                }
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                settled = next;
            }

            match (&mut settled).await {
                Ok(AckDecision::Ack) => {
                    counters.acked.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(AckDecision::Requeue) | Err(_) => {
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        tracing::warn!(
            consumer = consumer_id,
            routing_key = %routing_key,
            "Message dropped after max redeliveries"
        );
    });
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn subscribe(&self, exchange: &str, key: &RoutingKey) -> Result<Consumer, BrokerError> {
        self.check_available()?;
        if self.take_subscribe_failure() {
            return Err(BrokerError::Unavailable("injected subscribe failure".into()));
        }

        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        self.bindings.write().await.insert(
            id,
            Binding {
                exchange: exchange.to_string(),
                key: key.clone(),
                tx,
            },
        );
        self.counters.subscribes.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(consumer = id, exchange = exchange, key = %key, "Consumer bound");

        Ok(Consumer {
            handle: ConsumerHandle {
                id,
                key: key.clone(),
            },
            deliveries: rx,
        })
    }

    async fn unsubscribe(&self, handle: &ConsumerHandle) -> Result<(), BrokerError> {
        self.check_available()?;

        if self.bindings.write().await.remove(&handle.id).is_none() {
            return Err(BrokerError::UnknownConsumer(handle.id));
        }
        self.counters.unsubscribes.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(consumer = handle.id, key = %handle.key, "Consumer unbound");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        self.check_available()?;

        // Snapshot matching bindings so no lock is held while sending
        let targets: Vec<(u64, mpsc::Sender<Delivery>)> = self
            .bindings
            .read()
            .await
            .iter()
            .filter(|(_, b)| b.exchange == exchange && b.key.matches(routing_key))
            .map(|(id, b)| (*id, b.tx.clone()))
            .collect();

        self.counters.published.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            exchange = exchange,
            routing_key = routing_key,
            consumers = targets.len(),
            "Message published"
        );

        for (id, tx) in targets {
            let (ack, settled) = AckHandle::channel();
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
                redelivered: false,
                ack,
            };

            // Consumer cancelled since the snapshot
            if tx.send(delivery).await.is_err() {
                continue;
            }
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);

            watch_settlement(
                Arc::clone(&self.bindings),
                Arc::clone(&self.counters),
                id,
                tx,
                routing_key.to_string(),
                envelope.clone(),
                settled,
                self.max_redeliveries,
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn key(s: &str) -> RoutingKey {
        RoutingKey::parse(s).unwrap()
    }

    fn envelope(body: &'static [u8]) -> Envelope {
        Envelope::new("test", Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_publish_routes_by_topic() {
        let broker = InMemoryBroker::new();
        let mut exact = broker.subscribe("ex", &key("a.b.c")).await.unwrap();
        let mut wild = broker.subscribe("ex", &key("a.#")).await.unwrap();
        let mut other = broker.subscribe("ex", &key("x.*")).await.unwrap();

        broker.publish("ex", "a.b.c", envelope(b"1")).await.unwrap();

        let d1 = exact.deliveries.recv().await.unwrap();
        assert_eq!(d1.routing_key, "a.b.c");
        d1.ack.ack();
        let d2 = wild.deliveries.recv().await.unwrap();
        assert_eq!(d2.envelope.value, Bytes::from_static(b"1"));
        d2.ack.ack();
        assert!(other.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exchange_is_part_of_binding() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("ex1", &key("a")).await.unwrap();

        broker.publish("ex2", "a", envelope(b"x")).await.unwrap();
        tokio::task::yield_now().await;

        assert!(consumer.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("ex", &key("a")).await.unwrap();

        broker.publish("ex", "a", envelope(b"x")).await.unwrap();

        let first = consumer.deliveries.recv().await.unwrap();
        assert!(!first.redelivered);
        first.ack.requeue();

        let second = consumer.deliveries.recv().await.unwrap();
        assert!(second.redelivered);
        second.ack.ack();

        tokio::task::yield_now().await;
        let stats = broker.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_stream() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("ex", &key("a")).await.unwrap();
        assert_eq!(broker.consumers_for(&key("a")).await, 1);

        broker.unsubscribe(&consumer.handle).await.unwrap();

        assert_eq!(broker.consumer_count().await, 0);
        assert!(consumer.deliveries.recv().await.is_none());
        assert_eq!(
            broker.unsubscribe(&consumer.handle).await,
            Err(BrokerError::UnknownConsumer(consumer.handle.id))
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes(1);

        assert!(broker.subscribe("ex", &key("a")).await.is_err());
        assert!(broker.subscribe("ex", &key("a")).await.is_ok());

        broker.set_available(false);
        assert!(broker.publish("ex", "a", envelope(b"x")).await.is_err());
    }
}
