//! Message router
//!
//! [`MessageRouter`] is the Control API surface. It ties the registries to
//! the subscription manager and is the only place where a registry change
//! turns into a broker subscribe or unsubscribe.
//!
//! # Locking
//!
//! Mutations are serialized with [`KeyLocks`], always acquired in the same
//! order so two operations can never wait on each other in a cycle:
//!
//! ```text
//!   (service_name, instance_id)  ─►  service id  ─►  routing key
//!        register only                 every          one key at
//!                                    mutation         a time
//! ```
//!
//! Key locks cover the interest write and the subscribe/unsubscribe it
//! triggers, so "key created" and "key emptied" for the same key never
//! interleave.

pub mod config;

pub use config::{RouterConfig, DEFAULT_EXCHANGE};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::broker::{BrokerTransport, RoutingKey};
use crate::callback::CallbackTransport;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::forward::ForwardingPipeline;
use crate::registry::{
    KeyLocks, RegisterServiceRequest, RouteRegistry, Service, ServiceId, ServiceRegistry,
    ServiceState, ServiceSummary,
};
use crate::store::RegistryStore;
use crate::subscription::{ReconcileReport, SubscriptionManager, SubscriptionState};

/// `ListRoutes` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub key: RoutingKey,
    pub interested: Vec<ServiceId>,
    pub subscription: SubscriptionState,
}

/// Outcome of one liveness result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Heartbeat {
    /// Ping answered, counter reset
    Confirmed,
    /// Ping failed, counter now at the given value
    Missed(u32),
    /// Ping failed past the threshold and the service was evicted
    Evicted(u32),
    /// Ping failed but the service was confirmed while it was in flight
    Superseded,
}

/// Routing control plane
pub struct MessageRouter {
    config: RouterConfig,
    services: ServiceRegistry,
    routes: RouteRegistry,
    subscriptions: SubscriptionManager,
    broker: Arc<dyn BrokerTransport>,
    callbacks: Arc<dyn CallbackTransport>,
    identity_locks: KeyLocks<(String, String)>,
    service_locks: KeyLocks<ServiceId>,
    key_locks: KeyLocks<RoutingKey>,
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn RegistryStore>,
        broker: Arc<dyn BrokerTransport>,
        callbacks: Arc<dyn CallbackTransport>,
    ) -> Self {
        let services = ServiceRegistry::new(Arc::clone(&store), config.default_callback_timeout);
        let routes = RouteRegistry::new(store);
        let pipeline = ForwardingPipeline::new(
            routes.clone(),
            Arc::clone(&callbacks),
            config.callback_retry.clone(),
        );
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&broker),
            pipeline,
            config.exchange.clone(),
            config.broker_retry.clone(),
        );

        Self {
            config,
            services,
            routes,
            subscriptions,
            broker,
            callbacks,
            identity_locks: KeyLocks::new(),
            service_locks: KeyLocks::new(),
            key_locks: KeyLocks::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn callbacks(&self) -> &Arc<dyn CallbackTransport> {
        &self.callbacks
    }

    /// `RegisterService`
    ///
    /// Idempotent on `(service_name, instance_id)`. Re-registering a service
    /// that is handling applies the difference between its old and new keys.
    pub async fn register_service(&self, request: &RegisterServiceRequest) -> Result<ServiceSummary> {
        let identity = (request.service_name.clone(), request.instance_id.clone());
        let _identity = self.identity_locks.lock(&identity).await;

        let existing = self
            .services
            .find(&request.service_name, &request.instance_id)
            .await?;
        let _service = match &existing {
            Some(service) => Some(self.service_locks.lock(&service.id).await),
            None => None,
        };

        let registration = self.services.register(request).await?;
        let service = registration.service;

        if service.is_handling() {
            self.sync_interests(&service).await?;
        }

        tracing::info!(
            service = %service.id,
            name = %service.name,
            instance = %service.instance_id,
            keys = service.routing_keys.len(),
            new = registration.previous_keys.is_none(),
            "Service registered"
        );

        Ok(ServiceSummary::from(&service))
    }

    /// `UnregisterService`; unknown ids are treated as already removed
    pub async fn unregister_service(&self, id: ServiceId) -> Result<()> {
        let _service = self.service_locks.lock(&id).await;

        match self.remove(id).await {
            Ok(service) => {
                tracing::info!(
                    service = %id,
                    name = %service.name,
                    instance = %service.instance_id,
                    "Service unregistered"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(service = %id, "Unregister of unknown service");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `StartHandling`: activate every declared key
    pub async fn start_handling(&self, id: ServiceId) -> Result<()> {
        let _service = self.service_locks.lock(&id).await;

        let mut service = self.services.get(id).await?;
        if service.start_handling() {
            service = self.services.set_state(id, ServiceState::Handling).await?;
        }

        // Also re-attaches keys left behind by an earlier partial failure
        for key in &service.routing_keys {
            self.attach(key, id).await?;
        }

        tracing::info!(
            service = %id,
            name = %service.name,
            keys = service.routing_keys.len(),
            "Service handling started"
        );
        Ok(())
    }

    /// `StopHandling`: drop every interest, keep the record
    pub async fn stop_handling(&self, id: ServiceId) -> Result<()> {
        let _service = self.service_locks.lock(&id).await;

        let mut service = match self.services.get(id).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                tracing::debug!(service = %id, "Stop of unknown service");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if service.stop_handling() {
            self.services.set_state(id, ServiceState::Stopped).await?;
        }

        for key in self.routes.keys_of(id).await? {
            self.detach(&key, id).await?;
        }

        tracing::info!(service = %id, name = %service.name, "Service handling stopped");
        Ok(())
    }

    /// `Publish`: send a message on behalf of a registered service
    pub async fn publish(&self, id: ServiceId, routing_key: &str, envelope: Envelope) -> Result<()> {
        let service = self.services.get(id).await?;

        let key = RoutingKey::parse(routing_key)?;
        if key.is_pattern() {
            return Err(Error::invalid(format!(
                "cannot publish with wildcard routing key {key}"
            )));
        }

        let exchange = if service.exchange.is_empty() {
            self.config.exchange.as_str()
        } else {
            service.exchange.as_str()
        };

        let size = envelope.len();
        let (result, attempts) = self
            .config
            .broker_retry
            .run(|attempt| {
                let envelope = envelope.clone();
                let key = &key;
                async move {
                    let result = self.broker.publish(exchange, key.as_str(), envelope).await;
                    if let Err(ref e) = result {
                        tracing::warn!(
                            service = %id,
                            routing_key = %key,
                            attempt = attempt,
                            error = %e,
                            "Publish failed"
                        );
                    }
                    result
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    service = %id,
                    exchange = exchange,
                    routing_key = %key,
                    size = size,
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    service = %id,
                    routing_key = %key,
                    attempts = attempts,
                    error = %e,
                    "Publish retries exhausted"
                );
                Err(e.into())
            }
        }
    }

    /// `ListServices`
    pub async fn list_services(&self) -> Result<Vec<ServiceSummary>> {
        Ok(self
            .services
            .list()
            .await?
            .iter()
            .map(ServiceSummary::from)
            .collect())
    }

    /// `ListRoutes`, with the live subscription state of each key
    pub async fn list_routes(&self) -> Result<Vec<RouteSummary>> {
        Ok(self
            .routes
            .list()
            .await?
            .into_iter()
            .map(|route| RouteSummary {
                subscription: self.subscriptions.state(&route.key),
                key: route.key,
                interested: route.service_ids,
            })
            .collect())
    }

    /// Remove a service that stopped answering liveness checks
    ///
    /// Runs the same cascade as unregistration after recording the
    /// `Evicted` state. Returns false if the service was already gone.
    pub async fn evict(&self, id: ServiceId) -> Result<bool> {
        let _service = self.service_locks.lock(&id).await;
        self.evict_locked(id).await
    }

    /// Eviction body; caller holds the service lock
    async fn evict_locked(&self, id: ServiceId) -> Result<bool> {
        let service = match self.services.set_state(id, ServiceState::Evicted).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::warn!(
            service = %id,
            name = %service.name,
            instance = %service.instance_id,
            state = %service.state,
            missed_heartbeats = service.missed_heartbeats,
            "Evicting unresponsive service"
        );

        match self.remove(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply one liveness result under the service lock
    ///
    /// `seen` is the confirmation marker read before the ping went out. A
    /// failed ping does not count when the service was confirmed since
    /// (re-registered meanwhile). Past `allowed_miss` misses the service is
    /// evicted while the lock is still held. Returns None if the service is
    /// gone.
    pub(crate) async fn record_heartbeat(
        &self,
        id: ServiceId,
        alive: bool,
        seen: u64,
        allowed_miss: u32,
    ) -> Result<Option<Heartbeat>> {
        let _service = self.service_locks.lock(&id).await;

        let result = if alive {
            self.services.touch(id).await.map(|()| Heartbeat::Confirmed)
        } else if self.services.confirmation(id) != seen {
            self.services.get(id).await.map(|service| {
                tracing::debug!(
                    service = %id,
                    missed_heartbeats = service.missed_heartbeats,
                    "Missed ping superseded by a newer confirmation"
                );
                Heartbeat::Superseded
            })
        } else {
            match self.services.record_miss(id).await {
                Ok(count) if count > allowed_miss => match self.evict_locked(id).await {
                    Ok(true) => Ok(Heartbeat::Evicted(count)),
                    Ok(false) => Ok(Heartbeat::Missed(count)),
                    Err(e) => {
                        tracing::error!(service = %id, error = %e, "Eviction failed");
                        Ok(Heartbeat::Missed(count))
                    }
                },
                other => other.map(Heartbeat::Missed),
            }
        };

        match result {
            Ok(heartbeat) => Ok(Some(heartbeat)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Open subscriptions for every key with interest and close the rest
    ///
    /// Also restores subscriptions for interests persisted by an earlier
    /// process.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut keys: BTreeSet<RoutingKey> =
            self.routes.list().await?.into_iter().map(|r| r.key).collect();
        keys.extend(self.subscriptions.subscribed_keys());

        let mut report = ReconcileReport::default();
        for key in keys {
            let _key = self.key_locks.lock(&key).await;
            let wanted = !self.routes.list_subscribers(&key).await?.is_empty();
            let action = self.subscriptions.reconcile_key(&key, wanted).await;
            report.record(key, action);
        }

        if !report.is_noop() {
            tracing::info!(
                opened = report.opened.len(),
                closed = report.closed.len(),
                failed = report.failed.len(),
                "Subscriptions reconciled"
            );
        }

        Ok(report)
    }

    /// Spawn the periodic reconcile sweep
    pub fn spawn_reconcile_task(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let interval = router.config.reconcile_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = router.reconcile().await {
                    tracing::warn!(error = %e, "Reconcile sweep failed");
                }
            }
        })
    }

    /// Close every broker subscription
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown().await;
    }

    /// Bring the interests of a handling service in line with its keys
    async fn sync_interests(&self, service: &Service) -> Result<()> {
        let current: BTreeSet<RoutingKey> =
            self.routes.keys_of(service.id).await?.into_iter().collect();
        let desired: BTreeSet<RoutingKey> = service.routing_keys.iter().cloned().collect();

        for key in current.difference(&desired) {
            self.detach(key, service.id).await?;
        }
        for key in desired.difference(&current) {
            self.attach(key, service.id).await?;
        }
        Ok(())
    }

    /// Unregistration cascade; caller holds the service lock
    async fn remove(&self, id: ServiceId) -> Result<Service> {
        self.services.get(id).await?;

        for key in self.routes.keys_of(id).await? {
            self.detach(&key, id).await?;
        }

        let removed = self.services.unregister(id).await?;
        for key in &removed.emptied_keys {
            let _key = self.key_locks.lock(key).await;
            self.close_subscription(key).await;
        }

        Ok(removed.service)
    }

    /// Add interest and open the subscription if the key needs one
    async fn attach(&self, key: &RoutingKey, id: ServiceId) -> Result<()> {
        let _key = self.key_locks.lock(key).await;

        let created = self.routes.add_interest(key, id).await?;
        if created || !self.subscriptions.is_subscribed(key) {
            if let Err(e) = self.subscriptions.open(key).await {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Key has interest but no subscription until the next interest change or reconcile"
                );
            }
        }
        Ok(())
    }

    /// Remove interest and close the subscription once nobody is left
    async fn detach(&self, key: &RoutingKey, id: ServiceId) -> Result<()> {
        let _key = self.key_locks.lock(key).await;

        if self.routes.remove_interest(key, id).await? {
            self.close_subscription(key).await;
        }
        Ok(())
    }

    async fn close_subscription(&self, key: &RoutingKey) {
        if let Err(e) = self.subscriptions.close(key).await {
            tracing::warn!(key = %key, error = %e, "Subscription dropped without clean unsubscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::callback::{CallbackError, ForwardedMessage};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CallbackTransport for Recorder {
        async fn deliver(
            &self,
            target: &Service,
            message: &ForwardedMessage,
        ) -> std::result::Result<(), CallbackError> {
            self.delivered
                .lock()
                .unwrap()
                .push((target.name.clone(), message.routing_key.clone()));
            Ok(())
        }

        async fn ping(&self, _target: &Service) -> std::result::Result<(), CallbackError> {
            Ok(())
        }
    }

    struct Fixture {
        router: MessageRouter,
        broker: Arc<InMemoryBroker>,
        recorder: Arc<Recorder>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let recorder = Arc::new(Recorder::default());
        let config = RouterConfig::default()
            .broker_retry(RetryPolicy::broker_default().initial_backoff(Duration::from_millis(1)));
        let router = MessageRouter::new(
            config,
            Arc::new(MemoryStore::new()),
            broker.clone(),
            recorder.clone(),
        );
        Fixture {
            router,
            broker,
            recorder,
        }
    }

    fn request(name: &str, keys: &[&str]) -> RegisterServiceRequest {
        keys.iter().fold(
            RegisterServiceRequest::new(name, "i1", format!("http://{name}/cb")),
            |req, key| req.routing_key(*key),
        )
    }

    fn key(s: &str) -> RoutingKey {
        RoutingKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_register_does_not_subscribe() {
        let f = fixture();
        let svc = f.router.register_service(&request("a", &["k"])).await.unwrap();

        assert_eq!(svc.state, ServiceState::Registered);
        assert!(f.router.list_routes().await.unwrap().is_empty());
        assert_eq!(f.broker.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_handling() {
        let f = fixture();
        let id = f
            .router
            .register_service(&request("a", &["k1", "k2"]))
            .await
            .unwrap()
            .service_uuid;

        f.router.start_handling(id).await.unwrap();
        f.router.start_handling(id).await.unwrap();
        assert_eq!(f.broker.consumer_count().await, 2);

        let routes = f.router.list_routes().await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes
            .iter()
            .all(|r| r.subscription == SubscriptionState::Subscribed && r.interested == vec![id]));

        f.router.stop_handling(id).await.unwrap();
        assert_eq!(f.broker.consumer_count().await, 0);
        assert!(f.router.list_routes().await.unwrap().is_empty());

        let services = f.router.list_services().await.unwrap();
        assert_eq!(services[0].state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let f = fixture();
        let unknown = ServiceId::new();

        f.router.unregister_service(unknown).await.unwrap();
        f.router.stop_handling(unknown).await.unwrap();
        assert!(f.router.start_handling(unknown).await.unwrap_err().is_not_found());
        assert!(f
            .router
            .publish(unknown, "k", Envelope::new("", Bytes::new()))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!f.router.evict(unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_reregister_applies_key_diff() {
        let f = fixture();
        let id = f
            .router
            .register_service(&request("a", &["old", "kept"]))
            .await
            .unwrap()
            .service_uuid;
        f.router.start_handling(id).await.unwrap();

        let again = f
            .router
            .register_service(&request("a", &["kept", "new"]))
            .await
            .unwrap();
        assert_eq!(again.service_uuid, id);

        let keys: Vec<RoutingKey> = f
            .router
            .list_routes()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![key("kept"), key("new")]);
        assert_eq!(f.broker.consumers_for(&key("old")).await, 0);
        assert_eq!(f.broker.consumers_for(&key("new")).await, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_patterns() {
        let f = fixture();
        let id = f
            .router
            .register_service(&request("a", &["k"]))
            .await
            .unwrap()
            .service_uuid;

        let err = f
            .router
            .publish(id, "event.*", Envelope::new("", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");

        let err = f
            .router
            .publish(id, "", Envelope::new("", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_publish_broker_down() {
        let f = fixture();
        let id = f
            .router
            .register_service(&request("a", &["k"]))
            .await
            .unwrap()
            .service_uuid;

        f.broker.set_available(false);
        let err = f
            .router
            .publish(id, "k", Envelope::new("", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transient_broker_failure");
    }

    #[tokio::test]
    async fn test_publish_round_trip() {
        let f = fixture();
        let consumer = f
            .router
            .register_service(&request("consumer", &["event.cloud.*.create"]))
            .await
            .unwrap()
            .service_uuid;
        let producer = f
            .router
            .register_service(&request("producer", &["unused"]))
            .await
            .unwrap()
            .service_uuid;
        f.router.start_handling(consumer).await.unwrap();

        f.router
            .publish(
                producer,
                "event.cloud.node.create",
                Envelope::new("t", Bytes::from_static(b"n1")),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if !f.recorder.delivered.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let delivered = f.recorder.delivered.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![("consumer".to_string(), "event.cloud.node.create".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reconcile_heals_failed_subscribe() {
        let f = fixture();
        let id = f
            .router
            .register_service(&request("a", &["k"]))
            .await
            .unwrap()
            .service_uuid;

        f.broker.fail_next_subscribes(3);
        f.router.start_handling(id).await.unwrap();
        assert_eq!(f.broker.consumer_count().await, 0);

        let report = f.router.reconcile().await.unwrap();
        assert_eq!(report.opened, vec![key("k")]);
        assert_eq!(f.broker.consumer_count().await, 1);
    }
}
