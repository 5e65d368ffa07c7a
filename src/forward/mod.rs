//! Forwarding pipeline
//!
//! Turns one broker delivery into callbacks to every interested service.
//!
//! ```text
//!   Delivery on subscription key k
//!            │
//!   RouteRegistry::list_subscribers(k) ──Err──► requeue
//!            │
//!        [] ─┼──► ack
//!            │
//!   ┌────────┼─────────┐        concurrent, each with its own
//!   ▼        ▼         ▼        grpc_timeout and retry budget
//!  svc A    svc B    svc C
//!   └────────┴─────────┘
//!            │
//!           ack   (regardless of individual outcomes)
//! ```
//!
//! Payloads are `Bytes`, so fan-out shares one allocation across every
//! subscriber.

use std::sync::Arc;

use futures::future::join_all;

use crate::broker::{AckDecision, Delivery, RoutingKey};
use crate::callback::{CallbackError, CallbackTransport, ForwardedMessage};
use crate::registry::{RouteRegistry, Service, ServiceId};
use crate::retry::RetryPolicy;

/// Outcome of the callbacks to one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOutcome {
    pub service_id: ServiceId,
    /// Attempts made (0 when the subscriber was skipped)
    pub attempts: u32,
    pub delivered: bool,
    /// Last error, if the subscriber was not reached
    pub error: Option<CallbackError>,
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReport {
    pub routing_key: String,
    pub decision: AckDecision,
    pub outcomes: Vec<SubscriberOutcome>,
}

impl ForwardReport {
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.delivered).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.delivered && o.attempts > 0)
            .count()
    }
}

/// Resolves subscribers and calls them back
#[derive(Clone)]
pub struct ForwardingPipeline {
    routes: RouteRegistry,
    callbacks: Arc<dyn CallbackTransport>,
    retry: RetryPolicy,
}

impl ForwardingPipeline {
    pub fn new(
        routes: RouteRegistry,
        callbacks: Arc<dyn CallbackTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            routes,
            callbacks,
            retry,
        }
    }

    /// Forward one delivery received on `subscription_key` and settle it
    pub async fn forward(&self, subscription_key: &RoutingKey, delivery: Delivery) -> ForwardReport {
        let Delivery {
            routing_key,
            envelope,
            redelivered,
            ack,
        } = delivery;

        let subscribers = match self.routes.list_subscribers(subscription_key).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::warn!(
                    key = %subscription_key,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to resolve subscribers, requeueing"
                );
                ack.requeue();
                return ForwardReport {
                    routing_key,
                    decision: AckDecision::Requeue,
                    outcomes: Vec::new(),
                };
            }
        };

        if subscribers.is_empty() {
            tracing::debug!(
                key = %subscription_key,
                routing_key = %routing_key,
                "No subscribers, discarding message"
            );
            ack.ack();
            return ForwardReport {
                routing_key,
                decision: AckDecision::Ack,
                outcomes: Vec::new(),
            };
        }

        let message = ForwardedMessage {
            routing_key,
            subscription_key: subscription_key.clone(),
            envelope,
        };

        let outcomes = join_all(
            subscribers
                .iter()
                .map(|service| self.call_subscriber(service, &message)),
        )
        .await;

        ack.ack();

        let report = ForwardReport {
            routing_key: message.routing_key,
            decision: AckDecision::Ack,
            outcomes,
        };

        tracing::debug!(
            key = %subscription_key,
            routing_key = %report.routing_key,
            redelivered = redelivered,
            subscribers = report.outcomes.len(),
            delivered = report.delivered_count(),
            failed = report.failed_count(),
            "Message forwarded"
        );

        report
    }

    async fn call_subscriber(&self, service: &Service, message: &ForwardedMessage) -> SubscriberOutcome {
        if !service.is_handling() {
            tracing::trace!(
                service = %service.id,
                state = %service.state,
                "Skipping subscriber that is not handling"
            );
            return SubscriberOutcome {
                service_id: service.id,
                attempts: 0,
                delivered: false,
                error: None,
            };
        }

        let deadline = service.grpc_timeout;
        let (result, attempts) = self
            .retry
            .run(|attempt| async move {
                let result =
                    match tokio::time::timeout(deadline, self.callbacks.deliver(service, message))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(CallbackError::Timeout(deadline)),
                    };

                if let Err(ref e) = result {
                    tracing::debug!(
                        service = %service.id,
                        routing_key = %message.routing_key,
                        attempt = attempt,
                        error = %e,
                        "Callback attempt failed"
                    );
                }
                result
            })
            .await;

        match result {
            Ok(()) => SubscriberOutcome {
                service_id: service.id,
                attempts,
                delivered: true,
                error: None,
            },
            Err(e) => {
                tracing::error!(
                    service = %service.id,
                    name = %service.name,
                    instance = %service.instance_id,
                    routing_key = %message.routing_key,
                    attempts = attempts,
                    error = %e,
                    "Callback failed, giving up"
                );
                SubscriberOutcome {
                    service_id: service.id,
                    attempts,
                    delivered: false,
                    error: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::AckHandle;
    use crate::envelope::Envelope;
    use crate::registry::{RegisterServiceRequest, ServiceRegistry, ServiceState};
    use crate::store::{MemoryStore, RegistryStore};

    /// Callback fake: fails a fixed number of times per service name
    #[derive(Default)]
    struct ScriptedCallbacks {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
        hang: Mutex<Vec<String>>,
    }

    impl ScriptedCallbacks {
        fn fail(&self, name: &str, times: u32) {
            self.failures.lock().unwrap().insert(name.into(), times);
        }

        fn calls(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|n| *n == name).count()
        }
    }

    #[async_trait]
    impl CallbackTransport for ScriptedCallbacks {
        async fn deliver(
            &self,
            target: &Service,
            _message: &ForwardedMessage,
        ) -> Result<(), CallbackError> {
            self.calls.lock().unwrap().push(target.name.clone());

            let hang = self.hang.lock().unwrap().contains(&target.name);
            if hang {
                std::future::pending::<()>().await;
            }

            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&target.name) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(CallbackError::Rejected("scripted".into()))
                }
                _ => Ok(()),
            }
        }

        async fn ping(&self, _target: &Service) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        services: ServiceRegistry,
        routes: RouteRegistry,
        callbacks: Arc<ScriptedCallbacks>,
        pipeline: ForwardingPipeline,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn RegistryStore> = store.clone();
        let services = ServiceRegistry::new(Arc::clone(&dyn_store), Duration::from_millis(200));
        let routes = RouteRegistry::new(dyn_store);
        let callbacks = Arc::new(ScriptedCallbacks::default());
        let pipeline = ForwardingPipeline::new(
            routes.clone(),
            callbacks.clone(),
            RetryPolicy::callback_default(),
        );

        Fixture {
            store,
            services,
            routes,
            callbacks,
            pipeline,
        }
    }

    impl Fixture {
        async fn subscriber(&self, name: &str, key: &RoutingKey, state: ServiceState) -> ServiceId {
            let req = RegisterServiceRequest::new(name, "1", format!("http://{name}"))
                .routing_key(key.as_str());
            let id = self.services.register(&req).await.unwrap().service.id;
            self.services.set_state(id, state).await.unwrap();
            self.routes.add_interest(key, id).await.unwrap();
            id
        }
    }

    fn delivery(routing_key: &str) -> (Delivery, tokio::sync::oneshot::Receiver<AckDecision>) {
        let (ack, rx) = AckHandle::channel();
        (
            Delivery {
                routing_key: routing_key.into(),
                envelope: Envelope::new("t", &b"m"[..]),
                redelivered: false,
                ack,
            },
            rx,
        )
    }

    fn key(s: &str) -> RoutingKey {
        RoutingKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_no_subscribers_acks() {
        let f = fixture();
        let (d, rx) = delivery("k");

        let report = f.pipeline.forward(&key("k"), d).await;

        assert_eq!(report.decision, AckDecision::Ack);
        assert!(report.outcomes.is_empty());
        assert_eq!(rx.await.unwrap(), AckDecision::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_subscriber_does_not_block_others() {
        let f = fixture();
        let k = key("event.x");
        let a = f.subscriber("a", &k, ServiceState::Handling).await;
        let b = f.subscriber("b", &k, ServiceState::Handling).await;
        f.callbacks.fail("a", u32::MAX);

        let (d, rx) = delivery("event.x");
        let report = f.pipeline.forward(&k, d).await;

        assert_eq!(rx.await.unwrap(), AckDecision::Ack);
        let outcome_a = report.outcomes.iter().find(|o| o.service_id == a).unwrap();
        let outcome_b = report.outcomes.iter().find(|o| o.service_id == b).unwrap();
        assert!(!outcome_a.delivered);
        assert_eq!(outcome_a.attempts, 3);
        assert!(outcome_b.delivered);
        assert_eq!(outcome_b.attempts, 1);
        assert_eq!(f.callbacks.calls("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let f = fixture();
        let k = key("k");
        f.subscriber("a", &k, ServiceState::Handling).await;
        f.callbacks.fail("a", 2);

        let (d, _rx) = delivery("k");
        let report = f.pipeline.forward(&k, d).await;

        assert_eq!(report.delivered_count(), 1);
        assert_eq!(report.outcomes[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_times_out() {
        let f = fixture();
        let k = key("k");
        f.subscriber("slow", &k, ServiceState::Handling).await;
        f.subscriber("fast", &k, ServiceState::Handling).await;
        f.callbacks.hang.lock().unwrap().push("slow".into());

        let (d, rx) = delivery("k");
        let report = f.pipeline.forward(&k, d).await;

        assert_eq!(rx.await.unwrap(), AckDecision::Ack);
        assert_eq!(report.delivered_count(), 1);
        assert_eq!(
            report.outcomes.iter().find(|o| !o.delivered).unwrap().error,
            Some(CallbackError::Timeout(Duration::from_millis(200)))
        );
    }

    #[tokio::test]
    async fn test_non_handling_subscriber_is_skipped() {
        let f = fixture();
        let k = key("k");
        f.subscriber("stopped", &k, ServiceState::Stopped).await;

        let (d, rx) = delivery("k");
        let report = f.pipeline.forward(&k, d).await;

        assert_eq!(rx.await.unwrap(), AckDecision::Ack);
        assert_eq!(report.outcomes[0].attempts, 0);
        assert_eq!(f.callbacks.calls("stopped"), 0);
    }

    #[tokio::test]
    async fn test_registry_unavailable_requeues() {
        let f = fixture();
        let k = key("k");
        f.subscriber("a", &k, ServiceState::Handling).await;
        f.store.set_available(false);

        let (d, rx) = delivery("k");
        let report = f.pipeline.forward(&k, d).await;

        assert_eq!(report.decision, AckDecision::Requeue);
        assert_eq!(rx.await.unwrap(), AckDecision::Requeue);
        assert_eq!(f.callbacks.calls("a"), 0);
    }
}
