//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use msg_client::broker::InMemoryBroker;
use msg_client::callback::{CallbackError, CallbackTransport, ForwardedMessage};
use msg_client::registry::{RegisterServiceRequest, Service, ServiceId};
use msg_client::retry::RetryPolicy;
use msg_client::router::{MessageRouter, RouterConfig};
use msg_client::store::{MemoryStore, RegistryStore};

static TRACING: Once = Once::new();

/// Install a test subscriber once; filter with RUST_LOG
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One callback as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub service: String,
    pub routing_key: String,
    pub payload: Bytes,
}

/// In-process stand-in for the services' callback endpoints
#[derive(Default)]
pub struct RecordingCallbacks {
    received: Mutex<Vec<Received>>,
    failing: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    /// Make every callback to `service` fail
    pub fn fail(&self, service: &str) {
        self.failing.lock().unwrap().insert(service.to_string());
    }

    /// Make pings to `service` fail
    pub fn go_dark(&self, service: &str) {
        self.unreachable.lock().unwrap().insert(service.to_string());
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_by(&self, service: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.service == service)
            .collect()
    }

    pub fn attempts_for(&self, service: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| *s == service)
            .count()
    }
}

#[async_trait]
impl CallbackTransport for RecordingCallbacks {
    async fn deliver(&self, target: &Service, message: &ForwardedMessage) -> Result<(), CallbackError> {
        self.attempts.lock().unwrap().push(target.name.clone());

        if self.failing.lock().unwrap().contains(&target.name) {
            return Err(CallbackError::Rejected("callback returned 500".into()));
        }

        self.received.lock().unwrap().push(Received {
            service: target.name.clone(),
            routing_key: message.routing_key.clone(),
            payload: message.envelope.value.clone(),
        });
        Ok(())
    }

    async fn ping(&self, target: &Service) -> Result<(), CallbackError> {
        if self.unreachable.lock().unwrap().contains(&target.name) {
            Err(CallbackError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

/// Router wired to in-memory collaborators
pub struct Harness {
    pub router: Arc<MessageRouter>,
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<MemoryStore>,
    pub callbacks: Arc<RecordingCallbacks>,
}

/// Short backoffs so retry paths stay fast
pub fn fast_config() -> RouterConfig {
    RouterConfig::default()
        .callback_retry(RetryPolicy::callback_default().initial_backoff(Duration::from_millis(1)))
        .broker_retry(RetryPolicy::broker_default().initial_backoff(Duration::from_millis(1)))
        .default_callback_timeout(Duration::from_millis(500))
}

impl Harness {
    pub fn new() -> Self {
        Self::with(fast_config(), InMemoryBroker::new())
    }

    pub fn with(config: RouterConfig, broker: InMemoryBroker) -> Self {
        init_tracing();

        let broker = Arc::new(broker);
        let store = Arc::new(MemoryStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let dyn_store: Arc<dyn RegistryStore> = store.clone();

        let router = Arc::new(MessageRouter::new(
            config,
            dyn_store,
            broker.clone(),
            callbacks.clone(),
        ));

        Self {
            router,
            broker,
            store,
            callbacks,
        }
    }

    /// Register `name` with `keys` and return its id
    pub async fn register(&self, name: &str, keys: &[&str]) -> ServiceId {
        self.router
            .register_service(&request(name, keys))
            .await
            .unwrap()
            .service_uuid
    }

    /// Register and start handling
    pub async fn handling(&self, name: &str, keys: &[&str]) -> ServiceId {
        let id = self.register(name, keys).await;
        self.router.start_handling(id).await.unwrap();
        id
    }
}

pub fn request(name: &str, keys: &[&str]) -> RegisterServiceRequest {
    keys.iter().fold(
        RegisterServiceRequest::new(name, "instance-1", format!("http://{name}.svc/callback"))
            .system("test"),
        |req, key| req.routing_key(*key),
    )
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
