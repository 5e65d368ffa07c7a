//! Route messages between two services without any network
//!
//! Run with: cargo run --example in_memory_router
//!
//! Registers a producer and two consumers against an in-memory broker,
//! publishes a few events and prints what each consumer's callback saw.
//! Then one consumer goes silent and the liveness monitor evicts it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use msg_client::callback::{CallbackError, CallbackTransport, ForwardedMessage};
use msg_client::registry::{RegisterServiceRequest, Service};
use msg_client::{Envelope, InMemoryBroker, LivenessMonitor, MemoryStore, MessageRouter, RouterConfig};

/// Prints every callback instead of calling out over HTTP
#[derive(Default)]
struct PrintingCallbacks {
    silent: Mutex<HashSet<String>>,
}

#[async_trait]
impl CallbackTransport for PrintingCallbacks {
    async fn deliver(&self, target: &Service, message: &ForwardedMessage) -> Result<(), CallbackError> {
        println!(
            "  [{}] {} via {} ({} bytes)",
            target.name,
            message.routing_key,
            message.subscription_key,
            message.envelope.value.len()
        );
        Ok(())
    }

    async fn ping(&self, target: &Service) -> Result<(), CallbackError> {
        if self.silent.lock().map(|s| s.contains(&target.name)).unwrap_or(false) {
            return Err(CallbackError::Unreachable("not answering".into()));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("msg_client=info".parse()?),
        )
        .init();

    let callbacks = Arc::new(PrintingCallbacks::default());
    let router = Arc::new(MessageRouter::new(
        RouterConfig::default().allowed_miss(1),
        Arc::new(MemoryStore::new()),
        Arc::new(InMemoryBroker::new()),
        callbacks.clone(),
    ));

    let nodes = router
        .register_service(
            &RegisterServiceRequest::new("node", "i1", "mem://node").routing_key("event.cloud.node.*"),
        )
        .await?;
    let audit = router
        .register_service(&RegisterServiceRequest::new("audit", "i1", "mem://audit").routing_key("event.#"))
        .await?;
    let producer = router
        .register_service(
            &RegisterServiceRequest::new("registry", "i1", "mem://registry").routing_key("cmd.registry.#"),
        )
        .await?;

    router.start_handling(nodes.service_uuid).await?;
    router.start_handling(audit.service_uuid).await?;

    println!("Publishing...");
    for key in ["event.cloud.node.create", "event.cloud.node.delete", "event.cloud.org.create"] {
        router
            .publish(
                producer.service_uuid,
                key,
                Envelope::new("type.example/Event", Bytes::from(key.as_bytes().to_vec())),
            )
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!();
    println!("Routes:");
    for route in router.list_routes().await? {
        println!("  {} -> {} service(s), {}", route.key, route.interested.len(), route.subscription);
    }

    println!();
    println!("Silencing 'audit'...");
    if let Ok(mut silent) = callbacks.silent.lock() {
        silent.insert("audit".to_string());
    }

    let monitor = LivenessMonitor::new(Arc::clone(&router));
    for round in 1..=2 {
        let report = monitor.tick().await;
        println!("  tick {round}: missed={} evicted={}", report.missed.len(), report.evicted.len());
    }

    println!();
    println!("Services:");
    for service in router.list_services().await? {
        println!("  {} ({}) {}", service.service_name, service.service_uuid, service.state);
    }

    router.shutdown().await;
    Ok(())
}
