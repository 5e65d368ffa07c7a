//! Message routing control plane
//!
//! Services register a callback address and the routing-key patterns they
//! care about. The router owns the key-to-service mapping and the broker
//! subscriptions behind it, forwards every matching broker message to the
//! interested callbacks, and evicts services that stop answering liveness
//! pings.
//!
//! ```text
//!   Control API ──► ServiceRegistry / RouteRegistry ──► RegistryStore
//!        │                       │ key created / emptied
//!        │                       ▼
//!        │              SubscriptionManager ──subscribe──► BrokerTransport
//!        │                                                      │
//!        └── publish ───────────────────────────────────────────┤
//!                                                                ▼
//!                      ForwardingPipeline ◄── one consumer task per key
//!                               │
//!                               ▼
//!                      CallbackTransport (fan-out, timeout, retry)
//!
//!   LivenessMonitor ── ping ──► CallbackTransport ── miss > allowed ──► evict
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use msg_client::broker::InMemoryBroker;
//! use msg_client::callback::HttpCallbackClient;
//! use msg_client::registry::RegisterServiceRequest;
//! use msg_client::router::{MessageRouter, RouterConfig};
//! use msg_client::store::MemoryStore;
//!
//! # async fn run() -> msg_client::Result<()> {
//! let router = MessageRouter::new(
//!     RouterConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(HttpCallbackClient::new()?),
//! );
//!
//! let service = router
//!     .register_service(
//!         &RegisterServiceRequest::new("node", "i1", "http://127.0.0.1:8080/events")
//!             .routing_key("event.cloud.node.*"),
//!     )
//!     .await?;
//! router.start_handling(service.service_uuid).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod callback;
pub mod config;
pub mod envelope;
pub mod error;
pub mod forward;
pub mod liveness;
pub mod registry;
pub mod retry;
pub mod router;
pub mod server;
pub mod store;
pub mod subscription;

pub use broker::{BrokerTransport, InMemoryBroker, RoutingKey};
pub use callback::{CallbackTransport, HttpCallbackClient};
pub use config::{MessageClientConfig, StoreConfig};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use liveness::LivenessMonitor;
pub use registry::{RegisterServiceRequest, ServiceId, ServiceState, ServiceSummary};
pub use router::{MessageRouter, RouteSummary, RouterConfig};
pub use server::{ControlClient, ControlServer, ServerConfig};
pub use store::{MemoryStore, RegistryStore, SqliteStore};
