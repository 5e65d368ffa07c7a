//! Service and route registries
//!
//! Both registries are thin lifecycle layers over a shared
//! [`RegistryStore`](crate::store::RegistryStore). They decide what a
//! registration or an interest change means; the store only persists rows.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<dyn RegistryStore>
//!                 ┌──────────────────────────┐
//!                 │ services: id -> Service  │
//!                 │ route_interests:         │
//!                 │   key -> {service ids}   │
//!                 └────────────┬─────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!       ServiceRegistry                  RouteRegistry
//!   register / unregister /        add_interest ─► "key created"
//!   touch / record_miss           remove_interest ─► "key emptied"
//!              │                               │
//!              └──────────► MessageRouter ◄────┘
//!                      (KeyLocks serialize per
//!                       service and per key)
//! ```

pub mod locks;
pub mod route;
pub mod service;

pub use locks::{KeyGuard, KeyLocks};
pub use route::{Route, RouteRegistry};
pub use service::{
    RegisterServiceRequest, Registration, Service, ServiceId, ServiceRegistry, ServiceState,
    ServiceSummary, Unregistration,
};
