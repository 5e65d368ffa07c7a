//! Registry store
//!
//! CRUD persistence for service rows and route-interest rows. Stores hold
//! no business logic; the registries in [`crate::registry`] build on them.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: process-local, used by tests and single-node setups
//! - [`SqliteStore`]: durable, laid out as the `services` and
//!   `route_interests` tables

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::RoutingKey;
use crate::error::Error;
use crate::registry::{Route, Service, ServiceId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store-level failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached or failed mid-operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Write would violate a uniqueness constraint
    #[error("conflict: {0}")]
    Conflict(String),
    /// Row holds a value the store cannot represent
    #[error("invalid row: {0}")]
    Invalid(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Error::RegistryUnavailable(msg),
            StoreError::Conflict(msg) | StoreError::Invalid(msg) => Error::InvalidArgument(msg),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// `grpc_timeout` as the signed milliseconds every store persists
pub(crate) fn timeout_millis(service: &Service) -> StoreResult<i64> {
    i64::try_from(service.grpc_timeout.as_millis()).map_err(|_| {
        StoreError::Invalid(format!(
            "grpc timeout of {}s for service {} is out of range",
            service.grpc_timeout.as_secs(),
            service.id
        ))
    })
}

/// Result of an interest insert or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestChange {
    /// Whether a row was actually inserted/deleted
    pub changed: bool,
    /// Interested services left on the key afterwards
    pub remaining: usize,
}

impl InterestChange {
    /// The insert created the key
    pub fn created(&self) -> bool {
        self.changed && self.remaining == 1
    }

    /// The delete left the key without interest
    pub fn emptied(&self) -> bool {
        self.changed && self.remaining == 0
    }
}

/// Atomic change to a service's missed-heartbeat counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatUpdate {
    Reset,
    Increment,
}

/// Persistence for service and route-interest rows
///
/// Every method is atomic with respect to the others on the same store.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_service(&self, id: ServiceId) -> StoreResult<Option<Service>>;

    /// Look up the live record for a `(name, instance_id)` pair
    async fn find_service(&self, name: &str, instance_id: &str) -> StoreResult<Option<Service>>;

    async fn list_services(&self) -> StoreResult<Vec<Service>>;

    /// Insert or replace a service row
    ///
    /// Fails with [`StoreError::Conflict`] if another id already owns the
    /// `(name, instance_id)` pair.
    async fn upsert_service(&self, service: &Service) -> StoreResult<()>;

    /// Delete a service row, returning it if it existed
    async fn delete_service(&self, id: ServiceId) -> StoreResult<Option<Service>>;

    /// Apply a heartbeat update, returning the new count (None if unknown)
    async fn update_heartbeats(
        &self,
        id: ServiceId,
        update: HeartbeatUpdate,
    ) -> StoreResult<Option<u32>>;

    async fn add_interest(&self, key: &RoutingKey, id: ServiceId) -> StoreResult<InterestChange>;

    async fn remove_interest(&self, key: &RoutingKey, id: ServiceId)
        -> StoreResult<InterestChange>;

    /// Services interested in `key` (join of interests and services)
    async fn list_subscribers(&self, key: &RoutingKey) -> StoreResult<Vec<Service>>;

    /// All keys with at least one interested service, ordered by key
    async fn list_routes(&self) -> StoreResult<Vec<Route>>;

    /// Keys `id` is interested in, ordered
    async fn keys_of(&self, id: ServiceId) -> StoreResult<Vec<RoutingKey>>;
}
