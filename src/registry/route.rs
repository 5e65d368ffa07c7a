//! Routing-key interests
//!
//! The many-to-many relation between routing keys and services. A key
//! exists only while at least one service is interested in it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::service::{Service, ServiceId};
use crate::broker::RoutingKey;
use crate::error::Result;
use crate::store::RegistryStore;

/// A routing key and the services interested in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub key: RoutingKey,
    pub service_ids: Vec<ServiceId>,
}

impl Route {
    pub fn interest_count(&self) -> usize {
        self.service_ids.len()
    }
}

/// Route lifecycle on top of the registry store
#[derive(Clone)]
pub struct RouteRegistry {
    store: Arc<dyn RegistryStore>,
}

impl RouteRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Add `id` to the interested set of `key`
    ///
    /// Returns true when the key was newly created, which is the signal to
    /// open a broker subscription.
    pub async fn add_interest(&self, key: &RoutingKey, id: ServiceId) -> Result<bool> {
        let change = self.store.add_interest(key, id).await?;

        tracing::debug!(
            key = %key,
            service = %id,
            interested = change.remaining,
            created = change.created(),
            "Interest added"
        );

        Ok(change.created())
    }

    /// Remove `id` from the interested set of `key`
    ///
    /// Returns true when the set became empty, which is the signal to close
    /// the broker subscription.
    pub async fn remove_interest(&self, key: &RoutingKey, id: ServiceId) -> Result<bool> {
        let change = self.store.remove_interest(key, id).await?;

        tracing::debug!(
            key = %key,
            service = %id,
            interested = change.remaining,
            emptied = change.emptied(),
            "Interest removed"
        );

        Ok(change.emptied())
    }

    /// Current interested services of `key`, read from the store on every call
    pub async fn list_subscribers(&self, key: &RoutingKey) -> Result<Vec<Service>> {
        Ok(self.store.list_subscribers(key).await?)
    }

    /// All known keys with their interested services
    pub async fn list(&self) -> Result<Vec<Route>> {
        Ok(self.store.list_routes().await?)
    }

    /// Keys `id` is currently interested in
    pub async fn keys_of(&self, id: ServiceId) -> Result<Vec<RoutingKey>> {
        Ok(self.store.keys_of(id).await?)
    }
}
