//! In-memory registry store

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    timeout_millis, HeartbeatUpdate, InterestChange, RegistryStore, StoreError, StoreResult,
};
use crate::broker::RoutingKey;
use crate::registry::{Route, Service, ServiceId};

#[derive(Default)]
struct Tables {
    services: HashMap<ServiceId, Service>,
    /// key -> interested service ids
    interests: BTreeMap<RoutingKey, BTreeSet<ServiceId>>,
}

/// Process-local store guarded by a single `RwLock`
///
/// One lock over both tables makes every trait method atomic. Reads
/// (subscriber resolution on every delivery) share the lock.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend becoming unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn get_service(&self, id: ServiceId) -> StoreResult<Option<Service>> {
        self.check()?;
        Ok(self.tables.read().await.services.get(&id).cloned())
    }

    async fn find_service(&self, name: &str, instance_id: &str) -> StoreResult<Option<Service>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .services
            .values()
            .find(|s| s.name == name && s.instance_id == instance_id)
            .cloned())
    }

    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut services: Vec<Service> = tables.services.values().cloned().collect();
        services.sort_by(|a, b| (&a.name, &a.instance_id).cmp(&(&b.name, &b.instance_id)));
        Ok(services)
    }

    async fn upsert_service(&self, service: &Service) -> StoreResult<()> {
        self.check()?;
        timeout_millis(service)?;
        let mut tables = self.tables.write().await;

        let clash = tables.services.values().any(|s| {
            s.id != service.id && s.name == service.name && s.instance_id == service.instance_id
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "{}/{} is already registered",
                service.name, service.instance_id
            )));
        }

        tables.services.insert(service.id, service.clone());
        Ok(())
    }

    async fn delete_service(&self, id: ServiceId) -> StoreResult<Option<Service>> {
        self.check()?;
        let mut tables = self.tables.write().await;

        let removed = tables.services.remove(&id);
        if removed.is_some() {
            tables.interests.retain(|_, ids| {
                ids.remove(&id);
                !ids.is_empty()
            });
        }
        Ok(removed)
    }

    async fn update_heartbeats(
        &self,
        id: ServiceId,
        update: HeartbeatUpdate,
    ) -> StoreResult<Option<u32>> {
        self.check()?;
        let mut tables = self.tables.write().await;

        Ok(tables.services.get_mut(&id).map(|service| {
            service.missed_heartbeats = match update {
                HeartbeatUpdate::Reset => 0,
                HeartbeatUpdate::Increment => service.missed_heartbeats.saturating_add(1),
            };
            service.missed_heartbeats
        }))
    }

    async fn add_interest(&self, key: &RoutingKey, id: ServiceId) -> StoreResult<InterestChange> {
        self.check()?;
        let mut tables = self.tables.write().await;

        let ids = tables.interests.entry(key.clone()).or_default();
        let changed = ids.insert(id);
        Ok(InterestChange {
            changed,
            remaining: ids.len(),
        })
    }

    async fn remove_interest(
        &self,
        key: &RoutingKey,
        id: ServiceId,
    ) -> StoreResult<InterestChange> {
        self.check()?;
        let mut tables = self.tables.write().await;

        let Some(ids) = tables.interests.get_mut(key) else {
            return Ok(InterestChange {
                changed: false,
                remaining: 0,
            });
        };

        let changed = ids.remove(&id);
        let remaining = ids.len();
        if remaining == 0 {
            tables.interests.remove(key);
        }

        Ok(InterestChange { changed, remaining })
    }

    async fn list_subscribers(&self, key: &RoutingKey) -> StoreResult<Vec<Service>> {
        self.check()?;
        let tables = self.tables.read().await;

        Ok(tables
            .interests
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.services.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_routes(&self) -> StoreResult<Vec<Route>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .interests
            .iter()
            .map(|(key, ids)| Route {
                key: key.clone(),
                service_ids: ids.iter().copied().collect(),
            })
            .collect())
    }

    async fn keys_of(&self, id: ServiceId) -> StoreResult<Vec<RoutingKey>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .interests
            .iter()
            .filter(|(_, ids)| ids.contains(&id))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
