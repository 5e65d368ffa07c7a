//! Registered services
//!
//! The [`Service`] record, its lifecycle state, and the [`ServiceRegistry`]
//! that manages records on top of a [`RegistryStore`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::RoutingKey;
use crate::error::{Error, Result};
use crate::store::{HeartbeatUpdate, RegistryStore};

/// Largest accepted `grpc_timeout_seconds`; the timeout is stored as
/// signed milliseconds
pub const MAX_GRPC_TIMEOUT_SECS: u64 = i64::MAX as u64 / 1000;

/// Stable identifier of a registration (`serviceUuid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::invalid(format!("invalid service uuid {s:?}: {e}")))
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Registered, not receiving messages yet
    Registered,
    /// Routing keys are active; matching messages are forwarded
    Handling,
    /// Forwarding stopped by the service
    Stopped,
    /// Removed by the liveness monitor
    Evicted,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Registered => "registered",
            ServiceState::Handling => "handling",
            ServiceState::Stopped => "stopped",
            ServiceState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(ServiceState::Registered),
            "handling" => Ok(ServiceState::Handling),
            "stopped" => Ok(ServiceState::Stopped),
            "evicted" => Ok(ServiceState::Evicted),
            other => Err(Error::invalid(format!("unknown service state {other:?}"))),
        }
    }
}

/// A registered consumer/producer of messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    /// Owning system (e.g. "registry", "billing")
    pub system_name: String,
    /// Logical service name
    pub name: String,
    /// Distinguishes replicas of the same logical service
    pub instance_id: String,
    /// Address the forwarding pipeline calls back on
    pub callback_uri: String,
    pub broker_uri: String,
    pub exchange: String,
    pub listen_queue: String,
    pub publish_queue: String,
    /// Per-call deadline for callbacks and liveness pings
    pub grpc_timeout: Duration,
    /// Keys activated by `StartHandling`
    pub routing_keys: Vec<RoutingKey>,
    pub missed_heartbeats: u32,
    pub state: ServiceState,
}

impl Service {
    /// Enter `Handling`; returns false if already handling
    pub fn start_handling(&mut self) -> bool {
        if self.state == ServiceState::Handling {
            return false;
        }
        self.state = ServiceState::Handling;
        true
    }

    /// Leave `Handling`; returns false if it was not handling
    pub fn stop_handling(&mut self) -> bool {
        if self.state != ServiceState::Handling {
            return false;
        }
        self.state = ServiceState::Stopped;
        true
    }

    pub fn is_handling(&self) -> bool {
        self.state == ServiceState::Handling
    }
}

/// `RegisterService` request as received on the Control API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterServiceRequest {
    pub system_name: String,
    pub service_name: String,
    pub instance_id: String,
    pub exchange: String,
    pub broker_uri: String,
    pub listen_queue: String,
    pub publish_queue: String,
    pub callback_uri: String,
    /// 0 selects the configured default
    pub grpc_timeout_seconds: u64,
    pub routing_keys: Vec<String>,
}

impl RegisterServiceRequest {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        callback_uri: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            callback_uri: callback_uri.into(),
            ..Default::default()
        }
    }

    pub fn system(mut self, system_name: impl Into<String>) -> Self {
        self.system_name = system_name.into();
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn grpc_timeout_seconds(mut self, seconds: u64) -> Self {
        self.grpc_timeout_seconds = seconds;
        self
    }

    /// Validate and normalize the routing keys (sorted, deduplicated)
    fn parse_keys(&self) -> Result<Vec<RoutingKey>> {
        if self.routing_keys.is_empty() {
            return Err(Error::invalid("at least one routing key is required"));
        }

        let keys = self
            .routing_keys
            .iter()
            .map(|k| RoutingKey::parse(k.as_str()))
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(keys.into_iter().collect())
    }
}

/// Read-only view returned by `ListServices` and `RegisterService`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service_uuid: ServiceId,
    pub system_name: String,
    pub service_name: String,
    pub instance_id: String,
    pub callback_uri: String,
    pub state: ServiceState,
    pub missed_heartbeats: u32,
    pub routing_keys: Vec<RoutingKey>,
}

impl From<&Service> for ServiceSummary {
    fn from(service: &Service) -> Self {
        Self {
            service_uuid: service.id,
            system_name: service.system_name.clone(),
            service_name: service.name.clone(),
            instance_id: service.instance_id.clone(),
            callback_uri: service.callback_uri.clone(),
            state: service.state,
            missed_heartbeats: service.missed_heartbeats,
            routing_keys: service.routing_keys.clone(),
        }
    }
}

/// Outcome of a registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// The stored record
    pub service: Service,
    /// Keys declared before this call, for a repeat registration
    pub previous_keys: Option<Vec<RoutingKey>>,
}

impl Registration {
    pub fn is_new(&self) -> bool {
        self.previous_keys.is_none()
    }
}

/// Outcome of removing a service and its interests
#[derive(Debug, Clone)]
pub struct Unregistration {
    pub service: Service,
    /// Keys whose interested set became empty
    pub emptied_keys: Vec<RoutingKey>,
}

/// Service lifecycle on top of the registry store
///
/// Does not serialize callers itself: the router holds the per-service and
/// per-key locks around every mutation.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    default_timeout: Duration,
    confirmations: Arc<Mutex<Confirmations>>,
}

/// Sequence number of the latest liveness confirmation per service
#[derive(Default)]
struct Confirmations {
    last: u64,
    by_service: HashMap<ServiceId, u64>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
            confirmations: Arc::new(Mutex::new(Confirmations::default())),
        }
    }

    /// Latest confirmation marker of `id`, 0 if never confirmed
    ///
    /// Bumped by `register` and `touch`. A liveness round compares the
    /// marker it saw before pinging with the current one to detect a
    /// confirmation that arrived while the ping was in flight.
    pub fn confirmation(&self, id: ServiceId) -> u64 {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_service
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of every confirmation marker
    pub fn confirmations(&self) -> HashMap<ServiceId, u64> {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_service
            .clone()
    }

    fn confirm(&self, id: ServiceId) {
        let mut confirmations = self.confirmations.lock().unwrap_or_else(PoisonError::into_inner);
        confirmations.last += 1;
        let marker = confirmations.last;
        confirmations.by_service.insert(id, marker);
    }

    fn forget(&self, id: ServiceId) {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_service
            .remove(&id);
    }

    /// Register a service, idempotent on `(service_name, instance_id)`
    ///
    /// A repeat registration keeps the id, replaces connectivity fields and
    /// declared keys, and resets `missed_heartbeats`.
    pub async fn register(&self, request: &RegisterServiceRequest) -> Result<Registration> {
        if request.service_name.trim().is_empty() {
            return Err(Error::invalid("service name is required"));
        }
        if request.callback_uri.trim().is_empty() {
            return Err(Error::invalid("callback uri is required"));
        }
        let routing_keys = request.parse_keys()?;

        let grpc_timeout = match request.grpc_timeout_seconds {
            0 => self.default_timeout,
            secs if secs > MAX_GRPC_TIMEOUT_SECS => {
                return Err(Error::invalid(format!(
                    "grpc timeout of {secs}s exceeds the maximum of {MAX_GRPC_TIMEOUT_SECS}s"
                )));
            }
            secs => Duration::from_secs(secs),
        };

        let existing = self
            .store
            .find_service(&request.service_name, &request.instance_id)
            .await?;

        let (service, previous_keys) = match existing {
            Some(mut service) => {
                let previous = std::mem::replace(&mut service.routing_keys, routing_keys);
                service.system_name = request.system_name.clone();
                service.callback_uri = request.callback_uri.clone();
                service.broker_uri = request.broker_uri.clone();
                service.exchange = request.exchange.clone();
                service.listen_queue = request.listen_queue.clone();
                service.publish_queue = request.publish_queue.clone();
                service.grpc_timeout = grpc_timeout;
                service.missed_heartbeats = 0;
                (service, Some(previous))
            }
            None => (
                Service {
                    id: ServiceId::new(),
                    system_name: request.system_name.clone(),
                    name: request.service_name.clone(),
                    instance_id: request.instance_id.clone(),
                    callback_uri: request.callback_uri.clone(),
                    broker_uri: request.broker_uri.clone(),
                    exchange: request.exchange.clone(),
                    listen_queue: request.listen_queue.clone(),
                    publish_queue: request.publish_queue.clone(),
                    grpc_timeout,
                    routing_keys,
                    missed_heartbeats: 0,
                    state: ServiceState::Registered,
                },
                None,
            ),
        };

        self.store.upsert_service(&service).await?;
        self.confirm(service.id);

        Ok(Registration {
            service,
            previous_keys,
        })
    }

    /// Remove a service record and every route interest it holds
    pub async fn unregister(&self, id: ServiceId) -> Result<Unregistration> {
        let service = self.get(id).await?;

        let mut emptied_keys = Vec::new();
        for key in self.store.keys_of(id).await? {
            let change = self.store.remove_interest(&key, id).await?;
            if change.emptied() {
                emptied_keys.push(key);
            }
        }

        self.store.delete_service(id).await?;
        self.forget(id);

        Ok(Unregistration {
            service,
            emptied_keys,
        })
    }

    /// Reset the missed-heartbeat counter
    pub async fn touch(&self, id: ServiceId) -> Result<()> {
        self.store
            .update_heartbeats(id, HeartbeatUpdate::Reset)
            .await?
            .ok_or_else(|| Error::not_found(format!("service {id}")))?;
        self.confirm(id);
        Ok(())
    }

    /// Count one missed heartbeat, returning the new total
    ///
    /// Only the liveness monitor calls this.
    pub async fn record_miss(&self, id: ServiceId) -> Result<u32> {
        self.store
            .update_heartbeats(id, HeartbeatUpdate::Increment)
            .await?
            .ok_or_else(|| Error::not_found(format!("service {id}")))
    }

    pub async fn get(&self, id: ServiceId) -> Result<Service> {
        self.store
            .get_service(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("service {id}")))
    }

    pub async fn find(&self, name: &str, instance_id: &str) -> Result<Option<Service>> {
        Ok(self.store.find_service(name, instance_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Service>> {
        Ok(self.store.list_services().await?)
    }

    /// Persist a state transition
    pub async fn set_state(&self, id: ServiceId, state: ServiceState) -> Result<Service> {
        let mut service = self.get(id).await?;
        service.state = state;
        self.store.upsert_service(&service).await?;
        Ok(service)
    }
}
