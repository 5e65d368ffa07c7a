//! Liveness monitor
//!
//! One global timer. Every `heartbeat_period` each registered service is
//! pinged through the callback transport with its own `grpc_timeout`:
//!
//! ```text
//!   tick ──► ping every service (concurrently)
//!              │ answered          │ no answer / error
//!              ▼                   ▼
//!      missed_heartbeats = 0   missed_heartbeats += 1
//!                                   │ > allowed_miss
//!                                   ▼
//!                         MessageRouter::evict
//! ```
//!
//! The monitor is the only writer that increments the counter.
//! Re-registration resets it as a side effect of `RegisterService`; a miss
//! whose ping was still in flight at that point is not counted.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::callback::CallbackError;
use crate::registry::{Service, ServiceId};
use crate::router::{Heartbeat, MessageRouter};

/// What one liveness tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Services that answered the ping
    pub confirmed: Vec<ServiceId>,
    /// Services that did not answer
    pub missed: Vec<ServiceId>,
    /// Services evicted this tick (subset of `missed`)
    pub evicted: Vec<ServiceId>,
}

/// Periodic heartbeat checker
pub struct LivenessMonitor {
    router: Arc<MessageRouter>,
    period: Duration,
    allowed_miss: u32,
}

impl LivenessMonitor {
    /// Monitor using the router's `heartbeat_period` and `allowed_miss`
    pub fn new(router: Arc<MessageRouter>) -> Self {
        let period = router.config().heartbeat_period;
        let allowed_miss = router.config().allowed_miss;
        Self {
            router,
            period,
            allowed_miss,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn allowed_miss(&self) -> u32 {
        self.allowed_miss
    }

    /// Run one liveness round
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        // Markers first, so a confirmation racing the listing is still seen
        let markers = self.router.services().confirmations();
        let services = match self.router.services().list().await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(error = %e, "Liveness tick skipped, registry unavailable");
                return report;
            }
        };

        let results = join_all(services.iter().map(|service| self.check(service))).await;

        for (service, alive) in services.iter().zip(results) {
            let seen = markers.get(&service.id).copied().unwrap_or(0);
            let heartbeat = self
                .router
                .record_heartbeat(service.id, alive, seen, self.allowed_miss)
                .await;
            let (count, evicted) = match heartbeat {
                Ok(Some(Heartbeat::Missed(count))) => (count, false),
                Ok(Some(Heartbeat::Evicted(count))) => (count, true),
                Ok(Some(Heartbeat::Confirmed | Heartbeat::Superseded)) => {
                    report.confirmed.push(service.id);
                    continue;
                }
                // unregistered meanwhile
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(service = %service.id, error = %e, "Failed to record heartbeat");
                    continue;
                }
            };

            report.missed.push(service.id);
            tracing::debug!(
                service = %service.id,
                name = %service.name,
                missed_heartbeats = count,
                allowed_miss = self.allowed_miss,
                "Heartbeat missed"
            );
            if evicted {
                report.evicted.push(service.id);
            }
        }

        tracing::trace!(
            confirmed = report.confirmed.len(),
            missed = report.missed.len(),
            evicted = report.evicted.len(),
            "Liveness tick"
        );

        report
    }

    async fn check(&self, service: &Service) -> bool {
        let deadline = service.grpc_timeout;
        let result = match tokio::time::timeout(deadline, self.router.callbacks().ping(service)).await {
            Ok(result) => result,
            Err(_) => Err(CallbackError::Timeout(deadline)),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(service = %service.id, error = %e, "Liveness ping failed");
                false
            }
        }
    }

    /// Spawn the periodic loop; the first tick fires one period from now
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + monitor.period, monitor.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                period_ms = monitor.period.as_millis() as u64,
                allowed_miss = monitor.allowed_miss,
                "Liveness monitor started"
            );

            loop {
                ticker.tick().await;
                monitor.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::callback::{CallbackTransport, ForwardedMessage};
    use crate::registry::RegisterServiceRequest;
    use crate::router::RouterConfig;
    use crate::store::MemoryStore;

    /// Pings fail for every service name in `down`, after `delay` if set
    #[derive(Default)]
    struct Pinger {
        down: Mutex<HashSet<String>>,
        delay: Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl CallbackTransport for Pinger {
        async fn deliver(&self, _: &Service, _: &ForwardedMessage) -> Result<(), CallbackError> {
            Ok(())
        }

        async fn ping(&self, target: &Service) -> Result<(), CallbackError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.down.lock().unwrap().contains(&target.name) {
                Err(CallbackError::Unreachable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(allowed_miss: u32) -> (Arc<MessageRouter>, Arc<Pinger>, LivenessMonitor) {
        let pinger = Arc::new(Pinger::default());
        let router = Arc::new(MessageRouter::new(
            RouterConfig::default().allowed_miss(allowed_miss),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryBroker::new()),
            pinger.clone(),
        ));
        let monitor = LivenessMonitor::new(Arc::clone(&router));
        (router, pinger, monitor)
    }

    async fn register(router: &MessageRouter, name: &str) -> ServiceId {
        let req = RegisterServiceRequest::new(name, "i1", "http://cb").routing_key("k");
        router.register_service(&req).await.unwrap().service_uuid
    }

    #[tokio::test]
    async fn test_eviction_threshold() {
        let (router, pinger, monitor) = setup(2);
        let id = register(&router, "flaky").await;
        router.start_handling(id).await.unwrap();
        pinger.down.lock().unwrap().insert("flaky".into());

        // reaching allowed_miss is tolerated
        for _ in 0..2 {
            let report = monitor.tick().await;
            assert_eq!(report.missed, vec![id]);
            assert!(report.evicted.is_empty());
        }
        assert_eq!(router.services().get(id).await.unwrap().missed_heartbeats, 2);

        let report = monitor.tick().await;
        assert_eq!(report.evicted, vec![id]);
        assert!(router.services().get(id).await.unwrap_err().is_not_found());
        assert!(router.list_routes().await.unwrap().is_empty());
        assert_eq!(router.subscriptions().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_answering_ping_resets_counter() {
        let (router, pinger, monitor) = setup(1);
        let id = register(&router, "svc").await;

        pinger.down.lock().unwrap().insert("svc".into());
        monitor.tick().await;
        assert_eq!(router.services().get(id).await.unwrap().missed_heartbeats, 1);

        pinger.down.lock().unwrap().clear();
        let report = monitor.tick().await;
        assert_eq!(report.confirmed, vec![id]);
        assert_eq!(router.services().get(id).await.unwrap().missed_heartbeats, 0);
    }

    #[tokio::test]
    async fn test_reregistration_resets_counter() {
        let (router, pinger, monitor) = setup(1);
        let id = register(&router, "svc").await;

        pinger.down.lock().unwrap().insert("svc".into());
        monitor.tick().await;
        assert_eq!(register(&router, "svc").await, id);

        // counter restarted from zero, so one more miss is still tolerated
        let report = monitor.tick().await;
        assert!(report.evicted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_during_ping_is_not_evicted() {
        let (router, pinger, monitor) = setup(0);
        let id = register(&router, "svc").await;
        pinger.down.lock().unwrap().insert("svc".into());
        *pinger.delay.lock().unwrap() = Some(Duration::from_millis(200));

        let monitor = Arc::new(monitor);
        let tick = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.tick().await })
        };

        // the ping is still pending when the service registers again
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(register(&router, "svc").await, id);

        let report = tick.await.unwrap();
        assert_eq!(report.confirmed, vec![id]);
        assert!(report.missed.is_empty());
        assert!(report.evicted.is_empty());
        assert_eq!(router.services().get(id).await.unwrap().missed_heartbeats, 0);

        // the next failed ping counts again
        *pinger.delay.lock().unwrap() = None;
        let report = monitor.tick().await;
        assert_eq!(report.evicted, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_evicts() {
        let (router, pinger, monitor) = setup(0);
        let id = register(&router, "gone").await;
        pinger.down.lock().unwrap().insert("gone".into());

        let monitor = Arc::new(monitor);
        let handle = monitor.spawn();

        tokio::time::sleep(monitor.period()).await;
        for _ in 0..50 {
            if router.services().get(id).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(router.services().get(id).await.unwrap_err().is_not_found());
        handle.abort();
    }
}
