//! Service registry with heartbeat liveness and load-aware selection.
//!
//! Two-tier expiry: [`ServiceRegistry::check_heartbeats`] flips a service
//! unhealthy once it misses `max_missed` heartbeats, and
//! [`ServiceRegistry::cleanup`] reclaims services that stayed unhealthy for
//! `cleanup_cycles` cleanup intervals. A healthy service is never removed
//! except by [`unregister`](ServiceRegistry::unregister).

mod advertise;
mod ops;
mod select;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, chrono_duration};
use crate::error::CoreError;

pub use advertise::{
    Advertisement, Advertiser, DEFAULT_SERVICE_TYPE, MdnsAdvertiser, NoopAdvertiser,
};
pub use ops::{OpsResponse, RegistryCommand};
pub use select::SelectionStrategy;

const EVENT_CHANNEL_SIZE: usize = 256;
const DEFAULT_PRIORITY: u32 = 100;

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Expected heartbeat cadence of registered services.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before a service is marked unhealthy.
    pub max_missed: u32,
    /// How often the supervisor evaluates heartbeat deadlines.
    pub check_interval: Duration,
    /// How often unhealthy services are considered for removal.
    pub cleanup_interval: Duration,
    /// Cleanup intervals a service must stay unhealthy before removal.
    pub cleanup_cycles: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed: 3,
            check_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            cleanup_cycles: 5,
        }
    }
}

impl RegistryConfig {
    /// Silence after which a service counts as dead.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.max_missed)
    }

    /// Unhealthy time after which a service is reclaimed.
    pub fn removal_after(&self) -> Duration {
        self.cleanup_interval.saturating_mul(self.cleanup_cycles)
    }
}

// ── Types ────────────────────────────────────────────────────────────

/// A backend service instance known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredService {
    pub id: String,
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub capabilities: Vec<String>,
    /// Lower is preferred.
    pub priority: u32,
    pub healthy: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub connections: u64,
    pub total_requests: u64,
    pub metadata: BTreeMap<String, String>,
}

impl RegisteredService {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[cfg(test)]
    pub(crate) fn placeholder(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_owned(),
            name: id.to_owned(),
            service_type: "test".into(),
            host: "127.0.0.1".into(),
            port: 1,
            version: "0.0.0".into(),
            capabilities: Vec::new(),
            priority: DEFAULT_PRIORITY,
            healthy: true,
            registered_at: now,
            last_seen: now,
            unhealthy_since: None,
            connections: 0,
            total_requests: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Registration payload. Re-registering an existing id updates it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Derived as `{type}-{host}-{port}` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type", alias = "serviceType")]
    pub service_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RegisterRequest {
    fn resolved_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}-{}", self.service_type, self.host, self.port))
    }

    fn validate(&self) -> Result<(), CoreError> {
        let field = if self.name.trim().is_empty() {
            "name"
        } else if self.service_type.trim().is_empty() {
            "type"
        } else if self.host.trim().is_empty() {
            "host"
        } else if self.port == 0 {
            "port"
        } else {
            return Ok(());
        };
        Err(CoreError::Validation {
            field: field.into(),
            reason: "is required".into(),
        })
    }
}

/// Filter for [`ServiceRegistry::list`]. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFilter {
    #[serde(default, rename = "type", alias = "serviceType")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub healthy_only: bool,
    #[serde(default)]
    pub capability: Option<String>,
}

impl ServiceFilter {
    fn matches(&self, service: &RegisteredService) -> bool {
        self.service_type
            .as_ref()
            .is_none_or(|t| &service.service_type == t)
            && (!self.healthy_only || service.healthy)
            && self
                .capability
                .as_ref()
                .is_none_or(|c| service.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStats {
    pub total: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_type: BTreeMap<String, TypeStats>,
    pub average_connections: f64,
    pub total_requests: u64,
}

/// Published on registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { id: String },
    Updated { id: String },
    Unregistered { id: String },
    BecameUnhealthy { id: String },
    BecameHealthy { id: String },
    Removed { id: String },
}

// ── Registry ─────────────────────────────────────────────────────────

pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
    round_robin: DashMap<String, usize>,
    config: RegistryConfig,
    clock: SharedClock,
    advertiser: Arc<dyn Advertiser>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, clock: SharedClock, advertiser: Arc<dyn Advertiser>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            services: DashMap::new(),
            round_robin: DashMap::new(),
            config,
            clock,
            advertiser,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ── Membership ───────────────────────────────────────────────────

    /// Create or update a service. Updates keep `registered_at` and the
    /// load counters, and mark the service healthy.
    pub fn register(&self, request: RegisterRequest) -> Result<RegisteredService, CoreError> {
        request.validate()?;
        let id = request.resolved_id();
        let now = self.clock.now();
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);

        let (service, created) = match self.services.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.name = request.name;
                existing.service_type = request.service_type;
                existing.host = request.host;
                existing.port = request.port;
                existing.version = request.version;
                existing.capabilities = request.capabilities;
                existing.priority = priority;
                existing.metadata = request.metadata;
                existing.healthy = true;
                existing.unhealthy_since = None;
                existing.last_seen = now;
                (existing.clone(), false)
            }
            Entry::Vacant(slot) => {
                let service = RegisteredService {
                    id: id.clone(),
                    name: request.name,
                    service_type: request.service_type,
                    host: request.host,
                    port: request.port,
                    version: request.version,
                    capabilities: request.capabilities,
                    priority,
                    healthy: true,
                    registered_at: now,
                    last_seen: now,
                    unhealthy_since: None,
                    connections: 0,
                    total_requests: 0,
                    metadata: request.metadata,
                };
                slot.insert(service.clone());
                (service, true)
            }
        };

        if created {
            info!(id = %id, service_type = %service.service_type, address = %service.address(), "service registered");
            self.emit(RegistryEvent::Registered { id });
        } else {
            debug!(id = %id, "service registration updated");
            self.emit(RegistryEvent::Updated { id });
        }
        Ok(service)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.services.remove(id).is_some();
        if removed {
            info!(id, "service unregistered");
            self.emit(RegistryEvent::Unregistered { id: id.to_owned() });
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<RegisteredService> {
        self.services.get(id).map(|s| s.clone())
    }

    /// Matching services, sorted by type, priority and id.
    pub fn list(&self, filter: &ServiceFilter) -> Vec<RegisteredService> {
        let mut out: Vec<RegisteredService> = self
            .services
            .iter()
            .filter(|s| filter.matches(s))
            .map(|s| s.clone())
            .collect();
        out.sort_by(|a, b| {
            (&a.service_type, a.priority, &a.id).cmp(&(&b.service_type, b.priority, &b.id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    // ── Liveness ─────────────────────────────────────────────────────

    /// Touch `last_seen`, merge metadata and force the service healthy.
    /// Returns `false` for unknown ids.
    pub fn record_heartbeat(&self, id: &str, metadata: Option<BTreeMap<String, String>>) -> bool {
        let now = self.clock.now();
        let recovered = {
            let Some(mut service) = self.services.get_mut(id) else {
                return false;
            };
            service.last_seen = now;
            if let Some(metadata) = metadata {
                service.metadata.extend(metadata);
            }
            let recovered = !service.healthy;
            service.healthy = true;
            service.unhealthy_since = None;
            recovered
        };

        if recovered {
            info!(id, "service healthy again after heartbeat");
            self.emit(RegistryEvent::BecameHealthy { id: id.to_owned() });
        }
        true
    }

    /// Set health explicitly. Returns `false` for unknown ids.
    pub fn update_health(&self, id: &str, healthy: bool) -> bool {
        let now = self.clock.now();
        let changed = {
            let Some(mut service) = self.services.get_mut(id) else {
                return false;
            };
            let changed = service.healthy != healthy;
            service.healthy = healthy;
            if healthy {
                service.unhealthy_since = None;
            } else if service.unhealthy_since.is_none() {
                service.unhealthy_since = Some(now);
            }
            changed
        };

        if changed {
            let id = id.to_owned();
            if healthy {
                self.emit(RegistryEvent::BecameHealthy { id });
            } else {
                self.emit(RegistryEvent::BecameUnhealthy { id });
            }
        }
        true
    }

    /// Flip every service whose heartbeat deadline has passed to
    /// unhealthy. Returns the ids that changed.
    pub fn check_heartbeats(&self) -> Vec<String> {
        let now = self.clock.now();
        let deadline = chrono_duration(self.config.heartbeat_deadline());
        let mut expired = Vec::new();

        for mut service in self.services.iter_mut() {
            if service.healthy && now - service.last_seen > deadline {
                service.healthy = false;
                service.unhealthy_since = Some(now);
                expired.push(service.id.clone());
            }
        }

        for id in &expired {
            warn!(id = %id, "service missed heartbeats, marked unhealthy");
            self.emit(RegistryEvent::BecameUnhealthy { id: id.clone() });
        }
        expired
    }

    /// Remove services unhealthy for longer than the removal window.
    /// Returns the removed ids.
    pub fn cleanup(&self) -> Vec<String> {
        let now = self.clock.now();
        let window = chrono_duration(self.config.removal_after());
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|s| {
                !s.healthy && s.unhealthy_since.is_some_and(|since| now - since >= window)
            })
            .map(|s| s.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            // Re-check under the entry lock; a heartbeat may have landed.
            if self.services.remove_if(&id, |_, s| !s.healthy).is_some() {
                info!(id = %id, "stale service removed");
                self.emit(RegistryEvent::Removed { id: id.clone() });
                removed.push(id);
            }
        }
        removed
    }

    // ── Selection & load ─────────────────────────────────────────────

    /// Pick a healthy service of `service_type`.
    pub fn select_best(
        &self,
        service_type: &str,
        strategy: SelectionStrategy,
    ) -> Option<RegisteredService> {
        let mut candidates: Vec<RegisteredService> = self
            .services
            .iter()
            .filter(|s| s.healthy && s.service_type == service_type)
            .map(|s| s.clone())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let turn = if strategy == SelectionStrategy::RoundRobin {
            let mut cursor = self.round_robin.entry(service_type.to_owned()).or_insert(0);
            let turn = *cursor;
            *cursor = cursor.wrapping_add(1);
            turn
        } else {
            0
        };

        let index = select::pick(&candidates, strategy, turn)?;
        let chosen = candidates.swap_remove(index);
        debug!(service_type, %strategy, id = %chosen.id, "service selected");
        Some(chosen)
    }

    /// Count a new connection routed to the service.
    pub fn record_connection(&self, id: &str) -> bool {
        self.services
            .get_mut(id)
            .map(|mut s| {
                s.connections += 1;
                s.total_requests += 1;
            })
            .is_some()
    }

    pub fn record_disconnection(&self, id: &str) -> bool {
        self.services
            .get_mut(id)
            .map(|mut s| s.connections = s.connections.saturating_sub(1))
            .is_some()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        let mut connections = 0u64;

        for service in &self.services {
            stats.total += 1;
            let by_type = stats
                .by_type
                .entry(service.service_type.clone())
                .or_default();
            by_type.total += 1;
            if service.healthy {
                stats.healthy += 1;
                by_type.healthy += 1;
            }
            connections += service.connections;
            stats.total_requests += service.total_requests;
        }

        stats.unhealthy = stats.total - stats.healthy;
        if stats.total > 0 {
            stats.average_connections = connections as f64 / stats.total as f64;
        }
        stats
    }

    // ── Advertisement ────────────────────────────────────────────────

    /// Announce over mDNS. Failure is logged and reported as `false`;
    /// in-process lookups keep working either way.
    pub fn advertise(&self, ad: &Advertisement) -> bool {
        match self.advertiser.advertise(ad) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, instance = %ad.instance, "mDNS advertisement failed; continuing without it");
                false
            }
        }
    }

    pub fn withdraw(&self) {
        self.advertiser.withdraw();
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn registry() -> (ServiceRegistry, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let registry =
            ServiceRegistry::new(RegistryConfig::default(), clock.clone(), Arc::new(NoopAdvertiser));
        (registry, clock)
    }

    fn request(id: &str, service_type: &str, priority: u32) -> RegisterRequest {
        RegisterRequest {
            id: Some(id.into()),
            name: format!("{id} service"),
            service_type: service_type.into(),
            host: "10.0.0.1".into(),
            port: 7420,
            version: "1.2.0".into(),
            capabilities: vec!["print".into()],
            priority: Some(priority),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn register_then_select_round_trip() {
        let (reg, _clock) = registry();
        reg.register(request("gw-1", "gateway", 10)).unwrap();

        let chosen = reg.select_best("gateway", SelectionStrategy::Priority).unwrap();
        assert_eq!(chosen.id, "gw-1");

        assert!(reg.unregister("gw-1"));
        assert!(reg.select_best("gateway", SelectionStrategy::Priority).is_none());
        assert!(!reg.unregister("gw-1"));
    }

    #[test]
    fn re_register_preserves_identity_and_counters() {
        let (reg, clock) = registry();
        let first = reg.register(request("gw-1", "gateway", 10)).unwrap();
        reg.record_connection("gw-1");

        clock.advance(Duration::from_secs(5));
        let mut update = request("gw-1", "gateway", 1);
        update.version = "1.3.0".into();
        let second = reg.register(update).unwrap();

        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.total_requests, 1);
        assert_eq!(second.connections, 1);
        assert_eq!(second.version, "1.3.0");
        assert_eq!(second.priority, 1);
        assert!(second.last_seen > first.last_seen);
    }

    #[test]
    fn id_is_derived_when_missing() {
        let (reg, _clock) = registry();
        let mut req = request("x", "gateway", 1);
        req.id = None;
        let svc = reg.register(req).unwrap();
        assert_eq!(svc.id, "gateway-10.0.0.1-7420");
    }

    #[test]
    fn register_validates_required_fields() {
        let (reg, _clock) = registry();
        let mut req = request("x", "gateway", 1);
        req.port = 0;
        let err = reg.register(req).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "port"));
    }

    #[test]
    fn missed_heartbeats_flip_unhealthy_and_heartbeat_restores() {
        let (reg, clock) = registry();
        let mut events = reg.subscribe();
        reg.register(request("gw-1", "gateway", 1)).unwrap();

        clock.advance(Duration::from_secs(89));
        assert!(reg.check_heartbeats().is_empty());

        clock.advance(Duration::from_secs(2));
        assert_eq!(reg.check_heartbeats(), vec!["gw-1".to_owned()]);
        assert!(!reg.get("gw-1").unwrap().healthy);
        assert!(reg.select_best("gateway", SelectionStrategy::Priority).is_none());

        // No cool-down.
        assert!(reg.record_heartbeat("gw-1", None));
        assert!(reg.get("gw-1").unwrap().healthy);
        assert!(reg.select_best("gateway", SelectionStrategy::Priority).is_some());

        let seen: Vec<RegistryEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                RegistryEvent::Registered { id: "gw-1".into() },
                RegistryEvent::BecameUnhealthy { id: "gw-1".into() },
                RegistryEvent::BecameHealthy { id: "gw-1".into() },
            ]
        );
    }

    #[test]
    fn each_service_has_its_own_deadline() {
        let (reg, clock) = registry();
        reg.register(request("old", "gateway", 1)).unwrap();
        clock.advance(Duration::from_secs(60));
        reg.register(request("new", "gateway", 1)).unwrap();
        clock.advance(Duration::from_secs(31));

        assert_eq!(reg.check_heartbeats(), vec!["old".to_owned()]);
        assert!(reg.get("new").unwrap().healthy);
    }

    #[test]
    fn cleanup_never_removes_healthy_services() {
        let (reg, clock) = registry();
        reg.register(request("dead", "gateway", 1)).unwrap();
        reg.register(request("alive", "gateway", 1)).unwrap();

        clock.advance(Duration::from_secs(91));
        reg.record_heartbeat("alive", None);
        reg.check_heartbeats();

        clock.advance(Duration::from_secs(299));
        assert!(reg.cleanup().is_empty());

        reg.record_heartbeat("alive", None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(reg.cleanup(), vec!["dead".to_owned()]);
        assert!(reg.get("dead").is_none());
        assert!(reg.get("alive").is_some());
    }

    #[test]
    fn heartbeat_merges_metadata_and_rejects_unknown() {
        let (reg, _clock) = registry();
        reg.register(request("gw-1", "gateway", 1)).unwrap();
        let meta = BTreeMap::from([("load".to_owned(), "0.4".to_owned())]);
        assert!(reg.record_heartbeat("gw-1", Some(meta)));
        assert_eq!(reg.get("gw-1").unwrap().metadata["load"], "0.4");
        assert!(!reg.record_heartbeat("ghost", None));
        assert!(!reg.update_health("ghost", true));
    }

    #[test]
    fn selection_strategies() {
        let (reg, _clock) = registry();
        reg.register(request("a", "gateway", 20)).unwrap();
        reg.register(request("b", "gateway", 10)).unwrap();
        reg.register(request("c", "gateway", 30)).unwrap();
        reg.register(request("z", "other", 1)).unwrap();
        reg.record_connection("b");
        reg.record_connection("b");
        reg.record_connection("a");

        let by_priority = reg.select_best("gateway", SelectionStrategy::Priority).unwrap();
        assert_eq!(by_priority.id, "b");

        let least = reg
            .select_best("gateway", SelectionStrategy::LeastConnections)
            .unwrap();
        assert_eq!(least.id, "c");

        let rr: Vec<String> = (0..4)
            .map(|_| {
                reg.select_best("gateway", SelectionStrategy::RoundRobin)
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(rr, ["a", "b", "c", "a"]);

        reg.update_health("b", false);
        let by_priority = reg.select_best("gateway", SelectionStrategy::Priority).unwrap();
        assert_eq!(by_priority.id, "a");
    }

    #[test]
    fn stats_summarize_by_type() {
        let (reg, _clock) = registry();
        reg.register(request("a", "gateway", 1)).unwrap();
        reg.register(request("b", "gateway", 1)).unwrap();
        reg.register(request("c", "renderer", 1)).unwrap();
        reg.record_connection("a");
        reg.record_connection("a");
        reg.record_disconnection("a");
        reg.record_connection("c");
        reg.update_health("b", false);

        let stats = reg.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.by_type["gateway"], TypeStats { total: 2, healthy: 1 });
        assert_eq!(stats.total_requests, 3);
        assert!((stats.average_connections - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn list_filters_and_sorts() {
        let (reg, _clock) = registry();
        reg.register(request("b", "gateway", 2)).unwrap();
        reg.register(request("a", "gateway", 5)).unwrap();
        let mut renderer = request("r", "renderer", 1);
        renderer.capabilities = vec!["pdf".into()];
        reg.register(renderer).unwrap();

        let gateways = reg.list(&ServiceFilter {
            service_type: Some("gateway".into()),
            ..ServiceFilter::default()
        });
        assert_eq!(
            gateways.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["b", "a"]
        );

        let pdf = reg.list(&ServiceFilter {
            capability: Some("pdf".into()),
            ..ServiceFilter::default()
        });
        assert_eq!(pdf.len(), 1);
        assert_eq!(reg.list(&ServiceFilter::default()).len(), 3);
    }

    struct FailingAdvertiser;

    impl Advertiser for FailingAdvertiser {
        fn advertise(&self, _ad: &Advertisement) -> Result<(), CoreError> {
            Err(CoreError::Advertise {
                reason: "no multicast interface".into(),
            })
        }

        fn withdraw(&self) {}
    }

    #[test]
    fn advertisement_failure_is_not_fatal() {
        let reg = ServiceRegistry::new(
            RegistryConfig::default(),
            ManualClock::starting_now(),
            Arc::new(FailingAdvertiser),
        );
        let ad = Advertisement {
            instance: "gw".into(),
            service_type: DEFAULT_SERVICE_TYPE.into(),
            port: 7420,
            properties: std::collections::HashMap::new(),
        };
        assert!(!reg.advertise(&ad));
        reg.register(request("gw-1", "gateway", 1)).unwrap();
        assert!(reg.select_best("gateway", SelectionStrategy::Priority).is_some());
    }
}
