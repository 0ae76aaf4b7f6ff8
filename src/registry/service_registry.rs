use dashmap::DashMap;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use super::instance::{HealthStatus, InstanceRegistration, ServiceInstance};
use super::probe::{HealthProbe, ProbeOutcome};
use super::selection::{self, SelectionStrategy};
use crate::clock::Clock;
use crate::error::{HubError, Result};
use crate::models::MessageType;
use crate::utils::BackgroundTasks;

// ============================================================================
// Enhanced Service Registry
// ============================================================================
//
// Live instances per service type, continuously probed, selected per call.
//
// Locking: the map of service type -> instance slots sits behind an RwLock
// that is only held to clone slot handles; every read or write of an
// instance goes through that instance's own Mutex. Neither lock is held
// across an await.
//
// Background work (started by `initialize`):
// - health checker: probes every instance, evicts stale heartbeats
// - dependency checker: flags services whose upstream has no usable instance
//
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub strategy: SelectionStrategy,
    pub health_check_interval: Duration,
    /// Upper bound on any single probe; expiry counts as UNHEALTHY
    pub probe_timeout: Duration,
    /// 2xx slower than this is DEGRADED
    pub slow_response_threshold: Duration,
    pub cascade_dependency_health: bool,
    pub dependency_check_interval: Duration,
    /// Evict instances without a heartbeat for this long
    pub instance_ttl: Option<Duration>,
    /// Allow selecting an UNHEALTHY instance when it is the only one of its type
    pub unhealthy_fallback: bool,
    pub rng_seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::HealthAware,
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            slow_response_threshold: Duration::from_secs(1),
            cascade_dependency_health: true,
            dependency_check_interval: Duration::from_secs(30),
            instance_ttl: None,
            unhealthy_fallback: false,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryMetrics {
    pub services: usize,
    pub instances: usize,
    pub by_health: BTreeMap<HealthStatus, usize>,
    pub in_flight: u64,
    pub selections: u64,
    pub empty_selections: u64,
    pub evictions: u64,
}

type Slot = Arc<Mutex<ServiceInstance>>;

fn lock(slot: &Slot) -> MutexGuard<'_, ServiceInstance> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct EnhancedServiceRegistry {
    config: RegistryConfig,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    services: RwLock<HashMap<String, Vec<Slot>>>,
    dependencies: RwLock<HashMap<String, HashSet<String>>>,
    cursors: DashMap<String, usize>,
    rng: Mutex<StdRng>,
    selections: AtomicU64,
    empty_selections: AtomicU64,
    evictions: AtomicU64,
    tasks: BackgroundTasks,
}

impl EnhancedServiceRegistry {
    pub fn new(config: RegistryConfig, probe: Arc<dyn HealthProbe>, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            probe,
            clock,
            services: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(HashMap::new()),
            cursors: DashMap::new(),
            rng: Mutex::new(rng),
            selections: AtomicU64::new(0),
            empty_selections: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            tasks: BackgroundTasks::new("service_registry"),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Start the health checker and, if enabled, the dependency checker
    pub fn initialize(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        self.tasks.spawn_periodic(
            "health_checker",
            self.config.health_check_interval,
            move || {
                let registry = registry.clone();
                async move {
                    registry.check_all_instances().await;
                }
            },
        );

        if self.config.cascade_dependency_health {
            let registry = Arc::clone(self);
            self.tasks.spawn_periodic(
                "dependency_checker",
                self.config.dependency_check_interval,
                move || {
                    let registry = registry.clone();
                    async move {
                        registry.check_dependencies();
                    }
                },
            );
        }

        tracing::info!(
            strategy = ?self.config.strategy,
            cascade = self.config.cascade_dependency_health,
            "Service registry initialized"
        );
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        tracing::info!("Service registry shut down");
    }

    fn read_services(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Slot>>> {
        self.services.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_services(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Slot>>> {
        self.services.write().unwrap_or_else(|e| e.into_inner())
    }

    fn slots_of(&self, service_type: &str) -> Vec<Slot> {
        self.read_services()
            .get(service_type)
            .cloned()
            .unwrap_or_default()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.read_services().values().flatten().cloned().collect()
    }

    fn find_slot(&self, service_type: &str, instance_id: &str) -> Option<Slot> {
        self.slots_of(service_type)
            .into_iter()
            .find(|slot| lock(slot).instance_id == instance_id)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Add an instance (health UNKNOWN until first probe). Registering an
    /// existing id refreshes its announcement and keeps its in-flight count.
    pub fn register_instance(&self, registration: InstanceRegistration) -> Result<ServiceInstance> {
        if registration.service_type.trim().is_empty() || registration.instance_id.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "service_type and instance_id are required".to_string(),
            ));
        }
        if registration.url.trim().is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "instance {} has no url",
                registration.instance_id
            )));
        }
        if !registration.weight.is_finite() || registration.weight < 0.0 {
            return Err(HubError::InvalidArgument(format!(
                "instance {} has invalid weight {}",
                registration.instance_id, registration.weight
            )));
        }

        let now = self.clock.now();
        let mut services = self.write_services();
        let slots = services.entry(registration.service_type.clone()).or_default();

        if let Some(slot) = slots
            .iter()
            .find(|slot| lock(slot).instance_id == registration.instance_id)
        {
            let mut instance = lock(slot);
            instance.url = registration.url;
            instance.health_path = registration.health_path;
            instance.version = registration.version;
            instance.capabilities = registration.capabilities.into_iter().collect();
            instance.weight = registration.weight;
            instance.last_heartbeat = now;
            tracing::info!(
                service_type = %instance.service_type,
                instance_id = %instance.instance_id,
                "Instance re-registered"
            );
            return Ok(instance.clone());
        }

        let instance = ServiceInstance::from_registration(registration, now);
        tracing::info!(
            service_type = %instance.service_type,
            instance_id = %instance.instance_id,
            url = %instance.url,
            version = %instance.version,
            capabilities = instance.capabilities.len(),
            "Instance registered"
        );
        let snapshot = instance.clone();
        slots.push(Arc::new(Mutex::new(instance)));
        Ok(snapshot)
    }

    pub fn deregister_instance(&self, service_type: &str, instance_id: &str) -> bool {
        let mut services = self.write_services();
        let Some(slots) = services.get_mut(service_type) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| lock(slot).instance_id != instance_id);
        let removed = slots.len() < before;
        if slots.is_empty() {
            services.remove(service_type);
        }
        if removed {
            tracing::info!(service_type = %service_type, instance_id = %instance_id, "Instance deregistered");
        }
        removed
    }

    pub fn heartbeat(&self, service_type: &str, instance_id: &str) -> bool {
        match self.find_slot(service_type, instance_id) {
            Some(slot) => {
                lock(&slot).last_heartbeat = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// `service_type` needs `depends_on` to be usable
    pub fn declare_dependency(&self, service_type: &str, depends_on: &str) {
        self.dependencies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service_type.to_string())
            .or_default()
            .insert(depends_on.to_string());
    }

    /// Drop instances whose last heartbeat is older than the TTL
    pub fn evict_stale(&self) -> usize {
        let Some(ttl) = self.config.instance_ttl else {
            return 0;
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let mut evicted = 0;

        let mut services = self.write_services();
        for slots in services.values_mut() {
            slots.retain(|slot| {
                let instance = lock(slot);
                let stale = now - instance.last_heartbeat > ttl;
                if stale {
                    tracing::warn!(
                        service_type = %instance.service_type,
                        instance_id = %instance.instance_id,
                        last_heartbeat = %instance.last_heartbeat,
                        "Evicting instance with expired heartbeat"
                    );
                    evicted += 1;
                }
                !stale
            });
        }
        services.retain(|_, slots| !slots.is_empty());
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Pick an instance of `service_type` (able to handle `message_type`
    /// when given) and count it as in flight. Every `Some` must be paired
    /// with `release_instance`.
    pub fn get_instance(
        &self,
        service_type: &str,
        message_type: Option<MessageType>,
    ) -> Option<ServiceInstance> {
        let slots = self.slots_of(service_type);
        let known = slots.len();

        let capable: Vec<(Slot, ServiceInstance)> = slots
            .into_iter()
            .map(|slot| {
                let snapshot = lock(&slot).clone();
                (slot, snapshot)
            })
            .filter(|(_, instance)| message_type.map_or(true, |t| instance.supports(t)))
            .collect();

        let usable: Vec<(Slot, ServiceInstance)> = capable
            .iter()
            .filter(|(_, instance)| !instance.effective_health().is_unhealthy())
            .cloned()
            .collect();

        let pool = if !usable.is_empty() {
            usable
        } else if self.config.unhealthy_fallback && known == 1 && capable.len() == 1 {
            tracing::warn!(
                service_type = %service_type,
                "Only instance is unhealthy, selecting it as fallback"
            );
            capable
        } else {
            self.empty_selections.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                service_type = %service_type,
                message_type = ?message_type,
                known,
                "No usable instance"
            );
            return None;
        };

        let cursor = {
            let mut entry = self.cursors.entry(service_type.to_string()).or_insert(0);
            let current = *entry;
            *entry = current.wrapping_add(1);
            current
        };
        let snapshots: Vec<ServiceInstance> = pool.iter().map(|(_, i)| i.clone()).collect();
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            selection::choose(self.config.strategy, &snapshots, cursor, &mut *rng)
        };

        let (slot, _) = &pool[index];
        let mut instance = lock(slot);
        instance.in_flight = instance.in_flight.saturating_add(1);
        self.selections.fetch_add(1, Ordering::Relaxed);
        Some(instance.clone())
    }

    /// Undo the in-flight increment of a `get_instance`
    pub fn release_instance(&self, instance: &ServiceInstance) {
        if let Some(slot) = self.find_slot(&instance.service_type, &instance.instance_id) {
            let mut current = lock(&slot);
            current.in_flight = current.in_flight.saturating_sub(1);
        }
    }

    pub fn list_instances(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.slots_of(service_type)
            .iter()
            .map(|slot| lock(slot).clone())
            .collect()
    }

    pub fn service_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read_services().keys().cloned().collect();
        types.sort();
        types
    }

    /// Whether any instance of `service_type` declares `message_type`,
    /// regardless of health
    pub fn has_capable_instance(&self, service_type: &str, message_type: MessageType) -> bool {
        self.slots_of(service_type)
            .iter()
            .any(|slot| lock(slot).supports(message_type))
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Probe every instance concurrently and apply the results. Returns
    /// how many instances were probed.
    pub async fn check_all_instances(&self) -> usize {
        self.evict_stale();

        let slots = self.all_slots();
        let probes = slots.iter().map(|slot| {
            let snapshot = lock(slot).clone();
            async move {
                match tokio::time::timeout(self.config.probe_timeout, self.probe.probe(&snapshot)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::new(HealthStatus::Unhealthy, self.config.probe_timeout)
                        .with_detail("health probe timed out"),
                }
            }
        });
        let outcomes = join_all(probes).await;

        let now = self.clock.now();
        for (slot, outcome) in slots.iter().zip(outcomes) {
            let mut instance = lock(slot);
            let previous = instance.health;
            instance.health = outcome.status;
            instance.last_check = Some(now);
            instance.last_latency_ms = Some(outcome.latency.as_millis() as u64);
            if outcome.status.is_unhealthy() {
                instance.consecutive_failures = instance.consecutive_failures.saturating_add(1);
            } else {
                instance.consecutive_failures = 0;
            }

            if previous != outcome.status {
                tracing::info!(
                    service_type = %instance.service_type,
                    instance_id = %instance.instance_id,
                    from = %previous,
                    to = %outcome.status,
                    detail = outcome.detail.as_deref().unwrap_or(""),
                    "Instance health changed"
                );
            }
        }
        slots.len()
    }

    /// Flag instances of services whose declared dependency has no usable
    /// instance. Returns how many instances changed flag.
    pub fn check_dependencies(&self) -> usize {
        let dependencies = self
            .dependencies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut changed = 0;

        for (service_type, upstreams) in dependencies {
            let impaired: Vec<&String> = upstreams
                .iter()
                .filter(|upstream| {
                    !self
                        .slots_of(upstream)
                        .iter()
                        .any(|slot| !lock(slot).health.is_unhealthy())
                })
                .collect();
            let is_impaired = !impaired.is_empty();

            for slot in self.slots_of(&service_type) {
                let mut instance = lock(&slot);
                if instance.upstream_impaired != is_impaired {
                    instance.upstream_impaired = is_impaired;
                    changed += 1;
                    if is_impaired {
                        tracing::warn!(
                            service_type = %service_type,
                            instance_id = %instance.instance_id,
                            upstream = ?impaired,
                            "Upstream dependency unavailable, instance degraded"
                        );
                    } else {
                        tracing::info!(
                            service_type = %service_type,
                            instance_id = %instance.instance_id,
                            "Upstream dependencies recovered"
                        );
                    }
                }
            }
        }
        changed
    }

    pub fn get_metrics(&self) -> RegistryMetrics {
        let services = self.read_services();
        let mut by_health = BTreeMap::new();
        let mut instances = 0;
        let mut in_flight = 0u64;

        for slot in services.values().flatten() {
            let instance = lock(slot);
            *by_health.entry(instance.effective_health()).or_insert(0) += 1;
            instances += 1;
            in_flight += u64::from(instance.in_flight);
        }

        RegistryMetrics {
            services: services.len(),
            instances,
            by_health,
            in_flight,
            selections: self.selections.load(Ordering::Relaxed),
            empty_selections: self.empty_selections.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    /// Probe that reports whatever health was scripted per instance id
    #[derive(Default)]
    struct ScriptedProbe {
        health: Mutex<HashMap<String, HealthStatus>>,
    }

    impl ScriptedProbe {
        fn set(&self, instance_id: &str, health: HealthStatus) {
            self.health.lock().unwrap().insert(instance_id.to_string(), health);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, instance: &ServiceInstance) -> ProbeOutcome {
            let status = self
                .health
                .lock()
                .unwrap()
                .get(&instance.instance_id)
                .copied()
                .unwrap_or(HealthStatus::Healthy);
            ProbeOutcome::new(status, Duration::from_millis(3))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        probe: Arc<ScriptedProbe>,
        registry: EnhancedServiceRegistry,
    }

    fn fixture(config: RegistryConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let probe = Arc::new(ScriptedProbe::default());
        let registry = EnhancedServiceRegistry::new(
            RegistryConfig {
                rng_seed: Some(42),
                ..config
            },
            probe.clone(),
            clock.clone(),
        );
        Fixture { clock, probe, registry }
    }

    fn content(id: &str) -> InstanceRegistration {
        InstanceRegistration::new("content", id, format!("http://{id}:8000"))
            .with_version("1.4.0")
            .with_capabilities([MessageType::EntityCreated, MessageType::Query])
    }

    #[tokio::test]
    async fn test_health_aware_lands_mostly_on_healthy() {
        let f = fixture(RegistryConfig::default());
        for id in ["healthy", "degraded", "unhealthy"] {
            f.registry.register_instance(content(id)).unwrap();
        }
        f.probe.set("healthy", HealthStatus::Healthy);
        f.probe.set("degraded", HealthStatus::Degraded);
        f.probe.set("unhealthy", HealthStatus::Unhealthy);
        assert_eq!(f.registry.check_all_instances().await, 3);

        let mut healthy = 0;
        for _ in 0..100 {
            let chosen = f.registry.get_instance("content", None).unwrap();
            assert_ne!(chosen.instance_id, "unhealthy");
            if chosen.instance_id == "healthy" {
                healthy += 1;
            }
            f.registry.release_instance(&chosen);
        }
        assert!(healthy >= 70, "healthy chosen {healthy} of 100");
    }

    #[tokio::test]
    async fn test_new_instance_starts_unknown_and_is_selectable() {
        let f = fixture(RegistryConfig::default());
        let registered = f.registry.register_instance(content("c1")).unwrap();
        assert_eq!(registered.health, HealthStatus::Unknown);
        assert!(f.registry.get_instance("content", Some(MessageType::Query)).is_some());
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let f = fixture(RegistryConfig::default());
        f.registry.register_instance(content("c1")).unwrap();
        assert!(f.registry.get_instance("content", Some(MessageType::BulkImport)).is_none());
        assert!(!f.registry.has_capable_instance("content", MessageType::BulkImport));
        assert!(f.registry.has_capable_instance("content", MessageType::EntityCreated));
        assert!(f.registry.get_instance("catalog", None).is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_sole_instance_needs_fallback_flag() {
        let f = fixture(RegistryConfig::default());
        f.registry.register_instance(content("only")).unwrap();
        f.probe.set("only", HealthStatus::Unhealthy);
        f.registry.check_all_instances().await;
        assert!(f.registry.get_instance("content", None).is_none());

        let f = fixture(RegistryConfig {
            unhealthy_fallback: true,
            ..RegistryConfig::default()
        });
        f.registry.register_instance(content("only")).unwrap();
        f.probe.set("only", HealthStatus::Unhealthy);
        f.registry.check_all_instances().await;
        let chosen = f.registry.get_instance("content", None).unwrap();
        assert_eq!(chosen.instance_id, "only");
    }

    #[tokio::test]
    async fn test_fallback_never_applies_with_peers() {
        let f = fixture(RegistryConfig {
            unhealthy_fallback: true,
            ..RegistryConfig::default()
        });
        f.registry.register_instance(content("a")).unwrap();
        f.registry.register_instance(content("b")).unwrap();
        f.probe.set("a", HealthStatus::Unhealthy);
        f.probe.set("b", HealthStatus::Unhealthy);
        f.registry.check_all_instances().await;
        assert!(f.registry.get_instance("content", None).is_none());
    }

    #[tokio::test]
    async fn test_in_flight_pairs_with_release() {
        let f = fixture(RegistryConfig {
            strategy: SelectionStrategy::LeastConnections,
            ..RegistryConfig::default()
        });
        f.registry.register_instance(content("a")).unwrap();
        f.registry.register_instance(content("b")).unwrap();

        let first = f.registry.get_instance("content", None).unwrap();
        let second = f.registry.get_instance("content", None).unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(f.registry.get_metrics().in_flight, 2);

        f.registry.release_instance(&first);
        f.registry.release_instance(&second);
        f.registry.release_instance(&second);
        assert_eq!(f.registry.get_metrics().in_flight, 0);
    }

    #[tokio::test]
    async fn test_round_robin_alternates() {
        let f = fixture(RegistryConfig {
            strategy: SelectionStrategy::RoundRobin,
            ..RegistryConfig::default()
        });
        f.registry.register_instance(content("a")).unwrap();
        f.registry.register_instance(content("b")).unwrap();

        let picks: Vec<String> = (0..4)
            .map(|_| {
                let chosen = f.registry.get_instance("content", None).unwrap();
                f.registry.release_instance(&chosen);
                chosen.instance_id
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_dependency_cascade_degrades_and_recovers() {
        let f = fixture(RegistryConfig::default());
        f.registry.register_instance(content("c1")).unwrap();
        f.registry
            .register_instance(InstanceRegistration::new("llm", "l1", "http://l1"))
            .unwrap();
        f.registry.declare_dependency("content", "llm");

        f.probe.set("l1", HealthStatus::Unhealthy);
        f.registry.check_all_instances().await;
        assert_eq!(f.registry.check_dependencies(), 1);

        let content = f.registry.list_instances("content").remove(0);
        assert_eq!(content.health, HealthStatus::Healthy);
        assert_eq!(content.effective_health(), HealthStatus::Degraded);

        f.probe.set("l1", HealthStatus::Healthy);
        f.registry.check_all_instances().await;
        assert_eq!(f.registry.check_dependencies(), 1);
        let content = f.registry.list_instances("content").remove(0);
        assert_eq!(content.effective_health(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_heartbeat_ttl_eviction() {
        let f = fixture(RegistryConfig {
            instance_ttl: Some(Duration::from_secs(30)),
            ..RegistryConfig::default()
        });
        f.registry.register_instance(content("a")).unwrap();
        f.registry.register_instance(content("b")).unwrap();

        f.clock.advance(chrono::Duration::seconds(20));
        assert!(f.registry.heartbeat("content", "a"));
        f.clock.advance(chrono::Duration::seconds(20));

        assert_eq!(f.registry.check_all_instances().await, 1);
        let remaining: Vec<String> = f
            .registry
            .list_instances("content")
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(remaining, vec!["a"]);
        assert_eq!(f.registry.get_metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_deregister_and_reregister() {
        let f = fixture(RegistryConfig::default());
        f.registry.register_instance(content("a")).unwrap();
        let held = f.registry.get_instance("content", None).unwrap();

        let updated = f.registry.register_instance(content("a").with_weight(3.0)).unwrap();
        assert_eq!(updated.weight, 3.0);
        assert_eq!(updated.in_flight, 1);
        f.registry.release_instance(&held);

        assert!(f.registry.deregister_instance("content", "a"));
        assert!(!f.registry.deregister_instance("content", "a"));
        assert!(f.registry.service_types().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let f = fixture(RegistryConfig::default());
        let result = f.registry.register_instance(content("a").with_weight(-1.0));
        assert!(matches!(result, Err(HubError::InvalidArgument(_))));
        let result = f.registry.register_instance(InstanceRegistration::new("content", "", "http://x"));
        assert!(matches!(result, Err(HubError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_slow_health_check_times_out_as_unhealthy() {
        struct HangingProbe;

        #[async_trait]
        impl HealthProbe for HangingProbe {
            async fn probe(&self, _instance: &ServiceInstance) -> ProbeOutcome {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ProbeOutcome::new(HealthStatus::Healthy, Duration::ZERO)
            }
        }

        let registry = EnhancedServiceRegistry::new(
            RegistryConfig {
                probe_timeout: Duration::from_millis(20),
                ..RegistryConfig::default()
            },
            Arc::new(HangingProbe),
            Arc::new(ManualClock::default()),
        );
        registry.register_instance(content("a")).unwrap();
        registry.check_all_instances().await;
        assert_eq!(registry.list_instances("content")[0].health, HealthStatus::Unhealthy);
    }
}
