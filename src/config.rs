use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HubError, Result};
use crate::queue::QueueConfig;
use crate::registry::{InstanceRegistration, RegistryConfig};
use crate::retry::RetryConfig;
use crate::utils::CircuitBreakerConfig;

// ============================================================================
// Hub Configuration
// ============================================================================
//
// Defaults live on each component's config struct. `from_env` overlays
// HUB_* variables on top; a variable that is set but unparsable is a
// configuration error, never silently ignored.
//
// ============================================================================

/// Dispatch loop settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Messages pulled from the queue per iteration
    pub batch_size: usize,
    pub interval: Duration,
    /// Bound on a single delivery, including connect
    pub delivery_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval: Duration::from_millis(100),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dispatch: DispatchConfig,
    /// Redis backing store; in-process store when unset
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub metrics_port: u16,
    /// Instances registered at startup
    pub instances: Vec<InstanceRegistration>,
    /// Per-destination dispatch quotas applied at startup
    pub quotas: HashMap<String, u32>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dispatch: DispatchConfig::default(),
            redis_url: None,
            key_prefix: "hub".to_string(),
            metrics_port: 9090,
            instances: Vec::new(),
            quotas: HashMap::new(),
        }
    }
}

/// Typed reads over a variable lookup
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| HubError::Config(format!("{key}={value}: {e}"))),
            None => Ok(None),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.raw(key) {
            Some(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|e| HubError::Config(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl HubConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (the process environment in
    /// production, a map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = HubConfig::default();

        config.redis_url = env.raw("HUB_REDIS_URL");
        set(&mut config.key_prefix, env.raw("HUB_KEY_PREFIX"));
        set(&mut config.metrics_port, env.parse("HUB_METRICS_PORT")?);

        let queue = &mut config.queue;
        set(&mut queue.max_queue_size, env.parse("HUB_MAX_QUEUE_SIZE")?);
        set(&mut queue.throttle_ratio, env.parse("HUB_THROTTLE_RATIO")?);
        set(
            &mut queue.requeue_downgrade_threshold,
            env.parse("HUB_REQUEUE_DOWNGRADE_THRESHOLD")?,
        );
        set(&mut queue.quota_window, env.secs("HUB_QUOTA_WINDOW_SECS")?);
        set(&mut queue.janitor_interval, env.millis("HUB_JANITOR_INTERVAL_MS")?);

        let retry = &mut config.retry;
        set(&mut retry.max_attempts, env.parse("HUB_MAX_ATTEMPTS")?);
        set(&mut retry.backoff.base_delay, env.millis("HUB_RETRY_BASE_DELAY_MS")?);
        set(&mut retry.backoff.max_delay, env.millis("HUB_RETRY_MAX_DELAY_MS")?);
        set(&mut retry.backoff.jitter_factor, env.parse("HUB_RETRY_JITTER")?);
        set(&mut retry.scan_interval, env.millis("HUB_RETRY_SCAN_INTERVAL_MS")?);
        set(&mut retry.stranded_after, env.secs("HUB_RETRY_STRANDED_AFTER_SECS")?);
        set(
            &mut retry.reset_attempts_on_reprocess,
            env.parse("HUB_RESET_ATTEMPTS_ON_REPROCESS")?,
        );

        let registry = &mut config.registry;
        set(&mut registry.strategy, env.parse("HUB_SELECTION_STRATEGY")?);
        set(
            &mut registry.health_check_interval,
            env.secs("HUB_HEALTH_CHECK_INTERVAL_SECS")?,
        );
        set(&mut registry.probe_timeout, env.millis("HUB_PROBE_TIMEOUT_MS")?);
        set(
            &mut registry.slow_response_threshold,
            env.millis("HUB_SLOW_RESPONSE_MS")?,
        );
        set(
            &mut registry.cascade_dependency_health,
            env.parse("HUB_CASCADE_DEPENDENCY_HEALTH")?,
        );
        if let Some(ttl) = env.secs("HUB_INSTANCE_TTL_SECS")? {
            registry.instance_ttl = Some(ttl);
        }
        set(&mut registry.unhealthy_fallback, env.parse("HUB_UNHEALTHY_FALLBACK")?);

        let breaker = &mut config.circuit_breaker;
        set(&mut breaker.failure_threshold, env.parse("HUB_FAILURE_THRESHOLD")?);
        set(&mut breaker.cool_down, env.secs("HUB_COOL_DOWN_SECS")?);

        let dispatch = &mut config.dispatch;
        set(&mut dispatch.batch_size, env.parse("HUB_DISPATCH_BATCH_SIZE")?);
        set(&mut dispatch.interval, env.millis("HUB_DISPATCH_INTERVAL_MS")?);
        set(&mut dispatch.delivery_timeout, env.millis("HUB_DELIVERY_TIMEOUT_MS")?);

        set(&mut config.instances, env.json("HUB_INSTANCES")?);
        set(&mut config.quotas, env.json("HUB_QUOTAS")?);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_queue_size == 0 {
            return Err(HubError::Config("max_queue_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.queue.throttle_ratio) {
            return Err(HubError::Config(format!(
                "throttle_ratio {} outside 0..=1",
                self.queue.throttle_ratio
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(HubError::Config("max_attempts must be positive".to_string()));
        }
        if self.retry.backoff.jitter_factor < 0.0 {
            return Err(HubError::Config("retry jitter must not be negative".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(HubError::Config("failure_threshold must be positive".to_string()));
        }
        if self.dispatch.batch_size == 0 {
            return Err(HubError::Config("dispatch batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;
    use crate::registry::SelectionStrategy;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<HubConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HubConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.queue.max_queue_size, 10_000);
        assert_eq!(config.queue.requeue_downgrade_threshold, 3);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(!config.registry.unhealthy_fallback);
        assert!(config.redis_url.is_none());
        assert_eq!(config.key_prefix, "hub");
    }

    #[test]
    fn test_overrides_apply() {
        let config = from_pairs(&[
            ("HUB_REDIS_URL", "redis://cache:6379"),
            ("HUB_MAX_QUEUE_SIZE", "500"),
            ("HUB_RETRY_BASE_DELAY_MS", "250"),
            ("HUB_RETRY_STRANDED_AFTER_SECS", "90"),
            ("HUB_SELECTION_STRATEGY", "least_connections"),
            ("HUB_UNHEALTHY_FALLBACK", "true"),
            ("HUB_INSTANCE_TTL_SECS", "45"),
            ("HUB_QUOTAS", r#"{"llm-service": 20}"#),
        ])
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.queue.max_queue_size, 500);
        assert_eq!(config.retry.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.stranded_after, Duration::from_secs(90));
        assert_eq!(config.registry.strategy, SelectionStrategy::LeastConnections);
        assert!(config.registry.unhealthy_fallback);
        assert_eq!(config.registry.instance_ttl, Some(Duration::from_secs(45)));
        assert_eq!(config.quotas.get("llm-service"), Some(&20));
    }

    #[test]
    fn test_instances_from_json() {
        let config = from_pairs(&[(
            "HUB_INSTANCES",
            r#"[{"service_type":"content","instance_id":"c1","url":"http://c1:8000","capabilities":["entity_created","query"],"weight":2.0}]"#,
        )])
        .unwrap();
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].weight, 2.0);
        assert_eq!(
            config.instances[0].capabilities,
            vec![MessageType::EntityCreated, MessageType::Query]
        );
    }

    #[test]
    fn test_malformed_values_are_config_errors() {
        assert!(matches!(
            from_pairs(&[("HUB_MAX_QUEUE_SIZE", "lots")]),
            Err(HubError::Config(_))
        ));
        assert!(matches!(
            from_pairs(&[("HUB_INSTANCES", "not json")]),
            Err(HubError::Config(_))
        ));
        assert!(matches!(
            from_pairs(&[("HUB_MAX_QUEUE_SIZE", "0")]),
            Err(HubError::Config(_))
        ));
    }
}
