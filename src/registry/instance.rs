use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::MessageType;

/// Health of a service instance as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Registered, not probed yet
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_weight() -> f64 {
    1.0
}

/// What a service instance announces when it registers.
///
/// Also the element type of the `HUB_INSTANCES` startup list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub service_type: String,
    pub instance_id: String,
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<MessageType>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl InstanceRegistration {
    pub fn new(
        service_type: impl Into<String>,
        instance_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            instance_id: instance_id.into(),
            url: url.into(),
            health_path: default_health_path(),
            version: String::new(),
            capabilities: Vec::new(),
            weight: default_weight(),
        }
    }

    pub fn with_health_path(mut self, health_path: impl Into<String>) -> Self {
        self.health_path = health_path.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = MessageType>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// A live instance. The registry hands out clones; the authoritative copy
/// sits behind a per-instance lock.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    pub service_type: String,
    pub instance_id: String,
    pub url: String,
    pub health_path: String,
    pub version: String,
    pub capabilities: HashSet<MessageType>,
    pub weight: f64,
    /// Last probe result
    pub health: HealthStatus,
    /// Set while a declared dependency has no usable instance
    pub upstream_impaired: bool,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn from_registration(registration: InstanceRegistration, now: DateTime<Utc>) -> Self {
        Self {
            service_type: registration.service_type,
            instance_id: registration.instance_id,
            url: registration.url,
            health_path: registration.health_path,
            version: registration.version,
            capabilities: registration.capabilities.into_iter().collect(),
            weight: registration.weight,
            health: HealthStatus::Unknown,
            upstream_impaired: false,
            in_flight: 0,
            consecutive_failures: 0,
            last_latency_ms: None,
            registered_at: now,
            last_heartbeat: now,
            last_check: None,
        }
    }

    /// Health used for selection: a healthy instance with an impaired
    /// upstream counts as degraded
    pub fn effective_health(&self) -> HealthStatus {
        if self.upstream_impaired && self.health == HealthStatus::Healthy {
            HealthStatus::Degraded
        } else {
            self.health
        }
    }

    pub fn supports(&self, message_type: MessageType) -> bool {
        self.capabilities.contains(&message_type)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.url, &self.health_path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_defaults_from_json() {
        let json = r#"{"service_type":"content","instance_id":"c1","url":"http://c1:8000","capabilities":["entity_created"]}"#;
        let registration: InstanceRegistration = serde_json::from_str(json).unwrap();
        assert_eq!(registration.health_path, "/health");
        assert_eq!(registration.weight, 1.0);
        assert_eq!(registration.capabilities, vec![MessageType::EntityCreated]);
    }

    #[test]
    fn test_impaired_upstream_degrades_healthy_instance() {
        let mut instance =
            ServiceInstance::from_registration(InstanceRegistration::new("a", "a1", "http://a"), Utc::now());
        instance.health = HealthStatus::Healthy;
        instance.upstream_impaired = true;
        assert_eq!(instance.effective_health(), HealthStatus::Degraded);

        instance.health = HealthStatus::Unhealthy;
        assert_eq!(instance.effective_health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_url_joins_cleanly() {
        let instance = ServiceInstance::from_registration(
            InstanceRegistration::new("a", "a1", "http://a:9000/").with_health_path("healthz"),
            Utc::now(),
        );
        assert_eq!(instance.health_url(), "http://a:9000/healthz");
        assert_eq!(join_url("http://a", "/messages"), "http://a/messages");
    }
}
