use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::instance::{HealthStatus, ServiceInstance};
use crate::error::{HubError, Result};

// ============================================================================
// Health Probes
// ============================================================================
//
// A probe turns "ask the instance how it is" into a HealthStatus. Failures
// and timeouts are outcomes, not errors: they become UNHEALTHY.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub latency: Duration,
    pub detail: Option<String>,
}

impl ProbeOutcome {
    pub fn new(status: HealthStatus, latency: Duration) -> Self {
        Self {
            status,
            latency,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &ServiceInstance) -> ProbeOutcome;
}

/// GET `{url}{health_path}`:
/// - 2xx within `slow_threshold` is HEALTHY
/// - 2xx that is slow, or whose JSON body says `"status": "degraded"`, is DEGRADED
/// - anything else (non-2xx, connect error, timeout) is UNHEALTHY
pub struct HttpHealthProbe {
    client: reqwest::Client,
    slow_threshold: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration, slow_threshold: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Config(format!("health probe client: {e}")))?;
        Ok(Self {
            client,
            slow_threshold,
        })
    }

    fn reports_degraded(body: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("status")
                    .and_then(|status| status.as_str())
                    .map(|status| status.eq_ignore_ascii_case("degraded"))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let url = instance.health_url();
        let started = Instant::now();

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                let detail = if e.is_timeout() {
                    "health probe timed out".to_string()
                } else {
                    format!("health probe failed: {e}")
                };
                return ProbeOutcome::new(HealthStatus::Unhealthy, started.elapsed()).with_detail(detail);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::new(HealthStatus::Unhealthy, started.elapsed())
                .with_detail(format!("HTTP {}", status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        let latency = started.elapsed();

        if Self::reports_degraded(&body) {
            ProbeOutcome::new(HealthStatus::Degraded, latency).with_detail("instance reports degraded")
        } else if latency > self.slow_threshold {
            ProbeOutcome::new(HealthStatus::Degraded, latency).with_detail("slow health response")
        } else {
            ProbeOutcome::new(HealthStatus::Healthy, latency)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::instance::InstanceRegistration;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance_at(url: &str) -> ServiceInstance {
        ServiceInstance::from_registration(InstanceRegistration::new("content", "c1", url), Utc::now())
    }

    fn probe() -> HttpHealthProbe {
        HttpHealthProbe::new(Duration::from_millis(500), Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_ok_response_is_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&server)
            .await;

        let outcome = probe().probe(&instance_at(&server.uri())).await;
        assert_eq!(outcome.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_degraded_body_and_slow_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "DEGRADED"})))
            .mount(&server)
            .await;
        let outcome = probe().probe(&instance_at(&server.uri())).await;
        assert_eq!(outcome.status, HealthStatus::Degraded);

        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&slow)
            .await;
        let outcome = probe().probe(&instance_at(&slow.uri())).await;
        assert_eq!(outcome.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_error_status_and_timeout_are_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let outcome = probe().probe(&instance_at(&server.uri())).await;
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert_eq!(outcome.detail.as_deref(), Some("HTTP 503"));

        let hung = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&hung)
            .await;
        let outcome = probe().probe(&instance_at(&hung.uri())).await;
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
    }
}
