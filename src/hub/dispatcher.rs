use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::transport::{DeliveryError, DeliveryTransport};
use crate::metrics::Metrics;
use crate::models::ServiceMessage;
use crate::registry::EnhancedServiceRegistry;
use crate::retry::{RedeliveryOutcome, RetryDispatcher};
use crate::utils::{CircuitBreakerError, CircuitBreakerManager};

// ============================================================================
// Hub Dispatcher
// ============================================================================
//
// One delivery attempt: select an instance, pass the call through the
// route's breaker (operation = message type) under the delivery timeout,
// release the instance. Shared by the dispatch loop and the retry scanner.
//
// ============================================================================

pub struct HubDispatcher {
    registry: Arc<EnhancedServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    transport: Arc<dyn DeliveryTransport>,
    delivery_timeout: Duration,
    cool_down: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl HubDispatcher {
    pub fn new(
        registry: Arc<EnhancedServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        transport: Arc<dyn DeliveryTransport>,
        delivery_timeout: Duration,
        cool_down: Duration,
    ) -> Self {
        Self {
            registry,
            breakers,
            transport,
            delivery_timeout,
            cool_down,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How long a circuit-open delivery should wait before the next try
    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    /// Deliver once. Returns the id of the instance that accepted the message.
    pub async fn deliver(&self, message: &ServiceMessage) -> Result<String, DeliveryError> {
        let Some(instance) = self
            .registry
            .get_instance(&message.destination, Some(message.message_type))
        else {
            self.record(&message.destination, "unavailable", 0.0);
            return Err(DeliveryError::Unavailable {
                service: message.destination.clone(),
            });
        };

        let breaker = self.breakers.get_circuit_breaker(
            &message.source,
            &message.destination,
            message.message_type.as_str(),
        );

        let started = Instant::now();
        let transport = &self.transport;
        let timeout = self.delivery_timeout;
        let target = &instance;
        let result = breaker
            .call(move || async move {
                match tokio::time::timeout(timeout, transport.deliver(target, message)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DeliveryError::Timeout(timeout)),
                }
            })
            .await;
        let elapsed = started.elapsed();

        self.registry.release_instance(&instance);

        match result {
            Ok(()) => {
                self.record(&message.destination, "delivered", elapsed.as_secs_f64());
                Ok(instance.instance_id)
            }
            Err(CircuitBreakerError::CircuitOpen { route }) => {
                self.record(&message.destination, "circuit_open", 0.0);
                tracing::debug!(message_id = %message.id, route = %route, "Delivery blocked by open circuit");
                Err(DeliveryError::CircuitOpen { route })
            }
            Err(CircuitBreakerError::OperationFailed(error)) => {
                self.record(&message.destination, "failed", elapsed.as_secs_f64());
                tracing::warn!(
                    message_id = %message.id,
                    destination = %message.destination,
                    instance_id = %instance.instance_id,
                    error = %error,
                    "Delivery failed"
                );
                Err(error)
            }
        }
    }

    fn record(&self, destination: &str, outcome: &str, duration_secs: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(destination, outcome, duration_secs);
        }
    }
}

#[async_trait]
impl RetryDispatcher for HubDispatcher {
    async fn redeliver(&self, message: &ServiceMessage) -> RedeliveryOutcome {
        match self.deliver(message).await {
            Ok(_) => RedeliveryOutcome::Delivered,
            Err(DeliveryError::CircuitOpen { route }) => RedeliveryOutcome::Deferred {
                reason: format!("circuit open for {route}"),
                delay: self.cool_down,
            },
            Err(error) => RedeliveryOutcome::Failed {
                error: error.to_string(),
            },
        }
    }
}
