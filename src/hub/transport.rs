use async_trait::async_trait;
use std::time::Duration;

use crate::error::{HubError, Result};
use crate::models::ServiceMessage;
use crate::registry::{join_url, ServiceInstance};

// ============================================================================
// Delivery Transport
// ============================================================================
//
// The outbound call to a consumer instance. Every failure, including a
// timeout, comes back as a DeliveryError so the dispatcher can route it to
// the breaker and the retry manager.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("circuit open for {route}")]
    CircuitOpen { route: String },

    #[error("no available instance of {service}")]
    Unavailable { service: String },

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("instance rejected delivery with HTTP {status}")]
    Rejected { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        instance: &ServiceInstance,
        message: &ServiceMessage,
    ) -> std::result::Result<(), DeliveryError>;
}

/// POSTs the message as JSON to `{instance url}/messages`
pub struct HttpDeliveryTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeliveryTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Config(format!("delivery client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryTransport {
    async fn deliver(
        &self,
        instance: &ServiceInstance,
        message: &ServiceMessage,
    ) -> std::result::Result<(), DeliveryError> {
        let url = join_url(&instance.url, "/messages");

        let response = self
            .client
            .post(&url)
            .header("X-Correlation-Id", &message.correlation_id)
            .header("X-Message-Type", message.message_type.as_str())
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                message_id = %message.id,
                instance_id = %instance.instance_id,
                status = status.as_u16(),
                "Message delivered"
            );
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
