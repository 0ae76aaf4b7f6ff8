use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageType, ServiceMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Success,
    DeadLetter,
}

impl RetryStatus {
    /// SUCCESS and DEAD_LETTER are never left except through explicit reprocessing
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryStatus::Success | RetryStatus::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetryStatus::Pending => "PENDING",
            RetryStatus::Retrying => "RETRYING",
            RetryStatus::Success => "SUCCESS",
            RetryStatus::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery-failure bookkeeping for one message.
///
/// Created on the first failure, updated on every attempt. `message` is the
/// full snapshot used for redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub message_id: Uuid,
    pub correlation_id: String,
    pub message: ServiceMessage,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(message: ServiceMessage, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            message_id: message.id,
            correlation_id: message.correlation_id.clone(),
            message,
            attempt_count: 0,
            max_attempts,
            next_retry_at: now,
            status: RetryStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source(&self) -> &str {
        &self.message.source
    }

    pub fn destination(&self) -> &str {
        &self.message.destination
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type
    }

    /// Sorted-set score for the retry schedule
    pub fn schedule_score(&self) -> f64 {
        self.next_retry_at.timestamp_millis() as f64
    }
}
