use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Hub Data Model
// ============================================================================
//
// Messages exchanged between services, the closed set of message types and
// the priority tiers they map to.
//
// ============================================================================

/// Dispatch tier. Declaration order is dispatch order: `Critical` first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Deferred,
}

impl Priority {
    /// All tiers in dispatch order
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Deferred,
    ];

    pub fn tier_index(self) -> u32 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Deferred => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Deferred => "deferred",
        }
    }

    /// One tier lower; `Deferred` is the floor.
    pub fn downgrade(self) -> Priority {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal => Priority::Low,
            Priority::Low | Priority::Deferred => Priority::Deferred,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of message types carried by the hub.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TransactionCommit,
    TransactionRollback,
    PaymentCapture,
    EntityCreated,
    EntityDeleted,
    StateTransition,
    EntityUpdated,
    Query,
    Notification,
    GenerationRequest,
    BulkImport,
    BulkExport,
    AnalyticsEvent,
    CacheRefresh,
}

impl MessageType {
    /// Priority used when the producer does not pick one.
    ///
    /// Exhaustive on purpose: adding a variant fails to compile until it is
    /// classified here.
    pub fn default_priority(self) -> Priority {
        match self {
            MessageType::TransactionCommit
            | MessageType::TransactionRollback
            | MessageType::PaymentCapture => Priority::Critical,
            MessageType::EntityCreated
            | MessageType::EntityDeleted
            | MessageType::StateTransition => Priority::High,
            MessageType::EntityUpdated
            | MessageType::Query
            | MessageType::Notification
            | MessageType::GenerationRequest => Priority::Normal,
            MessageType::BulkImport
            | MessageType::BulkExport
            | MessageType::AnalyticsEvent
            | MessageType::CacheRefresh => Priority::Low,
        }
    }

    /// Rough consumer-side processing time, in milliseconds.
    pub fn processing_estimate_ms(self) -> u64 {
        match self {
            MessageType::TransactionCommit
            | MessageType::TransactionRollback
            | MessageType::PaymentCapture
            | MessageType::Query
            | MessageType::Notification => 50,
            MessageType::EntityCreated
            | MessageType::EntityDeleted
            | MessageType::EntityUpdated
            | MessageType::StateTransition
            | MessageType::CacheRefresh => 100,
            MessageType::AnalyticsEvent => 250,
            MessageType::GenerationRequest => 10_000,
            MessageType::BulkImport | MessageType::BulkExport => 5_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::TransactionCommit => "transaction_commit",
            MessageType::TransactionRollback => "transaction_rollback",
            MessageType::PaymentCapture => "payment_capture",
            MessageType::EntityCreated => "entity_created",
            MessageType::EntityDeleted => "entity_deleted",
            MessageType::StateTransition => "state_transition",
            MessageType::EntityUpdated => "entity_updated",
            MessageType::Query => "query",
            MessageType::Notification => "notification",
            MessageType::GenerationRequest => "generation_request",
            MessageType::BulkImport => "bulk_import",
            MessageType::BulkExport => "bulk_export",
            MessageType::AnalyticsEvent => "analytics_event",
            MessageType::CacheRefresh => "cache_refresh",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message travelling from one service to another. Immutable once built.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceMessage {
    pub id: Uuid,
    pub source: String,
    pub destination: String,
    pub message_type: MessageType,
    /// Idempotency key; consumers dedupe on it.
    pub correlation_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ServiceMessage {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            // v7 ids sort by creation time, which keeps equal scores FIFO
            id: Uuid::now_v7(),
            source: source.into(),
            destination: destination.into(),
            message_type,
            correlation_id: Uuid::new_v4().to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// A message while it sits in the priority queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PrioritizedMessage {
    pub message: ServiceMessage,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub processing_estimate_ms: u64,
}

impl PrioritizedMessage {
    pub fn new(
        message: ServiceMessage,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let processing_estimate_ms = message.message_type.processing_estimate_ms();
        Self {
            message,
            priority,
            enqueued_at,
            deadline,
            attempt_count: 0,
            processing_estimate_ms,
        }
    }

    pub fn id(&self) -> Uuid {
        self.message.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_default_priority_classification() {
        assert_eq!(MessageType::TransactionCommit.default_priority(), Priority::Critical);
        assert_eq!(MessageType::StateTransition.default_priority(), Priority::High);
        assert_eq!(MessageType::EntityUpdated.default_priority(), Priority::Normal);
        assert_eq!(MessageType::BulkImport.default_priority(), Priority::Low);
    }

    #[test]
    fn test_priority_order_and_downgrade() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Deferred);
        assert_eq!(Priority::Critical.downgrade(), Priority::High);
        assert_eq!(Priority::Deferred.downgrade(), Priority::Deferred);
    }

    #[test]
    fn test_prioritized_message_serialization_preserves_fields() {
        let now = Utc::now();
        let message = ServiceMessage::new(
            "campaign-service",
            "content-service",
            MessageType::EntityCreated,
            serde_json::json!({"entity": "character", "name": "Ysolde"}),
        );
        let mut staged = PrioritizedMessage::new(
            message,
            Priority::High,
            now,
            Some(now + Duration::seconds(30)),
        );
        staged.attempt_count = 2;

        let json = serde_json::to_string(&staged).unwrap();
        let restored: PrioritizedMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.priority, Priority::High);
        assert_eq!(restored.attempt_count, 2);
        assert_eq!(restored.enqueued_at, staged.enqueued_at);
        assert_eq!(restored.deadline, staged.deadline);
        assert_eq!(restored.message.created_at, staged.message.created_at);
        assert_eq!(restored, staged);
    }

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::GenerationRequest).unwrap();
        assert_eq!(json, "\"generation_request\"");
        assert_eq!(MessageType::GenerationRequest.as_str(), "generation_request");
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let message = ServiceMessage::new("a", "b", MessageType::Query, serde_json::Value::Null);
        let staged = PrioritizedMessage::new(message, Priority::Normal, now, Some(now));
        assert!(staged.is_expired(now));
        assert!(!staged.is_expired(now - Duration::seconds(1)));
    }
}
