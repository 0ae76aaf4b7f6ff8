use crate::models::Priority;

/// Key layout under a shared prefix
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Sorted set of message ids for one tier
    pub fn queue_tier(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.prefix, priority.as_str())
    }

    /// Hash: message id -> staged message JSON
    pub fn queue_messages(&self) -> String {
        format!("{}:queue:messages", self.prefix)
    }

    /// Counter of messages handed out to `destination` in the window starting
    /// at `window_start_ms`
    pub fn quota_counter(&self, destination: &str, window_start_ms: i64) -> String {
        format!("{}:quota:{}:{}", self.prefix, destination, window_start_ms)
    }

    /// Sorted set: message id scored by next-retry epoch millis
    pub fn retry_schedule(&self) -> String {
        format!("{}:retry:schedule", self.prefix)
    }

    /// Hash: message id -> retry record JSON
    pub fn retry_records(&self) -> String {
        format!("{}:retry:records", self.prefix)
    }

    /// Hash: correlation id -> message id
    pub fn retry_correlation(&self) -> String {
        format!("{}:retry:correlation", self.prefix)
    }

    /// List of dead-lettered message ids
    pub fn dead_letters(&self) -> String {
        format!("{}:retry:dead_letters", self.prefix)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("hub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = StoreKeys::new("hub");
        assert_eq!(keys.queue_tier(Priority::Critical), "hub:queue:critical");
        assert_eq!(keys.queue_messages(), "hub:queue:messages");
        assert_eq!(keys.retry_schedule(), "hub:retry:schedule");
        assert_eq!(keys.dead_letters(), "hub:retry:dead_letters");
        assert_eq!(keys.quota_counter("content", 60_000), "hub:quota:content:60000");
    }
}
