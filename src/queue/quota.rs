use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{BackingStore, StoreKeys};

// ============================================================================
// Per-Destination Quota
// ============================================================================
//
// Fixed-window counters in the backing store (INCR + EXPIRE), one key per
// destination per window, so every hub process sharing the store draws from
// the same allowance. Windows are aligned to `origin` (the epoch until
// `reset` moves it). Consulted at dequeue time only; destinations with no
// configured limit never touch the store.
//
// ============================================================================

/// A token taken for one hand-off
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaGrant {
    /// Destination has no limit
    Unlimited,
    /// Counted against this window key
    Counted(String),
}

pub struct QuotaLimiter {
    store: Arc<dyn BackingStore>,
    keys: StoreKeys,
    window: Duration,
    clock: Arc<dyn Clock>,
    limits: DashMap<String, u32>,
    /// Epoch millis the window grid starts from
    origin_ms: AtomicI64,
}

impl QuotaLimiter {
    pub fn new(
        store: Arc<dyn BackingStore>,
        keys: StoreKeys,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys,
            window,
            clock,
            limits: DashMap::new(),
            origin_ms: AtomicI64::new(0),
        }
    }

    fn window_ms(&self) -> i64 {
        (self.window.as_millis() as i64).max(1)
    }

    fn counter_key(&self, destination: &str) -> String {
        let origin = self.origin_ms.load(Ordering::SeqCst);
        let elapsed = self.clock.now().timestamp_millis() - origin;
        let window_start = origin + elapsed.div_euclid(self.window_ms()) * self.window_ms();
        self.keys.quota_counter(destination, window_start)
    }

    /// Counters outlive their window so a late refund still finds them
    fn counter_ttl(&self) -> Duration {
        self.window.saturating_mul(2).max(Duration::from_millis(1))
    }

    pub fn set_limit(&self, destination: &str, limit: u32) {
        self.limits.insert(destination.to_string(), limit);
    }

    pub fn remove_limit(&self, destination: &str) -> bool {
        self.limits.remove(destination).is_some()
    }

    /// Take one token. `None` when the destination is over quota for the
    /// current window.
    pub async fn try_acquire(&self, destination: &str) -> Result<Option<QuotaGrant>> {
        let Some(limit) = self.limits.get(destination).map(|entry| *entry.value()) else {
            return Ok(Some(QuotaGrant::Unlimited));
        };

        let key = self.counter_key(destination);
        let used = self.store.incr_with_ttl(&key, 1, self.counter_ttl()).await?;
        if used > i64::from(limit) {
            self.store.incr_with_ttl(&key, -1, self.counter_ttl()).await?;
            return Ok(None);
        }
        Ok(Some(QuotaGrant::Counted(key)))
    }

    /// Give back a token taken for a claim that lost a race
    pub async fn refund(&self, grant: QuotaGrant) -> Result<()> {
        if let QuotaGrant::Counted(key) = grant {
            self.store.incr_with_ttl(&key, -1, self.counter_ttl()).await?;
        }
        Ok(())
    }

    /// Start a fresh window for every destination now
    pub fn reset(&self) {
        self.origin_ms
            .store(self.clock.now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn limits(&self) -> BTreeMap<String, u32> {
        self.limits
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::HubError;
    use crate::store::MemoryStore;

    fn limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, QuotaLimiter) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaLimiter::new(
            store.clone(),
            StoreKeys::new("test"),
            Duration::from_secs(60),
            clock.clone(),
        );
        (clock, store, quota)
    }

    #[tokio::test]
    async fn test_quota_blocks_then_refills_after_window() {
        let (clock, _store, quota) = limiter();
        quota.set_limit("content-service", 2);

        assert!(quota.try_acquire("content-service").await.unwrap().is_some());
        assert!(quota.try_acquire("content-service").await.unwrap().is_some());
        assert!(quota.try_acquire("content-service").await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(60));
        assert!(quota.try_acquire("content-service").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unlimited_destination_never_blocks() {
        let (_clock, store, quota) = limiter();
        store.fail_next(1);
        for _ in 0..100 {
            assert_eq!(
                quota.try_acquire("catalog-service").await.unwrap(),
                Some(QuotaGrant::Unlimited)
            );
        }
    }

    #[tokio::test]
    async fn test_refund_returns_token() {
        let (_clock, _store, quota) = limiter();
        quota.set_limit("a", 1);
        let grant = quota.try_acquire("a").await.unwrap().unwrap();
        assert!(quota.try_acquire("a").await.unwrap().is_none());
        quota.refund(grant).await.unwrap();
        assert!(quota.try_acquire("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_opens_a_new_window() {
        let (_clock, _store, quota) = limiter();
        quota.set_limit("a", 1);
        assert!(quota.try_acquire("a").await.unwrap().is_some());
        assert!(quota.try_acquire("a").await.unwrap().is_none());

        quota.reset();
        assert!(quota.try_acquire("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_limiters_sharing_a_store_share_the_allowance() {
        let (clock, store, first) = limiter();
        let second = QuotaLimiter::new(
            store.clone(),
            StoreKeys::new("test"),
            Duration::from_secs(60),
            clock.clone(),
        );
        first.set_limit("a", 2);
        second.set_limit("a", 2);

        assert!(first.try_acquire("a").await.unwrap().is_some());
        assert!(second.try_acquire("a").await.unwrap().is_some());
        assert!(first.try_acquire("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_errors_surface() {
        let (_clock, store, quota) = limiter();
        quota.set_limit("a", 1);
        store.fail_next(1);
        assert!(matches!(quota.try_acquire("a").await, Err(HubError::Store(_))));
    }
}
