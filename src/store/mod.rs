// ============================================================================
// Backing Store - Shared Ordered/Keyed Persistence
// ============================================================================
//
// The hub's only persistence seam. Modelled on Redis primitives because the
// production store is Redis:
// - sorted sets: priority tiers, retry schedule
// - hashes:      staged message bodies, retry records, correlation index
// - lists:       dead letters in insertion order
// - counters:    fixed-window dispatch quotas (INCR + EXPIRE)
//
// Claim semantics: `zrem` and `hdel` report whether *this* call removed the
// entry, so "read candidate, then remove" hands it to exactly one claimant.
//
// ============================================================================

mod keys;
mod memory;
mod redis_store;

pub use self::keys::StoreKeys;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Insert or re-score a sorted-set member
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove a member; true only for the caller that actually removed it
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Members by rank (lowest score first), ties ordered by member
    async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Members with `min <= score <= max`, lowest first, at most `limit`
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    async fn hvals(&self, key: &str) -> Result<Vec<String>>;

    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    /// Elements `offset..offset + count` in insertion order
    async fn lrange(&self, key: &str, offset: usize, count: usize) -> Result<Vec<String>>;

    /// Remove every occurrence of `value`, returning how many were removed
    async fn lrem(&self, key: &str, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Add `delta` to an integer counter and return the new value. A counter
    /// without an expiry gets `ttl`.
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;
}
