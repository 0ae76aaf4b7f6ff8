use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::BackingStore;
use crate::error::{HubError, Result};

// ============================================================================
// In-Process Backing Store
// ============================================================================
//
// Mirrors the Redis ordering rules the hub relies on (sorted by score, ties
// by member) behind a single mutex, so every operation is atomic. Used by the
// test suite and as the store when no Redis URL is configured.
//
// `fail_next` / `fail_after` inject transient store errors for failure-path
// tests. Counter expiry runs on the wall clock.
//
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, Score>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(previous) = self.scores.insert(member.to_string(), Score(score)) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

struct Counter {
    value: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryData {
    sorted_sets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    counters: HashMap<String, Counter>,
}

/// Operations to let through, then operations to fail
#[derive(Default)]
struct FaultPlan {
    pass: u32,
    fail: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a store error
    pub fn fail_next(&self, count: u32) {
        self.fail_after(0, count);
    }

    /// Let `pass` operations succeed, then fail the following `count`
    pub fn fail_after(&self, pass: u32, count: u32) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        *faults = FaultPlan { pass, fail: count };
    }

    fn check_fault(&self) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if faults.fail == 0 {
            return Ok(());
        }
        if faults.pass > 0 {
            faults.pass -= 1;
            return Ok(());
        }
        faults.fail -= 1;
        Err(HubError::Store("injected store failure".to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryData>> {
        self.check_fault()?;
        Ok(self.data.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut data = self.lock()?;
        data.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.lock()?;
        Ok(data
            .sorted_sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>> {
        let data = self.lock()?;
        Ok(data
            .sorted_sets
            .get(key)
            .map(|set| {
                set.ordered
                    .iter()
                    .skip(offset)
                    .take(count)
                    .map(|(score, member)| (member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let data = self.lock()?;
        Ok(data
            .sorted_sets
            .get(key)
            .map(|set| {
                set.ordered
                    .iter()
                    .filter(|(score, _)| score.0 >= min && score.0 <= max)
                    .take(limit)
                    .map(|(score, member)| (member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let data = self.lock()?;
        Ok(data
            .sorted_sets
            .get(key)
            .and_then(|set| set.scores.get(member))
            .map(|score| score.0))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let data = self.lock()?;
        Ok(data.sorted_sets.get(key).map_or(0, |set| set.scores.len()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.lock()?;
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let data = self.lock()?;
        Ok(data.hashes.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut data = self.lock()?;
        Ok(data
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some()))
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let data = self.lock()?;
        Ok(data.hashes.get(key).map_or(0, HashMap::len))
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        let data = self.lock()?;
        Ok(data
            .hashes
            .get(key)
            .map(|hash| hash.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.lock()?;
        data.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, offset: usize, count: usize) -> Result<Vec<String>> {
        let data = self.lock()?;
        Ok(data
            .lists
            .get(key)
            .map(|list| list.iter().skip(offset).take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize> {
        let mut data = self.lock()?;
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        Ok(before - list.len())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let data = self.lock()?;
        Ok(data.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut data = self.lock()?;
        let now = Instant::now();
        data.counters.retain(|_, counter| counter.expires_at > now);
        let counter = data.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now + ttl,
        });
        counter.value += delta;
        Ok(counter.value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.lock()?;
        data.sorted_sets.remove(key);
        data.hashes.remove(key);
        data.lists.remove(key);
        data.counters.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sorted_set_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "c", 1.0).await.unwrap();
        store.zadd("z", "a", 2.0).await.unwrap();

        let members: Vec<String> = store
            .zrange_with_scores("z", 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["c", "a", "b"]);

        // re-score moves the member
        store.zadd("z", "c", 5.0).await.unwrap();
        let first = store.zrange_with_scores("z", 0, 1).await.unwrap();
        assert_eq!(first[0].0, "a");
        assert_eq!(store.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zrem_claims_once() {
        let store = MemoryStore::new();
        store.zadd("z", "m", 1.0).await.unwrap();
        assert!(store.zrem("z", "m").await.unwrap());
        assert!(!store.zrem("z", "m").await.unwrap());
    }

    #[tokio::test]
    async fn test_range_by_score_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.zadd("z", &format!("m{}", i), i as f64).await.unwrap();
        }
        let due = store.zrange_by_score("z", f64::NEG_INFINITY, 2.0, 10).await.unwrap();
        assert_eq!(due.len(), 3);
        let limited = store.zrange_by_score("z", f64::NEG_INFINITY, 10.0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let store = MemoryStore::new();
        for id in ["x", "y", "z"] {
            store.rpush("l", id).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, 2).await.unwrap(), vec!["x", "y"]);
        assert_eq!(store.lrem("l", "y").await.unwrap(), 1);
        assert_eq!(store.lrange("l", 0, 10).await.unwrap(), vec!["x", "z"]);
        assert_eq!(store.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let err = store.hset("h", "f", "v").await.unwrap_err();
        assert!(matches!(err, HubError::Store(_)));
        store.hset("h", "f", "v").await.unwrap();
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_fail_after_targets_a_later_operation() {
        let store = MemoryStore::new();
        store.fail_after(2, 1);
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        assert!(store.hget("h", "a").await.is_err());
        assert_eq!(store.hlen("h").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(20);
        assert_eq!(store.incr_with_ttl("c", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_ttl("c", 1, ttl).await.unwrap(), 2);
        assert_eq!(store.incr_with_ttl("c", -1, ttl).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.incr_with_ttl("c", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zscore_reports_membership() {
        let store = MemoryStore::new();
        store.zadd("z", "m", 3.0).await.unwrap();
        assert_eq!(store.zscore("z", "m").await.unwrap(), Some(3.0));
        assert_eq!(store.zscore("z", "other").await.unwrap(), None);
    }
}
