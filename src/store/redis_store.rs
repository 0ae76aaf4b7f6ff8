use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cmd;
use std::time::Duration;

use super::BackingStore;
use crate::error::Result;

// ============================================================================
// Redis Backing Store
// ============================================================================
//
// Thin command mapping over a multiplexed connection. The connection is
// cheap to clone; each call takes its own handle.
//
// ============================================================================

/// INCRBY, then PEXPIRE only when the key has no expiry yet
const INCR_WITH_TTL: &str = r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
";

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// Redis LRANGE/ZRANGE stop index (inclusive)
fn stop_index(offset: usize, count: usize) -> isize {
    (offset + count) as isize - 1
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url = %url, "Connected to Redis backing store");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("ZADD")
            .arg(key)
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let members: Vec<(String, f64)> = cmd("ZRANGE")
            .arg(key)
            .arg(offset as isize)
            .arg(stop_index(offset, count))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let members: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = cmd("ZSCORE").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(score)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = cmd("HDEL").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = cmd("HLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = cmd("HVALS").arg(key).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("RPUSH").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, offset: usize, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<String> = cmd("LRANGE")
            .arg(key)
            .arg(offset as isize)
            .arg(stop_index(offset, count))
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = cmd("LREM").arg(key).arg(0).arg(value).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let count: i64 = redis::Script::new(INCR_WITH_TTL)
            .key(key)
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
