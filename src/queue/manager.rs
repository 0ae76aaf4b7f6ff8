use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::quota::QuotaLimiter;
use super::scoring;
use crate::clock::Clock;
use crate::error::Result;
use crate::models::{Priority, PrioritizedMessage, ServiceMessage};
use crate::store::{BackingStore, StoreKeys};
use crate::utils::{retry_on_transient, BackgroundTasks, BackoffPolicy};

// ============================================================================
// Priority Queue Manager
// ============================================================================
//
// Stages outgoing messages in five tiers (one sorted set each, bodies in a
// shared hash) and hands them out:
// - tiers served strictly CRITICAL -> DEFERRED
// - within a tier, lowest score first (ties FIFO by message id)
// - per-destination quota checked at dequeue; blocked messages stay put
// - hard ceiling on staged messages; beyond it enqueue returns false
//
// Removing the body is the claim. An index entry left without a body is
// dropped by the next scan that meets it, so a store error after a claim
// never strands the message.
//
// A janitor task purges expired deadlines and refreshes throttling status.
//
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total staged messages across all tiers
    pub max_queue_size: usize,
    /// Fraction of capacity at which the queue reports THROTTLED
    pub throttle_ratio: f64,
    /// Requeues beyond this count downgrade the message one tier
    pub requeue_downgrade_threshold: u32,
    /// Quota window length
    pub quota_window: Duration,
    pub janitor_interval: Duration,
    /// Candidates read per store round-trip during dequeue
    pub scan_page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            throttle_ratio: 0.9,
            requeue_downgrade_threshold: 3,
            quota_window: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(5),
            scan_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Active,
    Throttled,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueueState::Throttled,
            _ => QueueState::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            QueueState::Active => 0,
            QueueState::Throttled => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub state: QueueState,
    pub tiers: BTreeMap<Priority, usize>,
    pub total: usize,
    pub capacity: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub overflow: u64,
    pub expired: u64,
    pub requeued: u64,
    pub downgraded: u64,
    pub quota_deferred: u64,
    /// Dequeues cut short by a store error after handing out a partial batch
    pub store_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub status: QueueStatus,
    pub counters: QueueCounters,
    pub quotas: BTreeMap<String, u32>,
}

#[derive(Default)]
struct AtomicCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    overflow: AtomicU64,
    expired: AtomicU64,
    requeued: AtomicU64,
    downgraded: AtomicU64,
    quota_deferred: AtomicU64,
    store_errors: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> QueueCounters {
        QueueCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            downgraded: self.downgraded.load(Ordering::Relaxed),
            quota_deferred: self.quota_deferred.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct PriorityQueueManager {
    store: Arc<dyn BackingStore>,
    keys: StoreKeys,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    quotas: QuotaLimiter,
    counters: AtomicCounters,
    state: AtomicU8,
    /// Serialises the capacity check with the insert
    admission: tokio::sync::Mutex<()>,
    tasks: BackgroundTasks,
}

impl PriorityQueueManager {
    pub fn new(
        store: Arc<dyn BackingStore>,
        keys: StoreKeys,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let quotas = QuotaLimiter::new(
            store.clone(),
            keys.clone(),
            config.quota_window,
            clock.clone(),
        );
        Self {
            store,
            keys,
            config,
            clock,
            quotas,
            counters: AtomicCounters::default(),
            state: AtomicU8::new(QueueState::Active.as_u8()),
            admission: tokio::sync::Mutex::new(()),
            tasks: BackgroundTasks::new("priority_queue"),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Start the janitor loop
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.tasks
            .spawn_periodic("queue_janitor", self.config.janitor_interval, move || {
                let manager = manager.clone();
                async move { manager.run_janitor_iteration().await }
            });
        tracing::info!(
            max_queue_size = self.config.max_queue_size,
            "Priority queue janitor started"
        );
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    async fn run_janitor_iteration(&self) {
        let policy = BackoffPolicy::store_operations();
        match retry_on_transient(&policy, 3, "queue_purge_expired", |_| self.purge_expired())
            .await
            .into_result()
        {
            Ok(purged) if purged > 0 => {
                tracing::info!(purged, "Purged expired messages from queue");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Queue janitor failed to purge expired messages"),
        }

        if let Err(e) = self.refresh_status().await {
            tracing::warn!(error = %e, "Queue janitor failed to refresh status");
        }
    }

    /// Stage a message. Returns false (never blocks) when the queue is full or
    /// the deadline has already passed.
    pub async fn enqueue(
        &self,
        message: ServiceMessage,
        priority: Option<Priority>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let priority = priority.unwrap_or_else(|| message.message_type.default_priority());
        let staged = PrioritizedMessage::new(message, priority, now, deadline);

        if staged.is_expired(now) {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %staged.id(),
                "Rejecting message whose deadline has already passed"
            );
            return Ok(false);
        }

        self.stage(staged).await
    }

    /// Put a message back after a failed hand-off. Past the downgrade
    /// threshold it drops one tier so a poison message cannot starve peers.
    pub async fn requeue(&self, mut staged: PrioritizedMessage) -> Result<bool> {
        staged.attempt_count = staged.attempt_count.saturating_add(1);

        if staged.attempt_count > self.config.requeue_downgrade_threshold
            && staged.priority != Priority::Deferred
        {
            let from = staged.priority;
            staged.priority = from.downgrade();
            self.counters.downgraded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %staged.id(),
                attempt = staged.attempt_count,
                from = %from,
                to = %staged.priority,
                "Downgrading repeatedly requeued message"
            );
        }

        let accepted = self.stage(staged).await?;
        if accepted {
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(accepted)
    }

    /// Put back a dequeued message that was never handed to a transport.
    /// Attempts and tier are unchanged and capacity is not checked.
    pub async fn restore(&self, staged: PrioritizedMessage) -> Result<()> {
        let _admission = self.admission.lock().await;
        self.write_staged(&staged).await?;
        tracing::debug!(message_id = %staged.id(), "Message restored to queue");
        Ok(())
    }

    async fn stage(&self, staged: PrioritizedMessage) -> Result<bool> {
        let _admission = self.admission.lock().await;

        let total = self.store.hlen(&self.keys.queue_messages()).await?;
        if total >= self.config.max_queue_size {
            self.counters.overflow.fetch_add(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %staged.id(),
                destination = %staged.message.destination,
                staged = total,
                capacity = self.config.max_queue_size,
                "Queue full, rejecting message"
            );
            return Ok(false);
        }

        let score = self.write_staged(&staged).await?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            message_id = %staged.id(),
            priority = %staged.priority,
            score,
            destination = %staged.message.destination,
            "Message staged"
        );
        Ok(true)
    }

    async fn write_staged(&self, staged: &PrioritizedMessage) -> Result<f64> {
        let now = self.clock.now();
        let score = scoring::score(staged.priority, staged.enqueued_at, staged.deadline, now);
        let id = staged.id().to_string();
        let body = serde_json::to_string(staged)?;

        // body first, so a dequeuer never sees an index entry without one
        self.store.hset(&self.keys.queue_messages(), &id, &body).await?;
        self.store
            .zadd(&self.keys.queue_tier(staged.priority), &id, score)
            .await?;
        Ok(score)
    }

    /// Hand out up to `batch_size` messages, highest tier first.
    ///
    /// A store error before anything is claimed propagates. After that, the
    /// messages already claimed are returned and the rest stay staged.
    pub async fn dequeue(&self, batch_size: usize) -> Result<Vec<PrioritizedMessage>> {
        let mut batch = Vec::with_capacity(batch_size);
        if batch_size == 0 {
            return Ok(batch);
        }

        match self.claim_into(&mut batch, batch_size).await {
            Ok(()) => {}
            Err(e) if batch.is_empty() => return Err(e),
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    claimed = batch.len(),
                    error = %e,
                    "Store error during dequeue, handing out partial batch"
                );
            }
        }

        if !batch.is_empty() {
            tracing::debug!(count = batch.len(), "Dequeued batch");
        }
        Ok(batch)
    }

    async fn claim_into(
        &self,
        batch: &mut Vec<PrioritizedMessage>,
        batch_size: usize,
    ) -> Result<()> {
        let now = self.clock.now();
        let messages_key = self.keys.queue_messages();
        let page_size = self.config.scan_page_size.max(1);

        for priority in Priority::ALL {
            if batch.len() >= batch_size {
                break;
            }
            let tier_key = self.keys.queue_tier(priority);
            // entries we leave behind (quota-blocked) keep their rank
            let mut offset = 0;

            loop {
                if batch.len() >= batch_size {
                    break;
                }
                let page = self
                    .store
                    .zrange_with_scores(&tier_key, offset, page_size)
                    .await?;
                if page.is_empty() {
                    break;
                }
                let page_len = page.len();
                let mut left_in_place = 0;

                for (id, _score) in page {
                    if batch.len() >= batch_size {
                        break;
                    }
                    let Some(staged) = self.load(&tier_key, &id).await? else {
                        continue;
                    };

                    if staged.is_expired(now) {
                        self.discard_expired(&tier_key, &id).await?;
                        continue;
                    }

                    let Some(grant) = self.quotas.try_acquire(&staged.message.destination).await?
                    else {
                        left_in_place += 1;
                        self.counters.quota_deferred.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };

                    if self.store.hdel(&messages_key, &id).await? {
                        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                        batch.push(staged);
                        self.store.zrem(&tier_key, &id).await?;
                    } else {
                        // another dispatcher claimed it first
                        self.quotas.refund(grant).await?;
                    }
                }

                if page_len < page_size {
                    break;
                }
                offset += left_in_place;
            }
        }
        Ok(())
    }

    /// Load a staged body; unreadable or orphaned index entries are removed.
    async fn load(&self, tier_key: &str, id: &str) -> Result<Option<PrioritizedMessage>> {
        let Some(body) = self.store.hget(&self.keys.queue_messages(), id).await? else {
            self.store.zrem(tier_key, id).await?;
            return Ok(None);
        };

        match serde_json::from_str::<PrioritizedMessage>(&body) {
            Ok(staged) => Ok(Some(staged)),
            Err(e) => {
                tracing::error!(message_id = %id, error = %e, "Dropping undecodable staged message");
                if self.store.hdel(&self.keys.queue_messages(), id).await? {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                self.store.zrem(tier_key, id).await?;
                Ok(None)
            }
        }
    }

    async fn discard_expired(&self, tier_key: &str, id: &str) -> Result<()> {
        if self.store.hdel(&self.keys.queue_messages(), id).await? {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::info!(message_id = %id, "Discarded message past its deadline");
        }
        self.store.zrem(tier_key, id).await?;
        Ok(())
    }

    /// Remove every staged message whose deadline has passed
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let bodies = self.store.hvals(&self.keys.queue_messages()).await?;
        let mut purged = 0;

        for body in bodies {
            let Ok(staged) = serde_json::from_str::<PrioritizedMessage>(&body) else {
                continue;
            };
            if !staged.is_expired(now) {
                continue;
            }
            let id = staged.id().to_string();
            if self.store.hdel(&self.keys.queue_messages(), &id).await? {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                purged += 1;
            }
            self.store
                .zrem(&self.keys.queue_tier(staged.priority), &id)
                .await?;
        }
        Ok(purged)
    }

    pub fn set_service_quota(&self, destination: &str, limit: u32) {
        tracing::info!(destination = %destination, limit, "Setting dispatch quota");
        self.quotas.set_limit(destination, limit);
    }

    pub fn remove_service_quota(&self, destination: &str) -> bool {
        self.quotas.remove_limit(destination)
    }

    /// Start a fresh quota window now
    pub fn reset_quotas(&self) {
        self.quotas.reset();
    }

    pub async fn staged_count(&self) -> Result<usize> {
        self.store.hlen(&self.keys.queue_messages()).await
    }

    /// Recompute ACTIVE/THROTTLED from the current staged count
    pub async fn refresh_status(&self) -> Result<QueueState> {
        let total = self.staged_count().await?;
        Ok(self.apply_state(total))
    }

    fn apply_state(&self, total: usize) -> QueueState {
        let threshold = (self.config.max_queue_size as f64 * self.config.throttle_ratio).ceil();
        let state = if total as f64 >= threshold {
            QueueState::Throttled
        } else {
            QueueState::Active
        };

        let previous = QueueState::from_u8(self.state.swap(state.as_u8(), Ordering::Relaxed));
        if previous != state {
            tracing::warn!(?previous, current = ?state, staged = total, "Queue state changed");
        }
        state
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let mut tiers = BTreeMap::new();
        for priority in Priority::ALL {
            let count = self.store.zcard(&self.keys.queue_tier(priority)).await?;
            tiers.insert(priority, count);
        }
        let total = tiers.values().sum();
        let state = self.apply_state(total);

        Ok(QueueStatus {
            state,
            tiers,
            total,
            capacity: self.config.max_queue_size,
            checked_at: self.clock.now(),
        })
    }

    pub async fn get_metrics(&self) -> Result<QueueMetrics> {
        Ok(QueueMetrics {
            status: self.get_queue_status().await?,
            counters: self.counters.snapshot(),
            quotas: self.quotas.limits(),
        })
    }

    /// Drop everything staged; returns how many messages were removed
    pub async fn clear_queue(&self) -> Result<usize> {
        let _admission = self.admission.lock().await;
        let removed = self.store.hlen(&self.keys.queue_messages()).await?;
        for priority in Priority::ALL {
            self.store.delete(&self.keys.queue_tier(priority)).await?;
        }
        self.store.delete(&self.keys.queue_messages()).await?;
        self.apply_state(0);
        tracing::warn!(removed, "Queue cleared");
        Ok(removed)
    }
}
