use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::record::{RetryRecord, RetryStatus};
use crate::clock::Clock;
use crate::error::{HubError, Result};
use crate::models::ServiceMessage;
use crate::store::{BackingStore, StoreKeys};
use crate::utils::{retry_on_transient, BackgroundTasks, BackoffPolicy};

// ============================================================================
// Retry Manager
// ============================================================================
//
// Failure recovery for dispatched messages:
// - schedule_retry: count the attempt, then PENDING with backoff or DEAD_LETTER
// - scanner: claims due records (atomic zrem) and hands them back to the hub
// - a store error after a claim puts the schedule entry back; records that
//   still fall out of the schedule are recovered by the stranded sweep
// - dead letters: ordered list, replayable with reprocess_dead_letter
//
// Store layout (see StoreKeys):
//   retry:schedule     zset  message id -> next retry (epoch millis)
//   retry:records      hash  message id -> RetryRecord json
//   retry:correlation  hash  correlation id -> message id
//   retry:dead_letters list  message ids, insertion order
//
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a message is dead-lettered
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub scan_interval: Duration,
    /// Due records claimed per scanner iteration
    pub scan_batch_size: usize,
    /// SUCCESS records older than this are purged by the scanner
    pub completed_retention: Duration,
    /// PENDING/RETRYING records absent from the schedule for this long
    /// past their due time are put back
    pub stranded_after: Duration,
    /// Replayed dead letters start over with a fresh attempt budget
    pub reset_attempts_on_reprocess: bool,
    /// Fixed seed for the jitter source
    pub rng_seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            scan_interval: Duration::from_secs(1),
            scan_batch_size: 100,
            completed_retention: Duration::from_secs(3600),
            stranded_after: Duration::from_secs(60),
            reset_attempts_on_reprocess: true,
            rng_seed: None,
        }
    }
}

/// What happened when the scanner handed a record back for delivery
#[derive(Debug, Clone, PartialEq)]
pub enum RedeliveryOutcome {
    Delivered,
    /// Not attempted (e.g. circuit open); retry later without using an attempt
    Deferred { reason: String, delay: Duration },
    Failed { error: String },
}

/// Re-delivery callback supplied by the hub
#[async_trait]
pub trait RetryDispatcher: Send + Sync {
    async fn redeliver(&self, message: &ServiceMessage) -> RedeliveryOutcome;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryMetrics {
    pub by_status: HashMap<RetryStatus, usize>,
    pub total_records: usize,
    pub scheduled: usize,
    pub dead_letter_queue: usize,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub redelivered: u64,
    pub deferred: u64,
    pub reprocessed: u64,
    pub recovered: u64,
}

#[derive(Default)]
struct Counters {
    retries_scheduled: AtomicU64,
    dead_lettered: AtomicU64,
    redelivered: AtomicU64,
    deferred: AtomicU64,
    reprocessed: AtomicU64,
    recovered: AtomicU64,
}

pub struct RetryManager {
    store: Arc<dyn BackingStore>,
    keys: StoreKeys,
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    counters: Counters,
    tasks: BackgroundTasks,
}

impl RetryManager {
    pub fn new(
        store: Arc<dyn BackingStore>,
        keys: StoreKeys,
        config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            keys,
            config,
            clock,
            rng: Mutex::new(rng),
            counters: Counters::default(),
            tasks: BackgroundTasks::new("retry_manager"),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.config.backoff.delay_with(attempt, &mut *rng)
    }

    /// Start the scanner loop. On shutdown the redelivery in flight finishes
    /// and no further records are claimed.
    pub fn start(self: &Arc<Self>, dispatcher: Arc<dyn RetryDispatcher>) {
        let manager = Arc::clone(self);
        self.tasks
            .spawn_draining("retry_scanner", self.config.scan_interval, move || {
                let manager = manager.clone();
                let dispatcher = dispatcher.clone();
                async move { manager.run_scanner_iteration(dispatcher.as_ref()).await }
            });
        tracing::info!(
            max_attempts = self.config.max_attempts,
            interval_ms = self.config.scan_interval.as_millis() as u64,
            "Retry scanner started"
        );
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    async fn run_scanner_iteration(&self, dispatcher: &dyn RetryDispatcher) {
        let policy = BackoffPolicy::store_operations();

        match retry_on_transient(&policy, 3, "retry_scan", |_| {
            self.process_due_retries(dispatcher)
        })
        .await
        .into_result()
        {
            Ok(0) => {}
            Ok(processed) => tracing::debug!(processed, "Processed due retries"),
            Err(e) => tracing::error!(error = %e, "Retry scan failed"),
        }

        if self.tasks.is_stopping() {
            return;
        }

        match retry_on_transient(&policy, 3, "retry_recover_stranded", |_| {
            self.recover_stranded()
        })
        .await
        .into_result()
        {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(recovered, "Recovered stranded retry records"),
            Err(e) => tracing::warn!(error = %e, "Failed to sweep for stranded retry records"),
        }

        let retention = chrono::Duration::from_std(self.config.completed_retention)
            .unwrap_or(chrono::Duration::MAX);
        match retry_on_transient(&policy, 3, "retry_purge_completed", |_| {
            self.purge_completed(retention)
        })
        .await
        .into_result()
        {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged completed retry records"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge completed retry records"),
        }
    }

    // ========================================================================
    // Record storage
    // ========================================================================

    async fn load(&self, message_id: &str) -> Result<Option<RetryRecord>> {
        match self.store.hget(&self.keys.retry_records(), message_id).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &RetryRecord) -> Result<()> {
        let id = record.message_id.to_string();
        let body = serde_json::to_string(record)?;
        self.store.hset(&self.keys.retry_records(), &id, &body).await?;
        self.store
            .hset(&self.keys.retry_correlation(), &record.correlation_id, &id)
            .await
    }

    async fn enter_schedule(&self, record: &RetryRecord) -> Result<()> {
        self.store
            .zadd(
                &self.keys.retry_schedule(),
                &record.message_id.to_string(),
                record.schedule_score(),
            )
            .await
    }

    fn after(&self, now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Record a failed delivery. `attempt_count` is the number of attempts
    /// already made; the stored count never goes backwards.
    pub async fn schedule_retry(
        &self,
        message: &ServiceMessage,
        error: &str,
        attempt_count: u32,
    ) -> Result<RetryRecord> {
        let now = self.clock.now();
        let id = message.id.to_string();

        let mut record = match self.load(&id).await? {
            Some(existing) if existing.status.is_terminal() => {
                tracing::warn!(
                    message_id = %id,
                    status = %existing.status,
                    "Ignoring failure for a message already in a terminal state"
                );
                return Ok(existing);
            }
            Some(existing) => existing,
            None => RetryRecord::new(message.clone(), self.config.max_attempts, now),
        };

        let attempt = record
            .attempt_count
            .max(attempt_count)
            .saturating_add(1)
            .min(record.max_attempts);
        record.attempt_count = attempt;
        record.last_error = Some(error.to_string());
        record.updated_at = now;

        if attempt >= record.max_attempts {
            record.status = RetryStatus::DeadLetter;
            record.next_retry_at = now;
            self.save(&record).await?;
            self.store.zrem(&self.keys.retry_schedule(), &id).await?;
            self.store.lrem(&self.keys.dead_letters(), &id).await?;
            self.store.rpush(&self.keys.dead_letters(), &id).await?;

            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                message_id = %id,
                correlation_id = %record.correlation_id,
                destination = %record.destination(),
                attempt,
                error = %error,
                "Retries exhausted, message dead-lettered"
            );
            return Ok(record);
        }

        let delay = self.backoff(attempt - 1);
        record.status = RetryStatus::Pending;
        record.next_retry_at = self.after(now, delay);
        self.save(&record).await?;
        self.enter_schedule(&record).await?;

        self.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            message_id = %id,
            destination = %record.destination(),
            attempt,
            max_attempts = record.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retry scheduled"
        );
        Ok(record)
    }

    /// Reschedule without consuming an attempt
    pub async fn defer_retry(
        &self,
        message: &ServiceMessage,
        reason: &str,
        delay: Duration,
    ) -> Result<RetryRecord> {
        let now = self.clock.now();
        let id = message.id.to_string();

        let mut record = match self.load(&id).await? {
            Some(existing) if existing.status.is_terminal() => return Ok(existing),
            Some(existing) => existing,
            None => RetryRecord::new(message.clone(), self.config.max_attempts, now),
        };

        record.status = RetryStatus::Pending;
        record.next_retry_at = self.after(now, delay);
        record.last_error = Some(reason.to_string());
        record.updated_at = now;
        self.save(&record).await?;
        self.enter_schedule(&record).await?;

        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            message_id = %id,
            attempt = record.attempt_count,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Retry deferred"
        );
        Ok(record)
    }

    /// Mark the message behind `correlation_id` delivered. Returns false when
    /// there is no record or it was already dead-lettered.
    pub async fn mark_success(&self, correlation_id: &str) -> Result<bool> {
        let Some(id) = self
            .store
            .hget(&self.keys.retry_correlation(), correlation_id)
            .await?
        else {
            return Ok(false);
        };
        let Some(mut record) = self.load(&id).await? else {
            return Ok(false);
        };

        match record.status {
            RetryStatus::Success => Ok(true),
            RetryStatus::DeadLetter => {
                tracing::warn!(
                    message_id = %id,
                    correlation_id = %correlation_id,
                    "Success reported for a dead-lettered message, leaving it dead-lettered"
                );
                Ok(false)
            }
            RetryStatus::Pending | RetryStatus::Retrying => {
                record.status = RetryStatus::Success;
                record.updated_at = self.clock.now();
                self.store.zrem(&self.keys.retry_schedule(), &id).await?;
                self.save(&record).await?;
                tracing::info!(
                    message_id = %id,
                    attempt = record.attempt_count,
                    "Message delivered after retry"
                );
                Ok(true)
            }
        }
    }

    // ========================================================================
    // Scanner
    // ========================================================================

    /// Claim every due record and hand it to `dispatcher`. Returns how many
    /// records this call claimed.
    pub async fn process_due_retries(&self, dispatcher: &dyn RetryDispatcher) -> Result<usize> {
        let now = self.clock.now();
        let due = self
            .store
            .zrange_by_score(
                &self.keys.retry_schedule(),
                f64::NEG_INFINITY,
                now.timestamp_millis() as f64,
                self.config.scan_batch_size,
            )
            .await?;

        let mut claimed = 0;
        for (id, score) in due {
            if self.tasks.is_stopping() {
                break;
            }
            if !self.store.zrem(&self.keys.retry_schedule(), &id).await? {
                continue;
            }
            match self.redeliver_claimed(&id, now, dispatcher).await {
                Ok(true) => claimed += 1,
                Ok(false) => {}
                Err(e) => {
                    if e.is_transient() {
                        self.rearm(&id, score).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(claimed)
    }

    /// Redeliver a record this scanner has taken off the schedule and record
    /// the outcome. False when there was nothing to redeliver.
    async fn redeliver_claimed(
        &self,
        id: &str,
        now: DateTime<Utc>,
        dispatcher: &dyn RetryDispatcher,
    ) -> Result<bool> {
        let Some(mut record) = self.load(id).await? else {
            tracing::warn!(message_id = %id, "Scheduled retry has no record, dropping");
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }

        record.status = RetryStatus::Retrying;
        record.updated_at = now;
        self.save(&record).await?;

        tracing::debug!(message_id = %id, attempt = record.attempt_count, "Redelivering message");
        self.counters.redelivered.fetch_add(1, Ordering::Relaxed);

        match dispatcher.redeliver(&record.message).await {
            RedeliveryOutcome::Delivered => {
                self.mark_success(&record.correlation_id).await?;
            }
            RedeliveryOutcome::Deferred { reason, delay } => {
                self.defer_retry(&record.message, &reason, delay).await?;
            }
            RedeliveryOutcome::Failed { error } => {
                self.schedule_retry(&record.message, &error, record.attempt_count)
                    .await?;
            }
        }
        Ok(true)
    }

    /// Put a claimed entry back at its old score
    async fn rearm(&self, id: &str, score: f64) {
        match self.store.zadd(&self.keys.retry_schedule(), id, score).await {
            Ok(()) => tracing::warn!(message_id = %id, "Retry re-armed after store error"),
            Err(e) => tracing::error!(
                message_id = %id,
                error = %e,
                "Could not re-arm retry, left to the stranded sweep"
            ),
        }
    }

    /// Put back PENDING/RETRYING records that are missing from the schedule
    /// and overdue by more than `stranded_after`. Returns how many.
    pub async fn recover_stranded(&self) -> Result<usize> {
        let now = self.clock.now();
        let grace = chrono::Duration::from_std(self.config.stranded_after)
            .map_err(|e| HubError::InvalidArgument(format!("stranded_after: {e}")))?;
        let mut recovered = 0;

        for body in self.store.hvals(&self.keys.retry_records()).await? {
            let Ok(record) = serde_json::from_str::<RetryRecord>(&body) else {
                continue;
            };
            if record.status.is_terminal() {
                continue;
            }
            let last_touched = record.updated_at.max(record.next_retry_at);
            let overdue = last_touched
                .checked_add_signed(grace)
                .is_some_and(|cutoff| cutoff <= now);
            if !overdue {
                continue;
            }

            let id = record.message_id.to_string();
            if self
                .store
                .zscore(&self.keys.retry_schedule(), &id)
                .await?
                .is_some()
            {
                continue;
            }
            self.enter_schedule(&record).await?;
            recovered += 1;
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %id,
                status = %record.status,
                attempt = record.attempt_count,
                "Stranded retry record returned to the schedule"
            );
        }
        Ok(recovered)
    }

    /// Drop SUCCESS records last updated more than `older_than` ago
    pub async fn purge_completed(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = self.clock.now() - older_than;
        let mut purged = 0;

        for body in self.store.hvals(&self.keys.retry_records()).await? {
            let Ok(record) = serde_json::from_str::<RetryRecord>(&body) else {
                continue;
            };
            if record.status != RetryStatus::Success || record.updated_at >= cutoff {
                continue;
            }
            let id = record.message_id.to_string();
            if self.store.hdel(&self.keys.retry_records(), &id).await? {
                purged += 1;
            }
            let indexed = self
                .store
                .hget(&self.keys.retry_correlation(), &record.correlation_id)
                .await?;
            if indexed.as_deref() == Some(id.as_str()) {
                self.store
                    .hdel(&self.keys.retry_correlation(), &record.correlation_id)
                    .await?;
            }
        }
        Ok(purged)
    }

    // ========================================================================
    // Dead letters & introspection
    // ========================================================================

    pub async fn get_retry_status(&self, message_id: Uuid) -> Result<Option<RetryRecord>> {
        self.load(&message_id.to_string()).await
    }

    /// Oldest first
    pub async fn get_dead_letter_messages(&self, limit: usize) -> Result<Vec<RetryRecord>> {
        let ids = self.store.lrange(&self.keys.dead_letters(), 0, limit).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Take a message off the dead-letter list and schedule it immediately
    pub async fn reprocess_dead_letter(&self, message_id: Uuid) -> Result<bool> {
        let id = message_id.to_string();
        let Some(mut record) = self.load(&id).await? else {
            return Ok(false);
        };
        if self.store.lrem(&self.keys.dead_letters(), &id).await? == 0 {
            return Ok(false);
        }

        let now = self.clock.now();
        let previous_attempts = record.attempt_count;
        if self.config.reset_attempts_on_reprocess {
            record.attempt_count = 0;
        }
        record.status = RetryStatus::Pending;
        record.next_retry_at = now;
        record.updated_at = now;
        self.save(&record).await?;
        self.enter_schedule(&record).await?;

        self.counters.reprocessed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            message_id = %id,
            previous_attempts,
            attempt = record.attempt_count,
            "Dead letter re-entered retry schedule"
        );
        Ok(true)
    }

    pub async fn get_metrics(&self) -> Result<RetryMetrics> {
        let mut by_status = HashMap::new();
        let mut total_records = 0;
        for body in self.store.hvals(&self.keys.retry_records()).await? {
            if let Ok(record) = serde_json::from_str::<RetryRecord>(&body) {
                *by_status.entry(record.status).or_insert(0) += 1;
                total_records += 1;
            }
        }

        Ok(RetryMetrics {
            by_status,
            total_records,
            scheduled: self.store.zcard(&self.keys.retry_schedule()).await?,
            dead_letter_queue: self.store.llen(&self.keys.dead_letters()).await?,
            retries_scheduled: self.counters.retries_scheduled.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            redelivered: self.counters.redelivered.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            reprocessed: self.counters.reprocessed.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
        })
    }
}
