use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::dispatcher::HubDispatcher;
use super::transport::{DeliveryError, DeliveryTransport};
use crate::clock::Clock;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::metrics::Metrics;
use crate::models::{Priority, PrioritizedMessage, ServiceMessage};
use crate::queue::{PriorityQueueManager, QueueMetrics};
use crate::registry::{EnhancedServiceRegistry, HealthProbe, RegistryMetrics};
use crate::retry::{RetryDispatcher, RetryManager, RetryMetrics, RetryStatus};
use crate::store::{BackingStore, StoreKeys};
use crate::utils::{
    retry_on_transient, BackgroundTasks, BackoffPolicy, CircuitBreakerManager, CircuitSnapshot,
};

// ============================================================================
// Message Hub
// ============================================================================
//
// Wires the components together:
//
//   publish ─► route check ─► PriorityQueueManager
//                                   │ dispatch loop
//                                   ▼
//              registry.get_instance ─► breaker ─► transport
//                                   │
//          ok: mark_success   no instance: requeue
//          circuit open: defer_retry   failure: schedule_retry
//
// The retry scanner re-enters the same dispatcher for due retries.
//
// Every dequeued message ends up delivered, back in the queue, or in the
// retry schedule. A follow-up that keeps failing is surfaced as
// HubError::Unrecorded, never dropped silently.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// No registered instance of the destination handles this message type
    NoRoute,
    /// Queue at capacity
    Overflow,
    /// Deadline already passed
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PublishOutcome {
    Accepted { message_id: Uuid },
    Rejected(RejectReason),
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dequeued: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub deferred: usize,
    pub retry_scheduled: usize,
    pub dead_lettered: usize,
    /// Put back unattempted because the hub is shutting down
    pub restored: usize,
    /// Messages whose follow-up (requeue/retry bookkeeping) hit a store error
    pub store_errors: usize,
}

impl DispatchReport {
    fn count(&mut self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::Delivered => self.delivered += 1,
            FollowUp::Requeued => self.requeued += 1,
            FollowUp::Deferred => self.deferred += 1,
            FollowUp::RetryScheduled => self.retry_scheduled += 1,
            FollowUp::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Where a dispatched message went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    Delivered,
    Requeued,
    Deferred,
    RetryScheduled,
    DeadLettered,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub queue: QueueMetrics,
    pub retry: RetryMetrics,
    pub registry: RegistryMetrics,
    pub circuits: Vec<CircuitSnapshot>,
    pub open_circuits: usize,
    pub checked_at: DateTime<Utc>,
}

pub struct MessageHub {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<PriorityQueueManager>,
    retry: Arc<RetryManager>,
    registry: Arc<EnhancedServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    dispatcher: Arc<HubDispatcher>,
    metrics: Option<Arc<Metrics>>,
    tasks: BackgroundTasks,
}

impl MessageHub {
    pub fn new(
        config: HubConfig,
        store: Arc<dyn BackingStore>,
        probe: Arc<dyn HealthProbe>,
        transport: Arc<dyn DeliveryTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(config, store, probe, transport, clock, None)
    }

    pub fn with_metrics(
        config: HubConfig,
        store: Arc<dyn BackingStore>,
        probe: Arc<dyn HealthProbe>,
        transport: Arc<dyn DeliveryTransport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::build(config, store, probe, transport, clock, Some(metrics))
    }

    fn build(
        config: HubConfig,
        store: Arc<dyn BackingStore>,
        probe: Arc<dyn HealthProbe>,
        transport: Arc<dyn DeliveryTransport>,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let keys = StoreKeys::new(config.key_prefix.clone());
        let queue = Arc::new(PriorityQueueManager::new(
            store.clone(),
            keys.clone(),
            config.queue.clone(),
            clock.clone(),
        ));
        let retry = Arc::new(RetryManager::new(
            store,
            keys,
            config.retry.clone(),
            clock.clone(),
        ));
        let registry = Arc::new(EnhancedServiceRegistry::new(
            config.registry.clone(),
            probe,
            clock.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));

        let mut dispatcher = HubDispatcher::new(
            registry.clone(),
            breakers.clone(),
            transport,
            config.dispatch.delivery_timeout,
            config.circuit_breaker.cool_down,
        );
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }

        for (destination, limit) in &config.quotas {
            queue.set_service_quota(destination, *limit);
        }

        Self {
            config,
            clock,
            queue,
            retry,
            registry,
            breakers,
            dispatcher: Arc::new(dispatcher),
            metrics,
            tasks: BackgroundTasks::new("message_hub"),
        }
    }

    pub fn queue(&self) -> &Arc<PriorityQueueManager> {
        &self.queue
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn registry(&self) -> &Arc<EnhancedServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Start every background loop: registry checks, queue janitor,
    /// retry scanner and the dispatch loop
    pub fn initialize(self: &Arc<Self>) {
        self.registry.initialize();
        self.queue.start();
        self.retry
            .start(self.dispatcher.clone() as Arc<dyn RetryDispatcher>);

        let hub = Arc::clone(self);
        self.tasks
            .spawn_draining("dispatch_loop", self.config.dispatch.interval, move || {
                let hub = hub.clone();
                async move { hub.run_dispatch_iteration().await }
            });

        tracing::info!(
            batch_size = self.config.dispatch.batch_size,
            interval_ms = self.config.dispatch.interval.as_millis() as u64,
            "Message hub initialized"
        );
    }

    /// Stop the dispatch loop first, then the component loops. The delivery
    /// in flight completes; the rest of its batch goes back to the queue.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.retry.shutdown().await;
        self.queue.shutdown().await;
        self.registry.shutdown().await;
        tracing::info!("Message hub shut down");
    }

    async fn run_dispatch_iteration(&self) {
        match self.dispatch_batch(self.config.dispatch.batch_size).await {
            Ok(report) if report.dequeued > 0 => {
                tracing::debug!(
                    dequeued = report.dequeued,
                    delivered = report.delivered,
                    requeued = report.requeued,
                    deferred = report.deferred,
                    retry_scheduled = report.retry_scheduled,
                    restored = report.restored,
                    "Dispatch iteration complete"
                );
            }
            Ok(_) => {}
            Err(HubError::Unrecorded {
                message_ids,
                last_error,
            }) => tracing::error!(
                message_ids = ?message_ids,
                error = %last_error,
                "Dispatched messages left without a recorded outcome"
            ),
            Err(e) => tracing::error!(error = %e, "Dispatch iteration failed"),
        }
    }

    fn record_publish(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(outcome);
        }
    }

    /// Accept a message for delivery. Store errors propagate.
    pub async fn publish(
        &self,
        message: ServiceMessage,
        priority: Option<Priority>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<PublishOutcome> {
        if !self
            .registry
            .has_capable_instance(&message.destination, message.message_type)
        {
            tracing::warn!(
                message_id = %message.id,
                destination = %message.destination,
                message_type = %message.message_type,
                "No route for message"
            );
            self.record_publish("no_route");
            return Ok(PublishOutcome::Rejected(RejectReason::NoRoute));
        }

        if deadline.is_some_and(|deadline| deadline <= self.clock.now()) {
            self.record_publish("expired");
            return Ok(PublishOutcome::Rejected(RejectReason::Expired));
        }

        let message_id = message.id;
        if self.queue.enqueue(message, priority, deadline).await? {
            self.record_publish("accepted");
            Ok(PublishOutcome::Accepted { message_id })
        } else {
            self.record_publish("overflow");
            Ok(PublishOutcome::Rejected(RejectReason::Overflow))
        }
    }

    /// Pull one batch off the queue and try to deliver each message.
    ///
    /// Dequeue errors propagate. Each follow-up (mark success, requeue,
    /// retry bookkeeping) is retried on transient store errors; messages
    /// whose follow-up still fails are returned as `HubError::Unrecorded`
    /// once the rest of the batch has been handled.
    pub async fn dispatch_batch(&self, batch_size: usize) -> Result<DispatchReport> {
        if self.tasks.is_stopping() {
            return Ok(DispatchReport::default());
        }

        let batch = self.queue.dequeue(batch_size).await?;
        let mut report = DispatchReport {
            dequeued: batch.len(),
            ..DispatchReport::default()
        };
        let mut unrecorded = Vec::new();
        let mut last_error = None;
        let mut remaining = batch.into_iter();

        while let Some(staged) = remaining.next() {
            if self.tasks.is_stopping() {
                for staged in std::iter::once(staged).chain(remaining.by_ref()) {
                    match self.restore(&staged).await {
                        Ok(()) => report.restored += 1,
                        Err(e) => {
                            report.store_errors += 1;
                            unrecorded.push(staged.id());
                            last_error = Some(e.to_string());
                        }
                    }
                }
                tracing::info!(restored = report.restored, "Dispatch stopped for shutdown");
                break;
            }

            let outcome = self.dispatcher.deliver(&staged.message).await;
            let policy = BackoffPolicy::store_operations();
            let recorded = retry_on_transient(&policy, 3, "dispatch_follow_up", |_| {
                self.follow_up(&staged, &outcome)
            })
            .await
            .into_result();

            match recorded {
                Ok(follow_up) => report.count(follow_up),
                Err(e) => {
                    report.store_errors += 1;
                    tracing::error!(
                        message_id = %staged.id(),
                        destination = %staged.message.destination,
                        error = %e,
                        "Failed to record delivery outcome"
                    );
                    unrecorded.push(staged.id());
                    last_error = Some(e.to_string());
                }
            }
        }

        if let Some(last_error) = last_error {
            return Err(HubError::Unrecorded {
                message_ids: unrecorded,
                last_error,
            });
        }
        Ok(report)
    }

    async fn restore(&self, staged: &PrioritizedMessage) -> Result<()> {
        let policy = BackoffPolicy::store_operations();
        retry_on_transient(&policy, 3, "dispatch_restore", |_| {
            self.queue.restore(staged.clone())
        })
        .await
        .into_result()
    }

    async fn follow_up(
        &self,
        staged: &PrioritizedMessage,
        outcome: &std::result::Result<String, DeliveryError>,
    ) -> Result<FollowUp> {
        match outcome {
            Ok(_) => {
                self.retry
                    .mark_success(&staged.message.correlation_id)
                    .await?;
                Ok(FollowUp::Delivered)
            }
            Err(DeliveryError::Unavailable { .. }) => {
                if self.queue.requeue(staged.clone()).await? {
                    Ok(FollowUp::Requeued)
                } else {
                    self.schedule_retry(&staged.message, "queue full on requeue", staged.attempt_count)
                        .await
                }
            }
            Err(DeliveryError::CircuitOpen { route }) => {
                self.retry
                    .defer_retry(
                        &staged.message,
                        &format!("circuit open for {route}"),
                        self.dispatcher.cool_down(),
                    )
                    .await?;
                Ok(FollowUp::Deferred)
            }
            Err(error) => {
                self.schedule_retry(&staged.message, &error.to_string(), 0)
                    .await
            }
        }
    }

    async fn schedule_retry(
        &self,
        message: &ServiceMessage,
        error: &str,
        attempt_count: u32,
    ) -> Result<FollowUp> {
        let record = self.retry.schedule_retry(message, error, attempt_count).await?;
        let dead_lettered = record.status == RetryStatus::DeadLetter;
        if let Some(metrics) = &self.metrics {
            metrics.record_retry_scheduled(dead_lettered);
        }
        Ok(if dead_lettered {
            FollowUp::DeadLettered
        } else {
            FollowUp::RetryScheduled
        })
    }

    /// Snapshot of every component; refreshes the gauges when metrics are on
    pub async fn status(&self) -> Result<HubStatus> {
        let status = HubStatus {
            queue: self.queue.get_metrics().await?,
            retry: self.retry.get_metrics().await?,
            registry: self.registry.get_metrics(),
            circuits: self.breakers.states(),
            open_circuits: self.breakers.open_circuits(),
            checked_at: self.clock.now(),
        };

        if let Some(metrics) = &self.metrics {
            for (tier, count) in &status.queue.status.tiers {
                metrics.set_staged(*tier, *count);
            }
            for (health, count) in &status.registry.by_health {
                metrics.set_instances(*health, *count);
            }
            metrics.set_open_circuits(status.open_circuits);
        }
        Ok(status)
    }
}
