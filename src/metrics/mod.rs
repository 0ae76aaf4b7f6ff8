// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub use server::start_metrics_server;

use crate::models::Priority;
use crate::registry::HealthStatus;

// ============================================================================
// Metrics Module - Prometheus metrics for the hub
// ============================================================================
//
// Counters are bumped by the hub as things happen (publish, delivery,
// retry scheduling, dead-lettering). Gauges are snapshots refreshed from
// `MessageHub::status()`:
// - staged messages per priority tier
// - instances per health state
// - circuits not closed
//
// Served as text exposition on /metrics by the actix-web server.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Ingress
    pub messages_published: IntCounterVec,

    // Delivery
    pub deliveries: IntCounterVec,
    pub delivery_duration: HistogramVec,

    // Retry / DLQ
    pub retries_scheduled: IntCounter,
    pub dead_letters: IntCounter,

    // Snapshots
    pub staged_messages: IntGaugeVec,
    pub instances: IntGaugeVec,
    pub open_circuits: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let messages_published = IntCounterVec::new(
            Opts::new("hub_messages_published_total", "Messages offered to the hub"),
            &["outcome"],
        )?;
        registry.register(Box::new(messages_published.clone()))?;

        let deliveries = IntCounterVec::new(
            Opts::new("hub_deliveries_total", "Delivery attempts by outcome"),
            &["destination", "outcome"],
        )?;
        registry.register(Box::new(deliveries.clone()))?;

        let delivery_duration = HistogramVec::new(
            HistogramOpts::new("hub_delivery_duration_seconds", "Delivery round-trip duration")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["destination"],
        )?;
        registry.register(Box::new(delivery_duration.clone()))?;

        let retries_scheduled = IntCounter::new(
            "hub_retries_scheduled_total",
            "Failed deliveries put on the retry schedule",
        )?;
        registry.register(Box::new(retries_scheduled.clone()))?;

        let dead_letters = IntCounter::new(
            "hub_dead_letters_total",
            "Messages moved to the dead-letter list",
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let staged_messages = IntGaugeVec::new(
            Opts::new("hub_staged_messages", "Messages staged per priority tier"),
            &["tier"],
        )?;
        registry.register(Box::new(staged_messages.clone()))?;

        let instances = IntGaugeVec::new(
            Opts::new("hub_instances", "Registered instances per health state"),
            &["health"],
        )?;
        registry.register(Box::new(instances.clone()))?;

        let open_circuits = IntGauge::new("hub_open_circuits", "Circuit breakers not closed")?;
        registry.register(Box::new(open_circuits.clone()))?;

        Ok(Self {
            registry,
            messages_published,
            deliveries,
            delivery_duration,
            retries_scheduled,
            dead_letters,
            staged_messages,
            instances,
            open_circuits,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_publish(&self, outcome: &str) {
        self.messages_published.with_label_values(&[outcome]).inc();
    }

    pub fn record_delivery(&self, destination: &str, outcome: &str, duration_secs: f64) {
        self.deliveries.with_label_values(&[destination, outcome]).inc();
        self.delivery_duration
            .with_label_values(&[destination])
            .observe(duration_secs);
    }

    pub fn record_retry_scheduled(&self, dead_lettered: bool) {
        if dead_lettered {
            self.dead_letters.inc();
        } else {
            self.retries_scheduled.inc();
        }
    }

    pub fn set_staged(&self, tier: Priority, count: usize) {
        self.staged_messages
            .with_label_values(&[tier.as_str()])
            .set(count as i64);
    }

    pub fn set_instances(&self, health: HealthStatus, count: usize) {
        self.instances
            .with_label_values(&[health.as_str()])
            .set(count as i64);
    }

    pub fn set_open_circuits(&self, count: usize) {
        self.open_circuits.set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|family| family.metric.iter().map(|m| m.counter.value.unwrap_or(0.0)).sum())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_publish("accepted");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_delivery() {
        let metrics = Metrics::new().unwrap();
        metrics.record_delivery("content-service", "delivered", 0.02);
        metrics.record_delivery("content-service", "failed", 0.5);

        let gathered = metrics.registry.gather();
        let deliveries = gathered.iter().find(|m| m.name() == "hub_deliveries_total").unwrap();
        assert_eq!(deliveries.metric.len(), 2);
    }

    #[test]
    fn test_retry_and_dead_letter_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retry_scheduled(false);
        metrics.record_retry_scheduled(false);
        metrics.record_retry_scheduled(true);

        assert_eq!(counter_value(&metrics, "hub_retries_scheduled_total"), 2.0);
        assert_eq!(counter_value(&metrics, "hub_dead_letters_total"), 1.0);
    }

    #[test]
    fn test_snapshot_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.set_staged(Priority::Critical, 7);
        metrics.set_open_circuits(2);

        let gathered = metrics.registry.gather();
        let open = gathered.iter().find(|m| m.name() == "hub_open_circuits").unwrap();
        assert_eq!(open.metric[0].gauge.value, Some(2.0));
        let staged = gathered.iter().find(|m| m.name() == "hub_staged_messages").unwrap();
        assert_eq!(staged.metric[0].gauge.value, Some(7.0));
    }
}
