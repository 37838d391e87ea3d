mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers both sides of the event pipeline:
// - Order commands accepted/rejected
// - Event publication (per kind, failure reason, latency)
// - Consumer handling, redeliveries and dead-lettering
// - Broker circuit breaker state
//
// Scraped via /metrics (see `start_metrics_server`).
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Order Commands
    pub order_commands: IntCounterVec,

    // Publishing
    pub events_published: IntCounterVec,
    pub events_publish_failed: IntCounterVec,
    pub publish_duration: HistogramVec,

    // Consuming
    pub events_handled: IntCounterVec,
    pub events_handler_failed: IntCounterVec,
    pub events_redelivered: IntCounterVec,
    pub events_discarded: IntCounterVec,

    // DLQ
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_event_type: IntCounterVec,

    // Circuit Breaker
    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let order_commands = IntCounterVec::new(
            Opts::new("order_commands_total", "Order commands by outcome"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(order_commands.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("order_events_published_total", "Order events accepted by the publisher"),
            &["event_type", "backend"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_publish_failed = IntCounterVec::new(
            Opts::new("order_events_publish_failed_total", "Order events that could not be published"),
            &["event_type", "reason"],
        )?;
        registry.register(Box::new(events_publish_failed.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new("order_event_publish_duration_seconds", "Event publish latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["backend"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let events_handled = IntCounterVec::new(
            Opts::new("consumer_events_handled_total", "Inbound events acknowledged after handling"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_handled.clone()))?;

        let events_handler_failed = IntCounterVec::new(
            Opts::new("consumer_events_failed_total", "Inbound events whose handler failed"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_handler_failed.clone()))?;

        let events_redelivered = IntCounterVec::new(
            Opts::new("consumer_events_redelivered_total", "Inbound events scheduled for redelivery"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_redelivered.clone()))?;

        let events_discarded = IntCounterVec::new(
            Opts::new("consumer_events_discarded_total", "Inbound messages dropped without handling"),
            &["topic"],
        )?;
        registry.register(Box::new(events_discarded.clone()))?;

        let dlq_messages_total = IntCounter::new(
            "dlq_messages_total",
            "Total messages in dead letter queue",
        )?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_event_type = IntCounterVec::new(
            Opts::new("dlq_messages_by_event_type", "DLQ messages by event type"),
            &["event_type"],
        )?;
        registry.register(Box::new(dlq_messages_by_event_type.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            order_commands,
            events_published,
            events_publish_failed,
            publish_duration,
            events_handled,
            events_handler_failed,
            events_redelivered,
            events_discarded,
            dlq_messages_total,
            dlq_messages_by_event_type,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_command(&self, command: &str, success: bool) {
        let outcome = if success { "ok" } else { "rejected" };
        self.order_commands.with_label_values(&[command, outcome]).inc();
    }

    pub fn record_published(&self, event_type: &str, backend: &str, duration_secs: f64) {
        self.events_published.with_label_values(&[event_type, backend]).inc();
        self.publish_duration.with_label_values(&[backend]).observe(duration_secs);
    }

    pub fn record_publish_failure(&self, event_type: &str, reason: &str) {
        self.events_publish_failed.with_label_values(&[event_type, reason]).inc();
    }

    pub fn record_handled(&self, event_type: &str) {
        self.events_handled.with_label_values(&[event_type]).inc();
    }

    /// A failed handler invocation that will be retried.
    pub fn record_redelivery(&self, event_type: &str) {
        self.events_handler_failed.with_label_values(&[event_type]).inc();
        self.events_redelivered.with_label_values(&[event_type]).inc();
    }

    pub fn record_discarded(&self, topic: &str) {
        self.events_discarded.with_label_values(&[topic]).inc();
    }

    pub fn record_dlq_message(&self, event_type: &str) {
        self.events_handler_failed.with_label_values(&[event_type]).inc();
        self.dlq_messages_total.inc();
        self.dlq_messages_by_event_type.with_label_values(&[event_type]).inc();
    }

    pub fn update_circuit_breaker_state(&self, code: i64) {
        self.circuit_breaker_state.set(code);
    }
}
