//! Prometheus metrics using prometheus-client crate.
//!
//! [`BridgeMetrics`] registers every bridge metric on a caller-owned
//! `Registry`; the admin server encodes that registry on `/metrics` in
//! OpenMetrics text format.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for notification counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NotificationLabels {
    /// What happened to the event (e.g., "posted", "duplicate", "no_route")
    pub outcome: String,
}

/// Labels for decision counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    /// Gate type (e.g., "hitl_4_code")
    pub gate_type: String,
    /// "approved", "rejected", or a `GateErrorKind` label
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Histogram Bucket Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Chat post latency buckets in milliseconds.
const POST_DURATION_BUCKETS: &[f64] = &[
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// BridgeMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// Prometheus metrics for the bridge. All names carry the `gatebridge_`
/// prefix.
#[derive(Debug)]
pub struct BridgeMetrics {
    /// Gate-request events by processing outcome.
    pub notifications_total: Family<NotificationLabels, Counter>,

    /// Decision attempts by gate type and outcome.
    pub decisions_total: Family<DecisionLabels, Counter>,

    /// Consumer loop failures (log unreachable, ack failed).
    pub consumer_errors_total: Counter,

    /// Chat post latency in milliseconds.
    pub post_duration_ms: Histogram,

    /// Process uptime in seconds.
    pub uptime_seconds: Gauge,
}

impl BridgeMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let notifications_total = Family::<NotificationLabels, Counter>::default();
        registry.register(
            "gatebridge_notifications",
            "Gate-request events processed, by outcome",
            notifications_total.clone(),
        );

        let decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "gatebridge_decisions",
            "Gate decision attempts, by gate type and outcome",
            decisions_total.clone(),
        );

        let consumer_errors_total = Counter::default();
        registry.register(
            "gatebridge_consumer_errors",
            "Event consumer loop errors",
            consumer_errors_total.clone(),
        );

        let post_duration_ms = Histogram::new(POST_DURATION_BUCKETS.iter().copied());
        registry.register(
            "gatebridge_post_duration_ms",
            "Chat notification post latency in milliseconds",
            post_duration_ms.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "gatebridge_uptime_seconds",
            "Process uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            notifications_total,
            decisions_total,
            consumer_errors_total,
            post_duration_ms,
            uptime_seconds,
        }
    }

    /// Metrics registered on a throwaway registry, for tests and tools that
    /// do not export.
    #[must_use]
    pub fn unregistered() -> Self {
        Self::new(&mut Registry::default())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Count one processed gate-request event.
    pub fn record_notification(&self, outcome: &str) {
        self.notifications_total
            .get_or_create(&NotificationLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Count one decision attempt.
    pub fn record_decision(&self, gate_type: &str, outcome: &str) {
        self.decisions_total
            .get_or_create(&DecisionLabels {
                gate_type: gate_type.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Count one consumer loop error.
    pub fn record_consumer_error(&self) {
        self.consumer_errors_total.inc();
    }

    /// Record a chat post latency.
    pub fn record_post_duration(&self, duration_ms: f64) {
        self.post_duration_ms.observe(duration_ms);
    }

    /// Set the uptime gauge.
    pub fn set_uptime(&self, seconds: u64) {
        self.uptime_seconds
            .set(i64::try_from(seconds).unwrap_or(i64::MAX));
    }
}
