//! # Prometheus Metrics — Orchestrator Exposition
//!
//! Operational metrics in the Prometheus text exposition format, served at
//! `/metrics`.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `polaris_reconcile_ticks_total` | Counter | — | Completed reconciliation ticks |
//! | `polaris_record_transitions_total` | Counter | `state` | Records moved into a state |
//! | `polaris_trigger_outcomes_total` | Counter | `outcome` | Trigger calls by outcome |
//! | `polaris_notifications_total` | Counter | `status` | Notification attempts (`sent`, `failed`) |
//! | `polaris_inflight_records` | Gauge | — | Records in `queued` or `deferred` |
//!
//! The gauge is refreshed at the end of every tick.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StateLabel {
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

/// Thread-safe metrics registry. Every handle is atomic and cheap to clone.
pub struct Metrics {
    pub registry: Registry,
    pub reconcile_ticks: Counter,
    pub record_transitions: Family<StateLabel, Counter>,
    pub trigger_outcomes: Family<OutcomeLabel, Counter>,
    pub notifications: Family<StatusLabel, Counter>,
    pub inflight_records: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconcile_ticks = Counter::default();
        registry.register(
            "polaris_reconcile_ticks",
            "Completed reconciliation ticks",
            reconcile_ticks.clone(),
        );

        let record_transitions = Family::<StateLabel, Counter>::default();
        registry.register(
            "polaris_record_transitions",
            "Record state transitions by target state",
            record_transitions.clone(),
        );

        let trigger_outcomes = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "polaris_trigger_outcomes",
            "Trigger requests by outcome",
            trigger_outcomes.clone(),
        );

        let notifications = Family::<StatusLabel, Counter>::default();
        registry.register(
            "polaris_notifications",
            "Notification delivery attempts by status",
            notifications.clone(),
        );

        let inflight_records = Gauge::default();
        registry.register(
            "polaris_inflight_records",
            "Records currently queued or deferred",
            inflight_records.clone(),
        );

        Self {
            registry,
            reconcile_ticks,
            record_transitions,
            trigger_outcomes,
            notifications,
            inflight_records,
        }
    }

    pub fn record_transition(&self, state: crate::model::RecordState) {
        self.record_transitions
            .get_or_create(&StateLabel {
                state: state.as_str().to_string(),
            })
            .inc();
    }

    pub fn trigger_outcome(&self, outcome: &str) {
        self.trigger_outcomes
            .get_or_create(&OutcomeLabel {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn notification(&self, sent: bool) {
        let status = if sent { "sent" } else { "failed" };
        self.notifications
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
