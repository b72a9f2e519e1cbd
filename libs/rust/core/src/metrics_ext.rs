//! OpenTelemetry instruments for the federation core.
//!
//! Instruments hang off the global meter; without an installed provider they
//! are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

pub struct FederationMetrics {
    pub rounds_started: Counter<u64>,
    pub rounds_completed: Counter<u64>,
    pub rounds_failed: Counter<u64>,
    pub updates_accepted: Counter<u64>,
    pub updates_rejected: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub epsilon_charged: Histogram<f64>,
}

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedshield"));

pub static FED_METRICS: Lazy<FederationMetrics> = Lazy::new(|| FederationMetrics {
    rounds_started: FED_METER.u64_counter("fedshield_rounds_started_total").with_description("Rounds that reached in-progress").build(),
    rounds_completed: FED_METER.u64_counter("fedshield_rounds_completed_total").with_description("Rounds aggregated successfully").build(),
    rounds_failed: FED_METER.u64_counter("fedshield_rounds_failed_total").with_description("Rounds marked failed (timeout, abort, aggregation error)").build(),
    updates_accepted: FED_METER.u64_counter("fedshield_updates_accepted_total").with_description("Updates admitted into a round").build(),
    updates_rejected: FED_METER.u64_counter("fedshield_updates_rejected_total").with_description("Updates rejected by the admission pipeline").build(),
    aggregation_latency_ms: FED_METER.f64_histogram("fedshield_aggregation_latency_ms").with_description("Open + aggregate latency per round").with_unit("ms").build(),
    epsilon_charged: FED_METER.f64_histogram("fedshield_epsilon_charged").with_description("Privacy budget charged per accepted update").build(),
});

impl FederationMetrics {
    pub fn rejected(&self, reason: &'static str) {
        self.updates_rejected.add(1, &[KeyValue::new("reason", reason)]);
    }
}
