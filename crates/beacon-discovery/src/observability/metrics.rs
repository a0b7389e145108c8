//! Discovery Metrics
//!
//! Metrics tracked:
//! - `beacon_registrations_total` - counter of successful registrations
//! - `beacon_registration_failures_total` - counter of failed attempts by reason
//! - `beacon_lease_lost_total` - counter of lost leases
//! - `beacon_watch_events_total` - counter of delivered watch events by kind
//! - `beacon_watch_events_dropped_total` - counter of events dropped under backpressure
//! - `beacon_registry_nodes` - gauge of nodes known to a registry

use beacon_core::NodeEventKind;
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for all metrics. Call once after installing a
/// recorder; without one every recording below is a no-op.
pub fn describe_metrics() {
    describe_counter!(
        "beacon_registrations_total",
        "Total number of successful node registrations"
    );
    describe_counter!(
        "beacon_registration_failures_total",
        "Total number of failed registration attempts"
    );
    describe_counter!("beacon_lease_lost_total", "Total number of leases lost");
    describe_counter!(
        "beacon_watch_events_total",
        "Total number of node events delivered to subscribers"
    );
    describe_counter!(
        "beacon_watch_events_dropped_total",
        "Total number of node events dropped because a subscriber was full"
    );
    describe_gauge!("beacon_registry_nodes", "Number of nodes known to the registry");
}

pub fn record_registration() {
    counter!("beacon_registrations_total").increment(1);
}

pub fn record_registration_failure(conflict: bool) {
    let reason = if conflict { "conflict" } else { "error" };
    counter!("beacon_registration_failures_total", "reason" => reason).increment(1);
}

pub fn record_lease_lost() {
    counter!("beacon_lease_lost_total").increment(1);
}

pub fn record_watch_event(kind: NodeEventKind) {
    counter!("beacon_watch_events_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_watch_drop() {
    counter!("beacon_watch_events_dropped_total").increment(1);
}

pub fn set_registry_nodes(count: usize) {
    gauge!("beacon_registry_nodes").set(count as f64);
}
