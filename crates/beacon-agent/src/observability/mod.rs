//! Agent observability setup: console logging and the Prometheus endpoint.

pub mod metrics;
pub mod tracing;
