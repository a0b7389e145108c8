//! Observability Module
//!
//! - `events`: structured discovery events with consistent fields
//! - `metrics`: counters and gauges recorded through the `metrics` facade

pub mod events;
pub mod metrics;

pub use metrics::describe_metrics;
