//! Prometheus exporter for the discovery metrics.

use anyhow::Context;
use beacon_discovery::observability::describe_metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Serve `/metrics` on `addr` and register metric descriptions.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_metrics();
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}
