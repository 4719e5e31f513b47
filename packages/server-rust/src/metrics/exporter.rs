//! Prometheus export of the `metrics` facade.
//!
//! The registry emits `mcp_calls_total`, `mcp_call_duration_seconds`,
//! `mcp_active_calls` and `mcp_errors_total` through the facade; without an
//! installed recorder those calls are no-ops.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the global Prometheus recorder with its own HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed or the
/// listener cannot be started.
pub fn install_prometheus_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter on {addr}: {e}"))?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}
