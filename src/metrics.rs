use crate::{config::MetricsConfig, Error, Result};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter when enabled. Without it the metric macros
/// are no-ops.
pub fn init_metrics(config: &MetricsConfig) -> Result<Option<SocketAddr>> {
    if !config.enabled {
        return Ok(None);
    }

    let listen: SocketAddr = config.listen.parse().map_err(|e| Error::Metrics {
        message: format!("invalid listen address '{}': {}", config.listen, e),
    })?;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| Error::Metrics {
            message: e.to_string(),
        })?;

    describe_counter!("revx_requests_total", "HTTP requests received");
    describe_counter!(
        "revx_upstream_errors_total",
        "Requests answered with 502 after an upstream failure"
    );
    describe_histogram!(
        "revx_upstream_duration_seconds",
        Unit::Seconds,
        "Time until the upstream response head arrived"
    );
    describe_counter!("revx_upgrades_total", "Connection upgrades proxied");

    Ok(Some(listen))
}
