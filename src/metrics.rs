//! Prometheus metrics exporter.
//!
//! Counter names emitted across the crate:
//! - `proxy_requests_total`, `proxy_auth_failures_total`,
//!   `proxy_rate_limited_total`, `proxy_pool_exhausted_total`,
//!   `proxy_retries_exhausted_total`
//! - `key_demotions_total`, `key_promotions_total`
//! - `request_logs_dropped_total`

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Start the exporter on the configured port. Must be called from within
/// the tokio runtime.
pub fn init_metrics(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .add_global_label("service", "keygate")
        .install()?;
    info!("metrics exporter listening on :{port}/metrics");
    Ok(())
}
