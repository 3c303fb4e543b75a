use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

pub const SIGNALS_DROPPED: &str = "passway_signals_dropped_total";
pub const SIGNAL_DECODE_ERRORS: &str = "passway_signal_decode_errors_total";
pub const SESSIONS: &str = "passway_sessions_total";
pub const SESSION_FAILURES: &str = "passway_session_failures_total";
pub const POOL_ACTIVE: &str = "passway_pool_active";

/// Installs the Prometheus recorder for the `metrics` crate with a scrape
/// listener on `addr`. Without an address nothing is installed and every
/// metric call stays a no-op.
///
/// Must run inside the tokio runtime, once per process.
pub fn init_prometheus(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))?;
    describe_metrics();
    tracing::info!(addr = %addr, "metrics: Prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        SIGNALS_DROPPED,
        "Control signals discarded because the queue was full or the dispatcher had stopped"
    );
    metrics::describe_counter!(
        SIGNAL_DECODE_ERRORS,
        "Control signals that failed to decode and stopped the dispatcher"
    );
    metrics::describe_counter!(SESSIONS, "Sessions requested by the tunnel peer");
    metrics::describe_counter!(SESSION_FAILURES, "Sessions that ended with an error");
    metrics::describe_gauge!(POOL_ACTIVE, "Idle pooled data connections");
}
