//! Metrics recorder initialization.

use {anyhow::Result, tracing::info};

/// Handle to the installed recorder, used to render the exposition text.
#[derive(Clone)]
pub struct MetricsHandle {
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Configuration for the metrics system.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorderConfig {
    /// Global labels to add to all metrics
    pub global_labels: Vec<(String, String)>,
}

/// Install the Prometheus recorder. Call once at startup; a second install
/// in the same process fails.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or bucket
/// configuration is rejected.
pub fn init_metrics(config: MetricsRecorderConfig) -> Result<MetricsHandle> {
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    const DURATION_BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let mut builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Suffix("_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )?;

    for (key, value) in config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let handle = builder.install_recorder()?;
    describe_all();
    info!("prometheus metrics recorder installed");
    Ok(MetricsHandle {
        prometheus_handle: handle,
    })
}

/// Register HELP text for every exported metric.
fn describe_all() {
    use {
        crate::definitions::{auth, broadcast, conn, http, server, subscription},
        metrics::{describe_counter, describe_gauge, describe_histogram},
    };

    describe_counter!(conn::CONNECTIONS_TOTAL, "Total sockets that completed a handshake");
    describe_gauge!(conn::CONNECTIONS_ACTIVE, "Currently connected sockets");
    describe_gauge!(conn::CONNECTIONS_PEAK, "High-water mark of concurrent sockets");
    describe_counter!(conn::CONNECTIONS_FAILED_TOTAL, "Handshakes that failed");
    describe_counter!(conn::CONNECTIONS_DROPPED_TOTAL, "Sockets dropped by the server");
    describe_counter!(auth::VERIFICATIONS_TOTAL, "Credential verification attempts");
    describe_counter!(broadcast::EVENTS_TOTAL, "Broadcast RPCs dispatched");
    describe_counter!(broadcast::DELIVERIES_TOTAL, "Per-subscriber deliveries enqueued");
    describe_counter!(broadcast::FAILURES_TOTAL, "Deliveries dropped");
    describe_counter!(subscription::SUBSCRIBES_TOTAL, "Subscriptions ever recorded");
    describe_gauge!(subscription::SUBSCRIPTIONS_ACTIVE, "Currently active subscriptions");
    describe_counter!(http::REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(http::REQUEST_DURATION_SECONDS, "HTTP request duration");
    describe_counter!(http::SLOW_REQUESTS_TOTAL, "Requests slower than the slow threshold");
    describe_gauge!(http::REQUESTS_IN_FLIGHT, "Currently in-flight HTTP requests");
    describe_gauge!(server::UPTIME_SECONDS, "Seconds since startup");
}
