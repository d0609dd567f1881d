//! Metrics collection and export for Trellis.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use trellis_core::PublishReport;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "trellis_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "trellis_connections_active";
    pub const MESSAGES_TOTAL: &str = "trellis_messages_total";
    pub const MESSAGES_BYTES: &str = "trellis_messages_bytes";
    pub const DELIVERIES_TOTAL: &str = "trellis_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "trellis_delivery_failures_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "trellis_subscriptions_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "trellis_subscriptions_active";
    pub const REQUESTS_TOTAL: &str = "trellis_requests_total";
    pub const LATENCY_SECONDS: &str = "trellis_latency_seconds";
    pub const ERRORS_TOTAL: &str = "trellis_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Messages handed to subscriber queues"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Messages dropped because a subscriber was full or closed"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of trie registrations"
    );
    metrics::describe_counter!(names::REQUESTS_TOTAL, "Typed requests by kind");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of a publish fan-out.
pub fn record_publish(report: &PublishReport) {
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    if report.dropped > 0 {
        counter!(names::DELIVERY_FAILURES_TOTAL).increment(report.dropped as u64);
    }
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the number of trie registrations.
pub fn set_active_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

/// Record a typed request.
pub fn record_request(kind: u32) {
    counter!(names::REQUESTS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
