//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ccrelay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ccrelay_connections_active";
    pub const EVENTS_TOTAL: &str = "ccrelay_events_total";
    pub const FORWARDS_TOTAL: &str = "ccrelay_forwards_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "ccrelay_subscriptions_total";
    pub const EVICTIONS_TOTAL: &str = "ccrelay_heartbeat_evictions_total";
    pub const SILENT_TOPICS_TOTAL: &str = "ccrelay_silent_topics_total";
    pub const ERRORS_TOTAL: &str = "ccrelay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of producer connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of producer connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Producer events received, by kind");
    metrics::describe_counter!(
        names::FORWARDS_TOTAL,
        "Chat-platform sends, by outcome"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of subscribe commands handled"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted for missing a heartbeat"
    );
    metrics::describe_counter!(
        names::SILENT_TOPICS_TOTAL,
        "Topics that lost their last producer"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors, by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
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

/// Record a decoded producer event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}

/// Record the outcome of routing one message.
pub fn record_forwards(delivered: usize, failed: usize) {
    counter!(names::FORWARDS_TOTAL, "outcome" => "delivered").increment(delivered as u64);
    counter!(names::FORWARDS_TOTAL, "outcome" => "failed").increment(failed as u64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record heartbeat evictions.
pub fn record_evictions(count: usize) {
    counter!(names::EVICTIONS_TOTAL).increment(count as u64);
}

/// Record topics that went silent.
pub fn record_silent_topics(count: usize) {
    counter!(names::SILENT_TOPICS_TOTAL).increment(count as u64);
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
