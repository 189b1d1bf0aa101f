//! Metrics collection and export for the JIM server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use jim_core::DrainStats;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "jim_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "jim_connections_active";
    pub const CONNECTIONS_REFUSED: &str = "jim_connections_refused_total";
    pub const SESSIONS_ACTIVE: &str = "jim_sessions_active";
    pub const FRAMES_TOTAL: &str = "jim_frames_total";
    pub const MESSAGES_TOTAL: &str = "jim_messages_total";
    pub const QUEUE_DEPTH: &str = "jim_queue_depth";
    pub const EVICTIONS_TOTAL: &str = "jim_evictions_total";
    pub const ERRORS_TOTAL: &str = "jim_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REFUSED,
        "Connections refused at the connection limit"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of signed-in accounts");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames decoded, by action");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Chat messages, by outcome");
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Chat messages awaiting delivery");
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Connections evicted, by reason");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a connection refused at the limit.
pub fn record_refused() {
    counter!(names::CONNECTIONS_REFUSED).increment(1);
}

/// Record a decoded frame.
pub fn record_frame(action: &'static str) {
    counter!(names::FRAMES_TOTAL, "action" => action).increment(1);
}

/// Record the outcome of one delivery pass.
pub fn record_delivery(stats: DrainStats) {
    if stats.delivered > 0 {
        counter!(names::MESSAGES_TOTAL, "outcome" => "delivered").increment(stats.delivered as u64);
    }
    if stats.dropped > 0 {
        counter!(names::MESSAGES_TOTAL, "outcome" => "dropped").increment(stats.dropped as u64);
    }
}

/// Update queue depth and session count.
pub fn set_state(queue_depth: usize, sessions: usize) {
    gauge!(names::QUEUE_DEPTH).set(queue_depth as f64);
    gauge!(names::SESSIONS_ACTIVE).set(sessions as f64);
}

/// Record an eviction.
pub fn record_eviction(reason: &'static str) {
    counter!(names::EVICTIONS_TOTAL, "reason" => reason).increment(1);
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
