//! Metrics collection and export for Tandem.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const DOCUMENTS_ACTIVE: &str = "tandem_documents_active";
    pub const FRAMES_TOTAL: &str = "tandem_frames_total";
    pub const FRAME_BYTES: &str = "tandem_frame_bytes";
    pub const DECODE_ERRORS_TOTAL: &str = "tandem_decode_errors_total";
    pub const REJECTIONS_TOTAL: &str = "tandem_rejections_total";
    pub const EVICTIONS_TOTAL: &str = "tandem_evictions_total";
    pub const PROCESSING_SECONDS: &str = "tandem_processing_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of attached connections"
    );
    metrics::describe_gauge!(
        names::DOCUMENTS_ACTIVE,
        "Current number of documents with a live hub"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by kind");
    metrics::describe_counter!(names::FRAME_BYTES, "Total bytes of frames by direction");
    metrics::describe_counter!(
        names::DECODE_ERRORS_TOTAL,
        "Inbound frames dropped because they could not be decoded or merged"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Connections rejected at admission, by reason"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted by their hub"
    );
    metrics::describe_histogram!(
        names::PROCESSING_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");

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

/// Record an attached connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a detached connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(kind: &'static str, direction: &'static str, bytes: usize) {
    counter!(names::FRAMES_TOTAL, "kind" => kind, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an inbound frame that was dropped.
pub fn record_decode_error() {
    counter!(names::DECODE_ERRORS_TOTAL).increment(1);
}

/// Record an admission rejection.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record an eviction.
pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Record inbound frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::PROCESSING_SECONDS).record(seconds);
}

/// Update the live document count.
pub fn set_active_documents(count: usize) {
    gauge!(names::DOCUMENTS_ACTIVE).set(count as f64);
}

/// Record a transport error.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_frame("sync", "inbound", 12);
        record_rejection("forbidden");
        set_active_documents(3);
    }
}
