//! Prometheus metrics for the Session Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for Session Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event`: signaling event names (~15 values)
//! - `status`: `success` / `error`
//! - `operation`: engine operations (~8 values)
//! - `actor_type`: 3 values (registry, room, connection)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sc_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sc_engine".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set engine call buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Rooms & Peers (Gauges)
// ============================================================================

/// Metric: `sc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_rooms_active").set(count as f64);
}

/// Metric: `sc_peers_active`
///
/// Adjusted by room actors on join (+1) and removal (-1).
pub fn peers_active_delta(delta: f64) {
    gauge!("sc_peers_active").increment(delta);
}

/// Metric: `sc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_connections_active").set(count as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling event.
///
/// Metrics: `sc_signaling_requests_total{event,status}`,
/// `sc_signaling_latency_seconds{event}`
pub fn record_signaling_request(event: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    counter!(
        "sc_signaling_requests_total",
        "event" => event.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("sc_signaling_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Media Engine
// ============================================================================

/// Record the duration of one engine call.
///
/// Metric: `sc_engine_call_duration_seconds{operation}`
pub fn record_engine_call(operation: &str, duration: Duration) {
    histogram!("sc_engine_call_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sc_engine_errors_total{operation}`
pub fn record_engine_error(operation: &str) {
    counter!("sc_engine_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Metric: `sc_worker_deaths_total`
///
/// ALERT: any increment is followed by a process exit.
pub fn record_worker_death() {
    counter!("sc_worker_deaths_total").increment(1);
}

// ============================================================================
// Actors
// ============================================================================

/// Metric: `sc_actor_panics_total{actor_type}`
///
/// ALERT: any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `sc_actor_mailbox_depth{actor_type}`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}
