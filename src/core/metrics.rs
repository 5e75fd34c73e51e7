// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! Metrics are registered once globally, lazily, on first access.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_gauge, Gauge, IntCounter, IntGauge,
    TextEncoder,
};

/// Number of client websocket connections currently attached to this
/// instance (one Session Actor per connection).
pub static CONNECTED_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "perimeterd_connected_sessions",
        "Number of client sessions currently connected."
    )
    .unwrap()
});

/// Total client connections accepted since startup.
pub static SESSIONS_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "perimeterd_sessions_accepted_total",
        "Total number of client sessions accepted."
    )
    .unwrap()
});

/// Total client sessions torn down (connection closed, revoked, or errored).
pub static SESSIONS_CLOSED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "perimeterd_sessions_closed_total",
        "Total number of client sessions closed."
    )
    .unwrap()
});

/// Replication lag observed by the Replication Connection (§4.2), in
/// seconds behind the primary's current WAL position.
pub static REPLICATION_LAG_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "perimeterd_replication_lag_seconds",
        "Replication lag behind the primary, in seconds."
    )
    .unwrap()
});

/// 1 when the Replication Connection is streaming, 0 otherwise — tracks
/// `ConnectionState::Streaming` vs. everything else (§4.2).
pub static REPLICATION_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "perimeterd_replication_connected",
        "Whether the replication connection is currently streaming (1) or not (0)."
    )
    .unwrap()
});

/// Current depth of the Change Bus's broadcast channel, sampled from the
/// slowest subscriber's lag (§4.4) — a proxy for how far behind a Session
/// Actor is falling relative to the incoming change stream.
pub static CHANGE_BUS_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "perimeterd_change_bus_queue_depth",
        "Number of buffered changes on the change bus's broadcast channel."
    )
    .unwrap()
});

/// Total flow handshakes that resolved successfully (§4.8).
pub static FLOW_HANDSHAKES_SUCCEEDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "perimeterd_flow_handshakes_succeeded_total",
        "Total number of flow handshakes that completed successfully."
    )
    .unwrap()
});

/// Total flow handshakes that failed, for any reason (offline, already in
/// flight, denied) (§4.8).
pub static FLOW_HANDSHAKES_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "perimeterd_flow_handshakes_failed_total",
        "Total number of flow handshakes that failed."
    )
    .unwrap()
});

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
