// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Gauge, IntCounter, TextEncoder, register_gauge, register_int_counter};

lazy_static! {
    // --- Gauges ---
    /// The number of clients currently connected across all clusters.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("citrine_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of clusters currently registered.
    pub static ref CLUSTER_COUNT: Gauge =
        register_gauge!("citrine_cluster_count", "Number of registered clusters.").unwrap();

    // --- Counters ---
    /// The total number of client connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: IntCounter =
        register_int_counter!("citrine_connections_received_total", "Total number of connections received.").unwrap();
    /// The total number of client connections rejected by the admission cap.
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter =
        register_int_counter!("citrine_connections_rejected_total", "Total number of connections rejected by the max-connections cap.").unwrap();
    /// The total number of successful cluster config swaps.
    pub static ref CLUSTER_CHANGES_TOTAL: IntCounter =
        register_int_counter!("citrine_cluster_changes_total", "Total number of applied cluster config changes.").unwrap();
    /// The total number of cluster config swaps that failed.
    pub static ref CLUSTER_CHANGE_FAILURES_TOTAL: IntCounter =
        register_int_counter!("citrine_cluster_change_failures_total", "Total number of failed cluster config changes.").unwrap();
    /// The total number of failed cluster additions during reload.
    pub static ref ADD_CLUSTER_FAILURES_TOTAL: IntCounter =
        register_int_counter!("citrine_add_cluster_failures_total", "Total number of failed cluster additions.").unwrap();
    /// The total number of reloads skipped because the file failed to load or
    /// the registry would overflow.
    pub static ref CONFIG_LOAD_FAILURES_TOTAL: IntCounter =
        register_int_counter!("citrine_config_load_failures_total", "Total number of rejected or unparseable config reloads.").unwrap();
    /// The total number of reloads refused because they dropped a cluster.
    pub static ref REJECTED_REMOVALS_TOTAL: IntCounter =
        register_int_counter!("citrine_rejected_removals_total", "Total number of reloads refused for attempting cluster removal.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
