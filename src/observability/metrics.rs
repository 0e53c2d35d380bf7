//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gatekeeper_connections_total` (counter): accepted TCP connections
//! - `gatekeeper_rejections_total` (counter): rejected connections by reason
//! - `gatekeeper_active_connections` (gauge): in-flight handlers
//! - `gatekeeper_tracked_ips` (gauge): IPs with live rate windows
//! - `gatekeeper_auto_blocks_active` (gauge): live auto-blocks
//! - `gatekeeper_rule_reloads_total` (counter): rule reloads by outcome
//! - `gatekeeper_forwarded_bytes_total` (counter): relayed bytes by direction
//!
//! Recording is a no-op until an exporter is installed.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::GatekeeperError;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), GatekeeperError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GatekeeperError::Metrics(e.to_string()))?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection() {
    counter!("gatekeeper_connections_total").increment(1);
}

pub fn record_rejection(reason: &'static str) {
    counter!("gatekeeper_rejections_total", "reason" => reason).increment(1);
}

pub fn record_active_connections(count: usize) {
    gauge!("gatekeeper_active_connections").set(count as f64);
}

pub fn record_tracked_ips(count: usize) {
    gauge!("gatekeeper_tracked_ips").set(count as f64);
}

pub fn record_auto_blocks(count: usize) {
    gauge!("gatekeeper_auto_blocks_active").set(count as f64);
}

pub fn record_rule_reload(outcome: &'static str) {
    counter!("gatekeeper_rule_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_forwarded_bytes(direction: &'static str, bytes: u64) {
    counter!("gatekeeper_forwarded_bytes_total", "direction" => direction).increment(bytes);
}
