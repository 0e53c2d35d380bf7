//! Configuration schema definitions.
//!
//! Two kinds of configuration live here:
//! - [`RuleSet`]: the operator-editable JSON policy file (hot-reloaded).
//! - [`GatekeeperConfig`]: process settings read once from the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ALLOWED_PORTS: [i64; 2] = [80, 443];
pub const DEFAULT_MAX_ATTEMPTS_PER_MINUTE: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS_PER_HOUR: i64 = 100;
pub const DEFAULT_AUTO_BLOCK_DURATION_HOURS: i64 = 24;
/// Ten years.
pub const MAX_AUTO_BLOCK_DURATION_HOURS: i64 = 87_600;

/// Firewall policy as stored in `rules.json`.
///
/// Numeric fields are signed on the wire so that hand-edited negative values
/// parse and get backfilled instead of rejecting the whole file. See
/// [`crate::config::validation::normalize_rules`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleSet {
    /// Addresses or CIDR ranges that are always rejected.
    pub blocked_ips: Vec<String>,

    /// Addresses or CIDR ranges that bypass every other check.
    pub whitelist: Vec<String>,

    /// Destination ports (from the `Host:` header) that may be forwarded.
    pub allowed_ports: Vec<i64>,

    pub max_attempts_per_minute: i64,

    pub max_attempts_per_hour: i64,

    pub auto_block_enabled: bool,

    pub auto_block_duration_hours: i64,

    /// Entries of `blocked_ips` owned by the auto-blocker, mapped to the unix
    /// time (seconds) at which they lapse.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub auto_block_expiry: BTreeMap<String, u64>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            blocked_ips: Vec::new(),
            whitelist: Vec::new(),
            allowed_ports: DEFAULT_ALLOWED_PORTS.to_vec(),
            max_attempts_per_minute: DEFAULT_MAX_ATTEMPTS_PER_MINUTE,
            max_attempts_per_hour: DEFAULT_MAX_ATTEMPTS_PER_HOUR,
            auto_block_enabled: true,
            auto_block_duration_hours: DEFAULT_AUTO_BLOCK_DURATION_HOURS,
            auto_block_expiry: BTreeMap::new(),
        }
    }
}

impl RuleSet {
    /// Add `ip` to the block list. Returns false if it was already there.
    pub fn block(&mut self, ip: &str) -> bool {
        if self.blocked_ips.iter().any(|b| b == ip) {
            return false;
        }
        self.blocked_ips.push(ip.to_string());
        true
    }

    /// Remove `ip` from the block list and forget any auto-block record.
    pub fn unblock(&mut self, ip: &str) -> bool {
        let before = self.blocked_ips.len();
        self.blocked_ips.retain(|b| b != ip);
        let expiry_removed = self.auto_block_expiry.remove(ip).is_some();
        before != self.blocked_ips.len() || expiry_removed
    }
}

/// Root process configuration.
#[derive(Debug, Clone, Default)]
pub struct GatekeeperConfig {
    pub listener: ListenerConfig,
    pub upstream: UpstreamConfig,
    pub rules: RulesConfig,
    pub timeouts: TimeoutConfig,
    pub flood: FloodConfig,
    pub tracking: TrackingConfig,
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum concurrent connections; excess connections are dropped.
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn bind_address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            max_connections: 100,
        }
    }
}

/// The single service admitted connections are forwarded to.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl UpstreamConfig {
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "reverse-proxy".to_string(),
            port: 8080,
        }
    }
}

/// Rules file location and poll cadence.
#[derive(Debug, Clone)]
pub struct RulesConfig {
    pub path: String,
    pub reload_interval: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: "/var/log/shared/firewall/rules.json".to_string(),
            reload_interval: Duration::from_secs(1),
        }
    }
}

/// Deadlines for every blocking network operation.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Total time allowed to receive the request line and headers.
    pub header_read: Duration,
    /// Upstream connect timeout.
    pub connect: Duration,
    /// Per-direction read/write idle timeout while forwarding.
    pub idle: Duration,
    /// Absolute limit on the forwarding phase of one connection, however
    /// steadily bytes keep arriving.
    pub max_forward: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_read: Duration::from_secs(5),
            connect: Duration::from_secs(5),
            idle: Duration::from_secs(10),
            max_forward: Duration::from_secs(300),
        }
    }
}

/// SYN-flood heuristics applied before any rule lookup.
#[derive(Debug, Clone)]
pub struct FloodConfig {
    pub window: Duration,
    pub max_attempts_per_window: usize,
    pub max_connections_per_ip: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_attempts_per_window: 10,
            max_connections_per_ip: 5,
        }
    }
}

/// Memory bounds and sweep cadence for per-IP tracking.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub max_tracked_ips: usize,
    /// Above this many tracked IPs the sweep shrinks the minute window.
    pub force_cleanup_threshold: usize,
    pub forced_minute_window: Duration,
    pub cleanup_interval: Duration,
    /// Emit DDoS statistics every N sweeps.
    pub stats_every: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_tracked_ips: 10_000,
            force_cleanup_threshold: 8_000,
            forced_minute_window: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            stats_every: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Prometheus exporter bind address; disabled when `None`.
    pub metrics_address: Option<String>,
    /// Directory for the daily-rotated `firewall.log`; stdout only when `None`.
    pub log_dir: Option<PathBuf>,
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
