//! Configuration validation.
//!
//! # Responsibilities
//! - Backfill rule files: empty or invalid fields get defaults instead of
//!   rejecting the whole policy
//! - Validate process settings (ports, hosts, limits) before startup
//!
//! # Design Decisions
//! - Rule normalisation never fails; a parseable file always yields a usable policy
//! - Process validation returns all problems at once, not just the first

use crate::config::env::ConfigError;
use crate::config::schema::{
    GatekeeperConfig, RuleSet, DEFAULT_ALLOWED_PORTS, DEFAULT_AUTO_BLOCK_DURATION_HOURS,
    DEFAULT_MAX_ATTEMPTS_PER_HOUR, DEFAULT_MAX_ATTEMPTS_PER_MINUTE, MAX_AUTO_BLOCK_DURATION_HOURS,
};

/// A field that had to be replaced during normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backfill {
    pub field: &'static str,
    pub reason: String,
}

/// Bring a freshly parsed rule set in line with its invariants.
///
/// Returns the list of fields that were backfilled so the caller can log them.
pub fn normalize_rules(rules: &mut RuleSet) -> Vec<Backfill> {
    let mut backfilled = Vec::new();

    let before = rules.allowed_ports.len();
    rules.allowed_ports.retain(|p| (1..=65535).contains(p));
    rules.allowed_ports.sort_unstable();
    rules.allowed_ports.dedup();
    if rules.allowed_ports.is_empty() {
        rules.allowed_ports = DEFAULT_ALLOWED_PORTS.to_vec();
        backfilled.push(Backfill {
            field: "allowed_ports",
            reason: format!("no valid port among {} entries", before),
        });
    }

    for (field, value, default) in [
        (
            "max_attempts_per_minute",
            &mut rules.max_attempts_per_minute,
            DEFAULT_MAX_ATTEMPTS_PER_MINUTE,
        ),
        (
            "max_attempts_per_hour",
            &mut rules.max_attempts_per_hour,
            DEFAULT_MAX_ATTEMPTS_PER_HOUR,
        ),
        (
            "auto_block_duration_hours",
            &mut rules.auto_block_duration_hours,
            DEFAULT_AUTO_BLOCK_DURATION_HOURS,
        ),
    ] {
        if *value <= 0 {
            backfilled.push(Backfill {
                field,
                reason: format!("{} is not positive", value),
            });
            *value = default;
        }
    }

    if rules.auto_block_duration_hours > MAX_AUTO_BLOCK_DURATION_HOURS {
        backfilled.push(Backfill {
            field: "auto_block_duration_hours",
            reason: format!(
                "{} exceeds the {} hour maximum",
                rules.auto_block_duration_hours, MAX_AUTO_BLOCK_DURATION_HOURS
            ),
        });
        rules.auto_block_duration_hours = MAX_AUTO_BLOCK_DURATION_HOURS;
    }

    for list in [&mut rules.blocked_ips, &mut rules.whitelist] {
        for entry in list.iter_mut() {
            let trimmed = entry.trim();
            if trimmed.len() != entry.len() {
                *entry = trimmed.to_string();
            }
        }
        list.retain(|e| !e.is_empty());
    }

    // An expiry record only means something for an IP that is still blocked.
    let blocked = &rules.blocked_ips;
    rules
        .auto_block_expiry
        .retain(|ip, _| blocked.iter().any(|b| b == ip));

    backfilled
}

/// Validate process configuration.
pub fn validate_config(config: &GatekeeperConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.listener.port == 0 {
        errors.push("FIREWALL_PORT must be 1-65535".to_string());
    }
    if config.upstream.port == 0 {
        errors.push("REVERSE_PROXY_PORT must be 1-65535".to_string());
    }
    if config.upstream.host.trim().is_empty() {
        errors.push("REVERSE_PROXY_IP cannot be empty".to_string());
    }
    if config.listener.max_connections == 0 {
        errors.push("MAX_CONCURRENT_CONNS must be positive".to_string());
    }
    if config.flood.max_connections_per_ip == 0 || config.flood.max_attempts_per_window == 0 {
        errors.push("SYN flood limits must be positive".to_string());
    }
    if config.timeouts.header_read.is_zero()
        || config.timeouts.connect.is_zero()
        || config.timeouts.idle.is_zero()
        || config.timeouts.max_forward.is_zero()
    {
        errors.push("timeouts must be positive".to_string());
    }
    if config.rules.reload_interval.is_zero() || config.tracking.cleanup_interval.is_zero() {
        errors.push("background intervals must be positive".to_string());
    }
    if config.tracking.max_tracked_ips == 0 {
        errors.push("MAX_TRACKED_IPS must be positive".to_string());
    }
    if config.tracking.force_cleanup_threshold > config.tracking.max_tracked_ips {
        errors.push("FORCE_CLEANUP_THRESHOLD must be <= MAX_TRACKED_IPS".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join(", ")))
    }
}
