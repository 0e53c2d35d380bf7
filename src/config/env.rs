//! Process configuration from environment variables.
//!
//! Reads a `.env` file if present, then the environment. Every variable has a
//! default; a variable that is set but unparseable is a startup error.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{
    FloodConfig, GatekeeperConfig, ListenerConfig, LogFormat, ObservabilityConfig, RulesConfig,
    TimeoutConfig, TrackingConfig, UpstreamConfig,
};
use crate::config::validation::validate_config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

const DEFAULT_LOG_DIR: &str = "/var/log/shared/firewall";

impl GatekeeperConfig {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            listener: ListenerConfig::from_env()?,
            upstream: UpstreamConfig::from_env()?,
            rules: RulesConfig::from_env()?,
            timeouts: TimeoutConfig::from_env()?,
            flood: FloodConfig::from_env()?,
            tracking: TrackingConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
        };

        validate_config(&config)?;
        Ok(config)
    }
}

impl ListenerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: string_var("FIREWALL_HOST", &defaults.host),
            port: parse_var("FIREWALL_PORT", defaults.port)?,
            max_connections: parse_var("MAX_CONCURRENT_CONNS", defaults.max_connections)?,
        })
    }
}

impl UpstreamConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: string_var("REVERSE_PROXY_IP", &defaults.host),
            port: parse_var("REVERSE_PROXY_PORT", defaults.port)?,
        })
    }
}

impl RulesConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            path: string_var("RULES_FILE", &defaults.path),
            reload_interval: secs_var("RULES_RELOAD_INTERVAL_SECS", defaults.reload_interval)?,
        })
    }
}

impl TimeoutConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            header_read: secs_var("HEADER_TIMEOUT_SECS", defaults.header_read)?,
            connect: secs_var("CONNECT_TIMEOUT_SECS", defaults.connect)?,
            idle: secs_var("IDLE_TIMEOUT_SECS", defaults.idle)?,
            max_forward: secs_var("MAX_FORWARD_SECS", defaults.max_forward)?,
        })
    }
}

impl FloodConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            window: secs_var("SYN_FLOOD_WINDOW_SECS", defaults.window)?,
            max_attempts_per_window: parse_var(
                "SYN_FLOOD_MAX_ATTEMPTS",
                defaults.max_attempts_per_window,
            )?,
            max_connections_per_ip: parse_var(
                "MAX_CONNECTIONS_PER_IP",
                defaults.max_connections_per_ip,
            )?,
        })
    }
}

impl TrackingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_tracked_ips: parse_var("MAX_TRACKED_IPS", defaults.max_tracked_ips)?,
            force_cleanup_threshold: parse_var(
                "FORCE_CLEANUP_THRESHOLD",
                defaults.force_cleanup_threshold,
            )?,
            cleanup_interval: secs_var("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            ..defaults
        })
    }
}

impl ObservabilityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let log_format = match string_var("LOG_FORMAT", "pretty").to_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    reason: format!("{}. Expected 'pretty' or 'json'", other),
                });
            }
        };

        let metrics_address = env::var("METRICS_ADDRESS")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let log_dir = match string_var("LOG_DIR", DEFAULT_LOG_DIR).as_str() {
            "off" | "none" => None,
            dir => Some(PathBuf::from(dir)),
        };

        Ok(Self {
            log_format,
            metrics_address,
            log_dir,
        })
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var: name,
                reason: format!("{:?}: {}", raw, e),
            })
        }
        _ => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}
