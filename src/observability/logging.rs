//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Mirror logs into a daily-rotated file when a log directory is set
//! - Throttle repeated warnings
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via `RUST_LOG`, defaulting to `gatekeeper=info`
//! - The file is written from a background thread; the returned guard must
//!   live until exit or buffered lines are lost

use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::schema::{LogFormat, ObservabilityConfig};

/// Target for allow/deny decisions and auto-block actions.
pub const SECURITY_TARGET: &str = "gatekeeper::security";

const DEFAULT_FILTER: &str = "gatekeeper=info";
const LOG_FILE_PREFIX: &str = "firewall";

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(config: &ObservabilityConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let stdout = match config.log_format {
        LogFormat::Pretty => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    let mut guard = None;
    let mut file_error = None;
    let file = match config.log_dir.as_deref().map(file_appender) {
        Some(Ok(appender)) => {
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        Some(Err(e)) => {
            file_error = Some(e);
            None
        }
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "Cannot open log directory, logging to stdout only");
    }
    guard
}

/// `firewall.YYYY-MM-DD.log` under `dir`, switching files at midnight UTC.
/// The directory is created if missing.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
}

/// Lets one message per key through every `interval`.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: DashMap<String, Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: DashMap::new(),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    pub fn should_log_at(&self, key: &str, now: Instant) -> bool {
        match self.last.get_mut(key) {
            Some(mut last) => {
                if now.saturating_duration_since(*last) >= self.interval {
                    *last = now;
                    true
                } else {
                    false
                }
            }
            None => {
                self.last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop keys whose interval has passed. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.last.len();
        self.last
            .retain(|_, last| now.saturating_duration_since(*last) < self.interval);
        before.saturating_sub(self.last.len())
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    /// Forget `key` so its next occurrence is logged immediately.
    pub fn reset(&self, key: &str) {
        self.last.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_one_per_interval() {
        let throttle = LogThrottle::per_minute();
        let start = Instant::now();

        assert!(throttle.should_log_at("parse", start));
        assert!(!throttle.should_log_at("parse", start + Duration::from_secs(30)));
        assert!(throttle.should_log_at("other", start + Duration::from_secs(30)));
        assert!(throttle.should_log_at("parse", start + Duration::from_secs(61)));
    }

    #[test]
    fn prune_forgets_lapsed_keys() {
        let throttle = LogThrottle::per_minute();
        let start = Instant::now();
        assert!(throttle.should_log_at("a", start));
        assert!(throttle.should_log_at("b", start + Duration::from_secs(50)));

        assert_eq!(throttle.prune(start + Duration::from_secs(70)), 1);
        assert_eq!(throttle.len(), 1);
        assert!(!throttle.should_log_at("b", start + Duration::from_secs(70)));
    }

    #[test]
    fn reset_reopens_key() {
        let throttle = LogThrottle::per_minute();
        let start = Instant::now();
        assert!(throttle.should_log_at("missing", start));
        throttle.reset("missing");
        assert!(throttle.should_log_at("missing", start));
    }

    #[test]
    fn file_log_lands_in_dated_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("firewall");
        let (mut writer, guard) =
            tracing_appender::non_blocking(file_appender(&log_dir).unwrap());
        writer.write_all(b"Gatekeeper listening\n").unwrap();
        // Dropping the guard flushes the background writer.
        drop(guard);

        let files: Vec<_> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("firewall.") && name.ends_with(".log"), "{}", name);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert!(content.contains("Gatekeeper listening"));
    }
}
