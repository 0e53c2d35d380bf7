//! Per-IP minute and hour attempt tracking.
//!
//! The tracker only counts. Limits live in the rules and are compared by
//! [`crate::security::admission::AdmissionController`].

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::schema::TrackingConfig;
use crate::security::window::WindowMap;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(3600);

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub minute_removed: usize,
    pub hour_removed: usize,
    pub evicted: usize,
    pub tracked_ips: usize,
    /// The minute window was shrunk because the map was above the high-water mark.
    pub forced: bool,
}

#[derive(Debug)]
pub struct RateTracker {
    minute: WindowMap,
    hour: WindowMap,
    tracking: TrackingConfig,
}

impl RateTracker {
    pub fn new(tracking: TrackingConfig) -> Self {
        Self {
            minute: WindowMap::new(MINUTE, tracking.max_tracked_ips),
            hour: WindowMap::new(HOUR, tracking.max_tracked_ips),
            tracking,
        }
    }

    pub fn record_minute(&self, ip: IpAddr, now: Instant) -> usize {
        self.minute.record(ip, now)
    }

    pub fn record_hour(&self, ip: IpAddr, now: Instant) -> usize {
        self.hour.record(ip, now)
    }

    pub fn minute_count(&self, ip: IpAddr, now: Instant) -> usize {
        self.minute.count(ip, now)
    }

    pub fn hour_count(&self, ip: IpAddr, now: Instant) -> usize {
        self.hour.count(ip, now)
    }

    pub fn tracked_ips(&self) -> usize {
        self.minute.len().max(self.hour.len())
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let forced = self.tracked_ips() > self.tracking.force_cleanup_threshold;
        let minute_span = if forced {
            self.tracking.forced_minute_window
        } else {
            MINUTE
        };

        let minute_removed = self.minute.sweep(now, minute_span);
        let hour_removed = self.hour.sweep(now, HOUR);
        let evicted = self.minute.trim() + self.hour.trim();

        SweepReport {
            minute_removed,
            hour_removed,
            evicted,
            tracked_ips: self.tracked_ips(),
            forced,
        }
    }
}
