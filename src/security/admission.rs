//! Admission control.
//!
//! # Responsibilities
//! - Compose flood checks, rule lookups and rate windows into one verdict
//! - Create auto-blocks and hand them to the persister
//! - Keep the live auto-block list consistent with the rules file
//!
//! # Order of checks
//! ```text
//! precheck:  SYN flood window → per-IP connection cap
//! check:     whitelist → blocked (operator or auto) → port → minute → hour
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::schema::{FloodConfig, TrackingConfig};
use crate::config::{ReloadOutcome, RuleStore, RulesError};
use crate::observability::logging::{LogThrottle, SECURITY_TARGET};
use crate::observability::metrics;
use crate::security::access_control::ParsedRules;
use crate::security::auto_block::{unix_now, AutoBlockEvent, AutoBlockList, BlockStatus};
use crate::security::flood::{FloodGuard, FloodRejection, IpConnectionGuard};
use crate::security::rate_limit::{RateTracker, SweepReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    Whitelisted,
    Passed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SynFlood { attempts: usize },
    TooManyConnections { active: usize },
    Blocked,
    AutoBlocked { remaining: Duration },
    PortNotAllowed { port: u16 },
    RateLimited { current: usize, limit: usize },
    AutoBlockTriggered { attempts: usize, limit: usize, hours: u64 },
}

impl Rejection {
    pub fn severity(&self) -> Severity {
        match self {
            Self::PortNotAllowed { .. } => Severity::Info,
            _ => Severity::Security,
        }
    }

    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SynFlood { .. } => "syn_flood",
            Self::TooManyConnections { .. } => "too_many_connections",
            Self::Blocked => "blocked",
            Self::AutoBlocked { .. } => "auto_blocked",
            Self::PortNotAllowed { .. } => "port_not_allowed",
            Self::RateLimited { .. } => "rate_limited",
            Self::AutoBlockTriggered { .. } => "ddos_auto_block",
        }
    }

    pub fn log(&self, peer: SocketAddr) {
        metrics::record_rejection(self.reason());
        match self.severity() {
            Severity::Security => tracing::warn!(
                target: SECURITY_TARGET,
                ip = %peer.ip(),
                port = peer.port(),
                reason = self.reason(),
                "Connection rejected: {}", self
            ),
            Severity::Info => tracing::info!(
                target: SECURITY_TARGET,
                ip = %peer.ip(),
                port = peer.port(),
                reason = self.reason(),
                "Connection rejected: {}", self
            ),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SynFlood { attempts } => {
                write!(f, "SYN flood detected ({} attempts in window)", attempts)
            }
            Self::TooManyConnections { active } => {
                write!(f, "too many active connections ({})", active)
            }
            Self::Blocked => write!(f, "blocked by configuration"),
            Self::AutoBlocked { remaining } => {
                write!(f, "auto-blocked ({}s remaining)", remaining.as_secs())
            }
            Self::PortNotAllowed { port } => write!(f, "requested port {} not allowed", port),
            Self::RateLimited { current, limit } => {
                write!(f, "rate limited ({}/{} per minute)", current, limit)
            }
            Self::AutoBlockTriggered {
                attempts,
                limit,
                hours,
            } => write!(
                f,
                "DDoS auto-block for {}h after {} attempts in 1 hour (limit {})",
                hours, attempts, limit
            ),
        }
    }
}

impl From<FloodRejection> for Rejection {
    fn from(rejection: FloodRejection) -> Self {
        match rejection {
            FloodRejection::SynFlood { attempts } => Self::SynFlood { attempts },
            FloodRejection::TooManyConnections { active } => Self::TooManyConnections { active },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow(AllowReason),
    Reject(Rejection),
}

/// Result of one periodic sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rate: SweepReport,
    pub flood_removed: usize,
    pub expired_blocks: usize,
    pub active_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdosStats {
    pub tracked_ips: usize,
    pub active_auto_blocks: usize,
    pub expired_auto_blocks: usize,
}

pub struct AdmissionController {
    store: Arc<RuleStore>,
    rate: RateTracker,
    flood: FloodGuard,
    auto_blocks: AutoBlockList,
    events: UnboundedSender<AutoBlockEvent>,
    throttle: LogThrottle,
}

impl AdmissionController {
    /// Build the controller and restore live auto-blocks recorded in the
    /// current rules.
    pub fn new(
        store: Arc<RuleStore>,
        flood: FloodConfig,
        tracking: TrackingConfig,
        events: UnboundedSender<AutoBlockEvent>,
    ) -> Self {
        let controller = Self {
            flood: FloodGuard::new(flood, tracking.max_tracked_ips),
            rate: RateTracker::new(tracking),
            auto_blocks: AutoBlockList::new(),
            store,
            events,
            throttle: LogThrottle::per_minute(),
        };
        controller.reconcile_auto_blocks();
        controller
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Flood and connection-cap check, run before the request is read.
    pub fn precheck(&self, ip: IpAddr, now: Instant) -> Result<IpConnectionGuard, Rejection> {
        self.flood
            .admit(ip.to_canonical(), now)
            .map_err(Rejection::from)
    }

    /// Rule and rate check for a client asking for `port`.
    pub fn check(&self, ip: IpAddr, port: u16, now: Instant) -> Verdict {
        let ip = ip.to_canonical();
        let snapshot = self.store.snapshot();

        if snapshot.parsed.is_whitelisted(ip) {
            return Verdict::Allow(AllowReason::Whitelisted);
        }

        if let Some(rejection) = self.denial_with(&snapshot.parsed, ip, now) {
            return Verdict::Reject(rejection);
        }

        if !snapshot.parsed.is_port_allowed(port) {
            return Verdict::Reject(Rejection::PortNotAllowed { port });
        }

        let rules = &snapshot.rules;
        let minute_limit = limit(rules.max_attempts_per_minute);
        let current = self.rate.record_minute(ip, now);
        if current > minute_limit {
            return Verdict::Reject(Rejection::RateLimited {
                current,
                limit: minute_limit,
            });
        }

        let hour_limit = limit(rules.max_attempts_per_hour);
        let attempts = self.rate.record_hour(ip, now);
        if attempts > hour_limit && rules.auto_block_enabled {
            let hours = u64::try_from(rules.auto_block_duration_hours).unwrap_or(1).max(1);
            self.auto_block(ip, now, Duration::from_secs(hours.saturating_mul(3600)));
            return Verdict::Reject(Rejection::AutoBlockTriggered {
                attempts,
                limit: hour_limit,
                hours,
            });
        }
        if attempts * 4 > hour_limit * 3 && self.throttle.should_log(&format!("hourly:{}", ip)) {
            tracing::warn!(
                target: SECURITY_TARGET,
                %ip,
                attempts,
                limit = hour_limit,
                "High traffic from IP approaching hourly limit"
            );
        }

        Verdict::Allow(AllowReason::Passed)
    }

    /// Whether `ip` is denied by an operator block or a live auto-block.
    pub fn denial(&self, ip: IpAddr, now: Instant) -> Option<Rejection> {
        let snapshot = self.store.snapshot();
        self.denial_with(&snapshot.parsed, ip.to_canonical(), now)
    }

    fn denial_with(&self, parsed: &ParsedRules, ip: IpAddr, now: Instant) -> Option<Rejection> {
        if parsed.is_blocked(ip) {
            return Some(Rejection::Blocked);
        }
        match self.auto_blocks.status(ip, now) {
            BlockStatus::Active { remaining } => Some(Rejection::AutoBlocked { remaining }),
            BlockStatus::Expired => {
                tracing::info!(target: SECURITY_TARGET, %ip, "Auto-block expired");
                self.emit(AutoBlockEvent::Expired { ip });
                None
            }
            BlockStatus::NotBlocked => None,
        }
    }

    fn auto_block(&self, ip: IpAddr, now: Instant, duration: Duration) {
        let entry = self.auto_blocks.insert(ip, now, duration);
        metrics::record_auto_blocks(self.auto_blocks.len());
        self.emit(AutoBlockEvent::Blocked {
            ip,
            until_unix: entry.expires_unix,
        });
    }

    fn emit(&self, event: AutoBlockEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(?event, "Auto-block persister is gone; event dropped");
        }
    }

    /// Poll the rules file and, if it changed, reconcile the auto-block list.
    pub fn refresh_rules(&self) -> ReloadOutcome {
        let outcome = self.store.reload();
        if outcome == ReloadOutcome::Reloaded {
            self.reconcile_auto_blocks();
        }
        outcome
    }

    fn reconcile_auto_blocks(&self) {
        let snapshot = self.store.snapshot();
        let report = self.auto_blocks.reconcile(
            &snapshot.rules.auto_block_expiry,
            Instant::now(),
            unix_now(),
        );

        if report.restored > 0 || report.dropped > 0 {
            tracing::info!(
                target: SECURITY_TARGET,
                restored = report.restored,
                lifted = report.dropped,
                "Auto-block list synchronised with rules file"
            );
        }
        for ip in report.stale {
            self.emit(AutoBlockEvent::Expired { ip });
        }
        metrics::record_auto_blocks(self.auto_blocks.len());
    }

    /// Mirror one auto-block event into the rules file. Blocking I/O.
    pub fn apply_block_event(&self, event: AutoBlockEvent) -> Result<(), RulesError> {
        match event {
            AutoBlockEvent::Blocked { ip, until_unix } => {
                let key = ip.to_string();
                self.store.update(|rules| {
                    let operator_owned = rules.blocked_ips.contains(&key)
                        && !rules.auto_block_expiry.contains_key(&key);
                    if operator_owned {
                        return false;
                    }
                    rules.block(&key);
                    rules.auto_block_expiry.insert(key.clone(), until_unix);
                    true
                })?;
                self.auto_blocks.mark_persisted(ip);
                tracing::info!(target: SECURITY_TARGET, %ip, until_unix, "Auto-block persisted");
            }
            AutoBlockEvent::Expired { ip } => {
                if self.auto_blocks.get(ip).is_some() {
                    // Blocked again since; the newer record stays.
                    return Ok(());
                }
                let key = ip.to_string();
                let removed = self.store.update(|rules| {
                    if rules.auto_block_expiry.remove(&key).is_none() {
                        return false;
                    }
                    rules.blocked_ips.retain(|b| b != &key);
                    true
                })?;
                if removed {
                    tracing::info!(target: SECURITY_TARGET, %ip, "Expired auto-block removed from rules");
                }
            }
        }
        Ok(())
    }

    /// Prune rate windows, flood windows and lapsed auto-blocks.
    pub fn sweep(&self, now: Instant) -> MaintenanceReport {
        let rate = self.rate.sweep(now);
        let flood_removed = self.flood.sweep(now);

        let expired = self.auto_blocks.sweep(now);
        for &ip in &expired {
            tracing::info!(target: SECURITY_TARGET, %ip, "Auto-block expired");
            self.emit(AutoBlockEvent::Expired { ip });
        }

        self.throttle.prune(now);

        let active_blocks = self.auto_blocks.len();
        metrics::record_tracked_ips(rate.tracked_ips);
        metrics::record_auto_blocks(active_blocks);

        MaintenanceReport {
            rate,
            flood_removed,
            expired_blocks: expired.len(),
            active_blocks,
        }
    }

    pub fn stats(&self, now: Instant) -> DdosStats {
        let (active_auto_blocks, expired_auto_blocks) = self.auto_blocks.counts(now);
        DdosStats {
            tracked_ips: self.rate.tracked_ips(),
            active_auto_blocks,
            expired_auto_blocks,
        }
    }

    pub fn active_connections_for(&self, ip: IpAddr) -> usize {
        self.flood.active_for(ip.to_canonical())
    }
}

fn limit(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0).max(1)
}
