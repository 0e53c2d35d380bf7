//! Time-limited automatic blocks.
//!
//! Live blocks are kept in memory and checked on every connection. Each
//! block is also mirrored into the rules file (`blocked_ips` plus
//! `auto_block_expiry`) by a background persister so it survives restarts.
//! Expired blocks are removed lazily on lookup and by the periodic sweep.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Longest block the list will hold, whatever the rules ask for.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoBlockEntry {
    pub expires_at: Instant,
    pub expires_unix: u64,
    /// The rules file already records this block.
    pub persisted: bool,
}

/// Change to mirror into the rules file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoBlockEvent {
    Blocked { ip: IpAddr, until_unix: u64 },
    Expired { ip: IpAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    NotBlocked,
    Active { remaining: Duration },
    /// The block lapsed and was just removed.
    Expired,
}

/// What a reconcile pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restored: usize,
    pub dropped: usize,
    /// File records that lapsed while nobody held them in memory.
    pub stale: Vec<IpAddr>,
}

#[derive(Debug, Default)]
pub struct AutoBlockList {
    entries: DashMap<IpAddr, AutoBlockEntry>,
}

impl AutoBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `ip` for `duration` starting at `now`.
    pub fn insert(&self, ip: IpAddr, now: Instant, duration: Duration) -> AutoBlockEntry {
        let duration = duration.min(MAX_BLOCK_DURATION);
        let entry = AutoBlockEntry {
            expires_at: instant_after(now, duration),
            expires_unix: unix_now().saturating_add(duration.as_secs()),
            persisted: false,
        };
        self.entries.insert(ip, entry);
        entry
    }

    pub fn status(&self, ip: IpAddr, now: Instant) -> BlockStatus {
        let expires_at = match self.entries.get(&ip) {
            Some(entry) => entry.expires_at,
            None => return BlockStatus::NotBlocked,
        };

        if now < expires_at {
            return BlockStatus::Active {
                remaining: expires_at - now,
            };
        }

        // Only remove the entry we looked at; a fresh block may have replaced it.
        match self
            .entries
            .remove_if(&ip, |_, entry| now >= entry.expires_at)
        {
            Some(_) => BlockStatus::Expired,
            None => BlockStatus::NotBlocked,
        }
    }

    pub fn mark_persisted(&self, ip: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&ip) {
            entry.persisted = true;
        }
    }

    pub fn get(&self, ip: IpAddr) -> Option<AutoBlockEntry> {
        self.entries.get(&ip).map(|entry| *entry)
    }

    /// Remove every lapsed block and return the IPs.
    pub fn sweep(&self, now: Instant) -> Vec<IpAddr> {
        let mut expired = Vec::new();
        self.entries.retain(|ip, entry| {
            if now >= entry.expires_at {
                expired.push(*ip);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Bring memory in line with the `auto_block_expiry` map of a freshly
    /// loaded rules file.
    ///
    /// Live file records missing from memory are restored (a restart, or
    /// another writer). Persisted entries the file no longer lists were
    /// lifted by an operator and are dropped. Unpersisted entries are kept:
    /// their write is still queued.
    pub fn reconcile(
        &self,
        expiry: &BTreeMap<String, u64>,
        now: Instant,
        now_unix: u64,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut listed = Vec::with_capacity(expiry.len());

        for (raw, &until) in expiry {
            let Ok(ip) = raw.parse::<IpAddr>() else {
                continue;
            };
            let ip = ip.to_canonical();
            listed.push(ip);

            if until <= now_unix {
                if !self.entries.contains_key(&ip) {
                    report.stale.push(ip);
                }
                continue;
            }

            if !self.entries.contains_key(&ip) {
                self.entries.insert(
                    ip,
                    AutoBlockEntry {
                        expires_at: instant_after(now, Duration::from_secs(until - now_unix)),
                        expires_unix: until,
                        persisted: true,
                    },
                );
                report.restored += 1;
            }
        }

        self.entries.retain(|ip, entry| {
            let keep = !entry.persisted || listed.contains(ip);
            if !keep {
                report.dropped += 1;
            }
            keep
        });

        report
    }

    /// Live (unexpired) and lapsed-but-not-yet-swept counts.
    pub fn counts(&self, now: Instant) -> (usize, usize) {
        self.entries
            .iter()
            .fold((0, 0), |(active, expired), entry| {
                if now < entry.expires_at {
                    (active + 1, expired)
                } else {
                    (active, expired + 1)
                }
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `now + duration`, clamped to [`MAX_BLOCK_DURATION`] and to what the
/// platform clock can represent.
fn instant_after(now: Instant, duration: Duration) -> Instant {
    let mut duration = duration.min(MAX_BLOCK_DURATION);
    loop {
        if let Some(at) = now.checked_add(duration) {
            return at;
        }
        duration /= 2;
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, n])
    }

    #[test]
    fn block_lapses_lazily() {
        let list = AutoBlockList::new();
        let start = Instant::now();
        list.insert(ip(1), start, Duration::from_secs(3600));

        assert!(matches!(
            list.status(ip(1), start + Duration::from_secs(10)),
            BlockStatus::Active { .. }
        ));
        assert_eq!(
            list.status(ip(1), start + Duration::from_secs(3601)),
            BlockStatus::Expired
        );
        assert!(list.is_empty());
        assert_eq!(
            list.status(ip(1), start + Duration::from_secs(3602)),
            BlockStatus::NotBlocked
        );
    }

    #[test]
    fn sweep_returns_expired() {
        let list = AutoBlockList::new();
        let start = Instant::now();
        list.insert(ip(1), start, Duration::from_secs(60));
        list.insert(ip(2), start, DAY);

        assert_eq!(list.counts(start + Duration::from_secs(61)), (1, 1));
        assert_eq!(list.sweep(start + Duration::from_secs(61)), vec![ip(1)]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn absurd_durations_are_clamped() {
        let list = AutoBlockList::new();
        let now = Instant::now();

        let entry = list.insert(ip(1), now, Duration::from_secs(u64::MAX));
        assert_eq!(entry.expires_at, now + MAX_BLOCK_DURATION);
        assert!(matches!(list.status(ip(1), now), BlockStatus::Active { .. }));

        let mut expiry = BTreeMap::new();
        expiry.insert(ip(2).to_string(), u64::MAX);
        let report = list.reconcile(&expiry, now, 1_700_000_000);
        assert_eq!(report.restored, 1);
        let restored = list.get(ip(2)).unwrap();
        assert_eq!(restored.expires_at, now + MAX_BLOCK_DURATION);
        assert_eq!(restored.expires_unix, u64::MAX);
    }

    #[test]
    fn reconcile_restores_and_drops() {
        let list = AutoBlockList::new();
        let now = Instant::now();
        let now_unix = 1_700_000_000;

        // Persisted entry the operator removed from the file.
        list.insert(ip(1), now, DAY);
        list.mark_persisted(ip(1));
        // Entry whose write is still queued.
        list.insert(ip(2), now, DAY);

        let mut expiry = BTreeMap::new();
        expiry.insert(ip(3).to_string(), now_unix + 600);
        expiry.insert(ip(4).to_string(), now_unix - 5);
        expiry.insert("junk".to_string(), now_unix + 600);

        let report = list.reconcile(&expiry, now, now_unix);
        assert_eq!(report.restored, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.stale, vec![ip(4)]);

        assert!(list.get(ip(1)).is_none());
        assert!(list.get(ip(2)).is_some());
        let restored = list.get(ip(3)).unwrap();
        assert!(restored.persisted);
        assert_eq!(restored.expires_unix, now_unix + 600);
        assert_eq!(restored.expires_at, now + Duration::from_secs(600));
    }
}
