//! SYN-flood heuristics and per-IP connection caps.
//!
//! Runs before any rule lookup, on every accepted socket. Counts raw accept
//! attempts in a short window and holds a per-IP active connection count
//! released by [`IpConnectionGuard`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::schema::FloodConfig;
use crate::security::window::WindowMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodRejection {
    /// Too many accept attempts inside the flood window.
    SynFlood { attempts: usize },
    /// The IP already holds the maximum number of concurrent connections.
    TooManyConnections { active: usize },
}

#[derive(Debug)]
pub struct FloodGuard {
    attempts: WindowMap,
    active: Arc<DashMap<IpAddr, usize>>,
    config: FloodConfig,
}

impl FloodGuard {
    pub fn new(config: FloodConfig, max_tracked_ips: usize) -> Self {
        Self {
            attempts: WindowMap::new(config.window, max_tracked_ips),
            active: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Record the attempt and, if under both limits, take a connection slot.
    pub fn admit(&self, ip: IpAddr, now: Instant) -> Result<IpConnectionGuard, FloodRejection> {
        let attempts = self.attempts.record(ip, now);
        if attempts > self.config.max_attempts_per_window {
            return Err(FloodRejection::SynFlood { attempts });
        }

        match self.active.entry(ip) {
            Entry::Occupied(mut slot) => {
                let active = *slot.get();
                if active >= self.config.max_connections_per_ip {
                    return Err(FloodRejection::TooManyConnections { active });
                }
                *slot.get_mut() = active + 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(1);
            }
        }

        Ok(IpConnectionGuard {
            ip,
            active: Arc::clone(&self.active),
        })
    }

    pub fn active_for(&self, ip: IpAddr) -> usize {
        self.active.get(&ip).map(|count| *count).unwrap_or(0)
    }

    /// Drop expired flood windows. Returns how many IPs were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        self.attempts.sweep(now, self.attempts.span()) + self.attempts.trim()
    }
}

/// Holds one per-IP connection slot until dropped.
#[derive(Debug)]
pub struct IpConnectionGuard {
    ip: IpAddr,
    active: Arc<DashMap<IpAddr, usize>>,
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.active.entry(self.ip) {
            let remaining = slot.get().saturating_sub(1);
            if remaining == 0 {
                slot.remove();
            } else {
                *slot.get_mut() = remaining;
            }
        }
    }
}
